//! Public identifier generation

use rand::rngs::OsRng;
use rand::RngCore;

/// Length of generated identifiers (hex characters)
pub const PUBLIC_ID_LEN: usize = 6;

/// Produces candidate public identifiers for newly registered agents
///
/// Implementations only propose identifiers; uniqueness is enforced by the
/// registry, which retries on collision.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Generates lowercase hex identifiers from the OS random source
///
/// The output is a valid DNS label, e.g. `a1b2c3`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; PUBLIC_ID_LEN / 2];
        OsRng.fill_bytes(&mut bytes);

        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
