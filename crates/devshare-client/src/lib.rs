//! DevShare agent library
//!
//! Exposes a local port through a relay:
//!
//! ```ignore
//! use devshare_client::{AgentConfig, AgentConnector, AgentEvent};
//!
//! let mut connection = AgentConnector::new(AgentConfig::new("ws://localhost:3000/ws", 8080))
//!     .connect()
//!     .await?;
//! println!("registered as {}", connection.public_id());
//!
//! while let Some(AgentEvent::Request { method, path }) = connection.next_event().await? {
//!     println!("{} {}", method, path);
//! }
//! ```

pub mod config;
pub mod connection;
pub mod probe;

pub use config::{default_relay_url, AgentConfig};
pub use connection::{AgentConnection, AgentConnector, AgentEvent, ClientError};
pub use probe::probe;
