//! Registry of live agent sessions
//!
//! The single source of truth for routing. Keys are public identifiers; a
//! reverse index from control channel to identifier lets disconnect handlers
//! clean up without knowing which identifier they were assigned.

use crate::session::{AgentSession, ChannelId, ControlChannel};
use crate::subdomain::{IdGenerator, RandomIdGenerator};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devshare_proto::ControlMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Default number of identifier draws before registration gives up
pub const DEFAULT_MAX_ATTEMPTS: usize = 16;

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No free public identifier after {attempts} attempts")]
    RegistrationExhausted { attempts: usize },

    #[error("Invalid local port: {0}")]
    InvalidPort(u16),

    #[error("Control channel {0} is already registered")]
    ChannelAlreadyRegistered(ChannelId),
}

/// Concurrent map from public identifier to agent session
pub struct Registry {
    sessions: DashMap<String, Arc<AgentSession>>,
    by_channel: DashMap<ChannelId, String>,
    generator: Arc<dyn IdGenerator>,
    max_attempts: usize,
    next_channel_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(RandomIdGenerator))
    }

    pub fn with_generator(generator: Arc<dyn IdGenerator>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_channel: DashMap::new(),
            generator,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_channel_id: AtomicU64::new(1),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Allocate a new control channel and the receiver its socket task drains
    pub fn open_channel(&self, capacity: usize) -> (ControlChannel, mpsc::Receiver<ControlMessage>) {
        let id = ChannelId(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ControlChannel::new(id, tx), rx)
    }

    /// Register an agent under a freshly generated public identifier
    ///
    /// Insertion is insert-if-absent: a generated identifier that is already
    /// held by a live session is discarded and a new one drawn.
    pub fn register_agent(
        &self,
        local_port: u16,
        channel: ControlChannel,
    ) -> Result<Arc<AgentSession>, RegistryError> {
        if local_port == 0 {
            return Err(RegistryError::InvalidPort(local_port));
        }

        if self.by_channel.contains_key(&channel.id()) {
            return Err(RegistryError::ChannelAlreadyRegistered(channel.id()));
        }

        for attempt in 1..=self.max_attempts {
            let public_id = self.generator.generate();

            match self.sessions.entry(public_id.clone()) {
                Entry::Occupied(_) => {
                    debug!(
                        "Public id {} is taken (attempt {}/{})",
                        public_id, attempt, self.max_attempts
                    );
                }
                Entry::Vacant(slot) => {
                    let session = Arc::new(AgentSession::new(public_id.clone(), local_port, channel));
                    slot.insert(Arc::clone(&session));
                    self.by_channel.insert(session.channel_id(), public_id);

                    info!(
                        public_id = %session.public_id(),
                        port = local_port,
                        channel = %session.channel_id(),
                        "Registered agent"
                    );
                    return Ok(session);
                }
            }
        }

        Err(RegistryError::RegistrationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Lookup a live session by public identifier
    pub fn lookup(&self, public_id: &str) -> Option<Arc<AgentSession>> {
        let found = self.sessions.get(public_id).map(|entry| Arc::clone(entry.value()));
        trace!("Lookup {} -> {}", public_id, found.is_some());
        found
    }

    /// Remove a session by public identifier (idempotent)
    pub fn unregister(&self, public_id: &str) -> Option<Arc<AgentSession>> {
        let (_, session) = self.sessions.remove(public_id)?;
        self.by_channel
            .remove_if(&session.channel_id(), |_, id| id == public_id);

        Self::log_removal(&session);
        Some(session)
    }

    /// Remove whichever session owns `channel_id` (idempotent)
    pub fn unregister_by_session(&self, channel_id: ChannelId) -> Option<Arc<AgentSession>> {
        let (_, public_id) = self.by_channel.remove(&channel_id)?;
        let (_, session) = self
            .sessions
            .remove_if(&public_id, |_, session| session.channel_id() == channel_id)?;

        Self::log_removal(&session);
        Some(session)
    }

    fn log_removal(session: &AgentSession) {
        let stats = session.stats();
        info!(
            public_id = %session.public_id(),
            channel = %session.channel_id(),
            forwarded = stats.forwarded,
            in_flight = stats.in_flight,
            "Unregistered agent"
        );
    }

    /// Check if a public identifier is currently bound
    pub fn exists(&self, public_id: &str) -> bool {
        self.sessions.contains_key(public_id)
    }

    /// All live public identifiers (no ordering)
    pub fn public_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
