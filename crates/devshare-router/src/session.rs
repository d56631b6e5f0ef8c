//! Agent session model

use chrono::{DateTime, Utc};
use devshare_proto::ControlMessage;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Identity of one control channel, unique for the registry's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Outbound half of a live control channel
///
/// Frames are queued to the task that owns the socket. Sending never waits:
/// a full or closed queue drops the frame.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    id: ChannelId,
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlChannel {
    pub fn new(id: ChannelId, tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Best-effort enqueue; returns whether the frame was accepted
    pub fn notify(&self, message: ControlMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Control channel {} backed up, dropping frame", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Control channel {} closed, dropping frame", self.id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Snapshot of a session's request counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub forwarded: u64,
    pub in_flight: usize,
}

/// One connected agent
#[derive(Debug)]
pub struct AgentSession {
    public_id: String,
    local_port: u16,
    channel: ControlChannel,
    registered_at: DateTime<Utc>,
    forwarded: AtomicU64,
    in_flight: AtomicUsize,
}

impl AgentSession {
    pub fn new(public_id: String, local_port: u16, channel: ControlChannel) -> Self {
        Self {
            public_id,
            local_port,
            channel,
            registered_at: Utc::now(),
            forwarded: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Push a frame to the agent without waiting
    pub fn notify(&self, message: ControlMessage) -> bool {
        self.channel.notify(message)
    }

    /// Mark a request as forwarded; the returned guard tracks it while in flight
    pub fn track_request(self: &Arc<Self>) -> InFlightRequest {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightRequest {
            session: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the owning session's in-flight count when dropped
#[derive(Debug)]
pub struct InFlightRequest {
    session: Arc<AgentSession>,
}

impl InFlightRequest {
    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
