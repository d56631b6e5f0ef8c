//! Control channel protocol driver
//!
//! One task per connected agent. The task walks the channel through
//! `unregistered -> registered -> closed`, forwards queued notifications to
//! the socket, and on every exit path removes the session from the registry.

use crate::transport::{ChannelError, ControlTransport, Inbound};
use devshare_proto::{AgentMessage, ControlMessage, DecodeError};
use devshare_router::{AgentSession, ControlChannel, Registry, RegistryError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing and buffering knobs for control channels
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// How long a fresh channel may stay unregistered
    pub registration_timeout: Duration,
    /// Relay -> agent ping cadence (`None` disables pings)
    pub ping_interval: Option<Duration>,
    /// Close a registered channel after this long without inbound frames
    pub idle_timeout: Option<Duration>,
    /// Queue depth for pushed notifications
    pub notification_buffer: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            registration_timeout: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(90)),
            notification_buffer: 64,
        }
    }
}

/// Why a control channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Agent closed the connection
    PeerClosed,
    /// No registration within the grace period
    RegistrationTimeout,
    /// Out-of-order, malformed or duplicate registration
    ProtocolViolation(String),
    /// Registry refused the agent
    RegistrationFailed(RegistryError),
    /// Nothing received for longer than the idle timeout
    IdleTimeout,
    /// Session was removed from the registry by someone else
    Unregistered,
    /// Socket-level failure
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::RegistrationTimeout => write!(f, "registration timeout"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::RegistrationFailed(e) => write!(f, "registration failed: {}", e),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Unregistered => write!(f, "unregistered"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl From<ChannelError> for CloseReason {
    fn from(e: ChannelError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Drives control channels against a shared registry
#[derive(Clone)]
pub struct ControlHandler {
    registry: Arc<Registry>,
    config: ControlConfig,
}

impl ControlHandler {
    pub fn new(registry: Arc<Registry>, config: ControlConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Run one control channel to completion
    pub async fn handle_connection<T>(&self, mut transport: T, peer_addr: Option<SocketAddr>) -> CloseReason
    where
        T: ControlTransport,
    {
        let peer = peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let (channel, mut outbound) = self.registry.open_channel(self.config.notification_buffer);
        let channel_id = channel.id();
        info!("New control channel {} from {}", channel_id, peer);

        let registry = Arc::clone(&self.registry);
        let _cleanup = scopeguard::guard((), move |_| {
            registry.unregister_by_session(channel_id);
        });

        let reason = match self.register(&mut transport, channel).await {
            Ok(session) => {
                // Drop our handle so a foreign unregister closes the queue
                let public_id = session.public_id().to_string();
                drop(session);
                self.run_registered(&mut transport, &mut outbound, &public_id)
                    .await
            }
            Err(reason) => reason,
        };

        match &reason {
            CloseReason::PeerClosed | CloseReason::Transport(_) => {}
            CloseReason::ProtocolViolation(_) | CloseReason::RegistrationFailed(_) => {
                transport.shutdown(Some(reason.to_string())).await;
            }
            _ => transport.shutdown(None).await,
        }

        info!("Control channel {} from {} closed: {}", channel_id, peer, reason);
        reason
    }

    /// Wait for the registration frame and bind the channel to a public id
    async fn register<T>(
        &self,
        transport: &mut T,
        channel: ControlChannel,
    ) -> Result<Arc<AgentSession>, CloseReason>
    where
        T: ControlTransport,
    {
        let port = match timeout(self.config.registration_timeout, Self::read_registration(transport)).await {
            Ok(Ok(port)) => port,
            Ok(Err(CloseReason::ProtocolViolation(msg))) => {
                warn!("Protocol violation before registration: {}", msg);
                let _ = transport.send_message(&ControlMessage::error(msg.clone())).await;
                return Err(CloseReason::ProtocolViolation(msg));
            }
            Ok(Err(reason)) => return Err(reason),
            Err(_) => {
                warn!(
                    "No registration within {:?}, closing channel",
                    self.config.registration_timeout
                );
                return Err(CloseReason::RegistrationTimeout);
            }
        };

        let session = match self.registry.register_agent(port, channel) {
            Ok(session) => session,
            Err(e) => {
                warn!("Registration for port {} rejected: {}", port, e);
                let _ = transport.send_message(&ControlMessage::error(e.to_string())).await;
                return Err(CloseReason::RegistrationFailed(e));
            }
        };

        transport
            .send_message(&ControlMessage::connected(session.public_id()))
            .await?;

        Ok(session)
    }

    async fn read_registration<T>(transport: &mut T) -> Result<u16, CloseReason>
    where
        T: ControlTransport,
    {
        loop {
            let text = match transport.recv_frame().await? {
                None => return Err(CloseReason::PeerClosed),
                Some(Inbound::Heartbeat) => continue,
                Some(Inbound::Text(text)) => text,
            };

            return match AgentMessage::decode(&text) {
                Ok(AgentMessage::Register(request)) => Ok(request.port),
                Ok(AgentMessage::Unknown(_)) => Err(CloseReason::ProtocolViolation(
                    "expected registration as first message".to_string(),
                )),
                Err(DecodeError::Malformed(e)) => Err(CloseReason::ProtocolViolation(format!(
                    "malformed registration frame: {}",
                    e
                ))),
                Err(e @ DecodeError::InvalidRegistration(_)) => {
                    Err(CloseReason::ProtocolViolation(e.to_string()))
                }
            };
        }
    }

    async fn run_registered<T>(
        &self,
        transport: &mut T,
        outbound: &mut tokio::sync::mpsc::Receiver<ControlMessage>,
        public_id: &str,
    ) -> CloseReason
    where
        T: ControlTransport,
    {
        let mut pings = self.config.ping_interval.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let idle_enabled = self.config.idle_timeout.is_some();
        let idle_period = self.config.idle_timeout.unwrap_or(Duration::from_secs(3600));
        let idle = sleep(idle_period);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return CloseReason::Unregistered;
                    };
                    if let Err(e) = transport.send_message(&message).await {
                        return e.into();
                    }
                }

                frame = transport.recv_frame() => {
                    idle.as_mut().reset(Instant::now() + idle_period);

                    match frame {
                        Ok(None) => return CloseReason::PeerClosed,
                        Err(e) => return e.into(),
                        Ok(Some(Inbound::Heartbeat)) => {}
                        Ok(Some(Inbound::Text(text))) => match AgentMessage::decode(&text) {
                            Ok(AgentMessage::Register(_)) => {
                                warn!("Agent {} attempted a second registration", public_id);
                                let msg = format!("already registered as {}", public_id);
                                let _ = transport.send_message(&ControlMessage::error(msg.clone())).await;
                                return CloseReason::ProtocolViolation(msg);
                            }
                            Ok(AgentMessage::Unknown(value)) => {
                                debug!("Ignoring unexpected frame from {}: {}", public_id, value);
                            }
                            Err(e) => {
                                warn!("Ignoring undecodable frame from {}: {}", public_id, e);
                            }
                        },
                    }
                }

                _ = tick(&mut pings) => {
                    if let Err(e) = transport.send_ping().await {
                        return e.into();
                    }
                }

                _ = &mut idle, if idle_enabled => {
                    warn!("Agent {} idle for {:?}, closing", public_id, idle_period);
                    return CloseReason::IdleTimeout;
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
