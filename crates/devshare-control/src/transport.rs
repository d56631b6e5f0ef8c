//! Message-framed duplex transport carrying the control channel

use async_trait::async_trait;
use devshare_proto::ControlMessage;
use thiserror::Error;

/// Control channel transport errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A frame received from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// JSON payload (binary frames are decoded as UTF-8)
    Text(String),
    /// Liveness-only frame (ping/pong)
    Heartbeat,
}

/// Transport the control channel runs over
#[async_trait]
pub trait ControlTransport: Send {
    /// Next frame, or `None` once the peer has closed
    async fn recv_frame(&mut self) -> Result<Option<Inbound>, ChannelError>;

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    async fn send_ping(&mut self) -> Result<(), ChannelError>;

    /// Close the transport; errors are ignored since the peer may be gone
    async fn shutdown(&mut self, reason: Option<String>);

    async fn send_message(&mut self, message: &ControlMessage) -> Result<(), ChannelError> {
        let text = message.to_json()?;
        self.send_text(text).await
    }
}
