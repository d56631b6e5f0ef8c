//! Control plane for agent sessions
pub mod auth;
pub mod handler;
pub mod transport;
pub mod ws;

pub use auth::{AllowAll, AuthError, BearerToken, ChannelAuthorizer};
pub use handler::{CloseReason, ControlConfig, ControlHandler};
pub use transport::{ChannelError, ControlTransport, Inbound};
