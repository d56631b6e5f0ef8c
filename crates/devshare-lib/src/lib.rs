//! DevShare relay library
//!
//! Re-exports the relay crates and provides [`Relay`], which binds the public
//! listener and serves both the agent control channel and proxied traffic.
//!
//! # Quick Start
//!
//! ```ignore
//! use devshare_lib::{Relay, RelayConfig, RoutingStrategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig {
//!         domain: "share.example.com".to_string(),
//!         routing: RoutingStrategy::Subdomain,
//!         ..Default::default()
//!     };
//!
//!     let relay = Relay::bind(config).await?;
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod relay;

pub use config::{RelayConfig, TlsConfig};
pub use relay::{Relay, RelayError};

pub use devshare_control::{
    AllowAll, AuthError, BearerToken, ChannelAuthorizer, CloseReason, ControlConfig,
    ControlHandler,
};
pub use devshare_proto::{AgentMessage, ControlMessage, RegisterRequest};
pub use devshare_router::{
    AgentSession, IdGenerator, RandomIdGenerator, Registry, RegistryError, RouteKey, RoutePolicy,
    RoutingStrategy,
};
pub use devshare_server_http::{ProxyConfig, ProxyEngine, ProxyError};
