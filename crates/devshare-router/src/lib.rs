//! Routing state for the relay
//!
//! Owns the registry of connected agents, the identifiers they are reachable
//! under, and the policy that maps a public request onto one of them.

pub mod http;
pub mod registry;
pub mod session;
pub mod subdomain;

pub use http::{RouteKey, RoutePolicy, RoutingStrategy};
pub use registry::{Registry, RegistryError};
pub use session::{AgentSession, ChannelId, ControlChannel, InFlightRequest, SessionStats};
pub use subdomain::{IdGenerator, RandomIdGenerator, PUBLIC_ID_LEN};
