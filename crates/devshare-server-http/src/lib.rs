//! Public HTTP listener: routing, CORS and the reverse proxy
pub mod proxy;
pub mod server;

pub use proxy::{ForwardTarget, ProxyConfig, ProxyEngine, ProxyError};
pub use server::{permissive_cors, router, AppState};
