//! Agent configuration

use devshare_proto::{DEFAULT_CONTROL_PATH, DEFAULT_RELAY_PORT};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Control channel URL, e.g. `ws://relay.example.com:3000/ws`
    pub relay_url: String,
    /// Local port to expose
    pub local_port: u16,
    /// Sent as `Authorization: Bearer <token>` on the upgrade
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    /// How long to wait for the relay to confirm registration
    pub registration_timeout: Duration,
}

impl AgentConfig {
    pub fn new(relay_url: impl Into<String>, local_port: u16) -> Self {
        Self {
            relay_url: relay_url.into(),
            local_port,
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Relay URL used when none is configured
pub fn default_relay_url() -> String {
    format!("ws://localhost:{}{}", DEFAULT_RELAY_PORT, DEFAULT_CONTROL_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_url() {
        assert_eq!(default_relay_url(), "ws://localhost:3000/ws");
    }

    #[test]
    fn test_builder() {
        let config = AgentConfig::new("ws://relay:3000/ws", 8080).with_token("abc");
        assert_eq!(config.local_port, 8080);
        assert_eq!(config.auth_token.as_deref(), Some("abc"));
    }
}
