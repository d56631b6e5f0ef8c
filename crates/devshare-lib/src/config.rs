//! Relay configuration

use devshare_control::ControlConfig;
use devshare_proto::{DEFAULT_CONTROL_PATH, DEFAULT_RELAY_PORT};
use devshare_router::RoutingStrategy;
use devshare_server_http::ProxyConfig;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// PEM certificate chain and private key for the HTTPS listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything needed to start a relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub http_addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    /// Base domain public URLs are minted under
    pub domain: String,
    pub routing: RoutingStrategy,
    pub control_path: String,
    /// Host used to reach agents' declared ports
    pub agent_host: String,
    pub registration_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub upstream_timeout: Duration,
    pub connect_timeout: Duration,
    pub cors: bool,
    /// Shared bearer token required on control upgrades
    pub auth_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let control = ControlConfig::default();
        let proxy = ProxyConfig::default();

        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_RELAY_PORT)),
            tls: None,
            domain: "localhost".to_string(),
            routing: RoutingStrategy::default(),
            control_path: DEFAULT_CONTROL_PATH.to_string(),
            agent_host: proxy.upstream_host,
            registration_timeout: control.registration_timeout,
            ping_interval: control.ping_interval,
            idle_timeout: control.idle_timeout,
            upstream_timeout: proxy.response_timeout,
            connect_timeout: proxy.connect_timeout,
            cors: true,
            auth_token: None,
        }
    }
}

impl RelayConfig {
    pub(crate) fn control_config(&self) -> ControlConfig {
        ControlConfig {
            registration_timeout: self.registration_timeout,
            ping_interval: self.ping_interval,
            idle_timeout: self.idle_timeout,
            ..ControlConfig::default()
        }
    }

    pub(crate) fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            upstream_host: self.agent_host.clone(),
            connect_timeout: self.connect_timeout,
            response_timeout: self.upstream_timeout,
        }
    }
}
