//! DevShare relay server
//!
//! Accepts agent control channels and proxies public HTTP traffic to the
//! local services those agents expose.

use anyhow::{Context, Result};
use clap::Parser;
use devshare_lib::{Relay, RelayConfig, RoutingStrategy, TlsConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DevShare relay - exposes local ports of connected agents on public URLs
#[derive(Parser, Debug)]
#[command(name = "devshare-relay")]
#[command(about = "Run a DevShare relay server", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// HTTP server bind address (serves both agents and public traffic)
    #[arg(long, env = "DEVSHARE_HTTP_ADDR", default_value = "0.0.0.0:3000")]
    http_addr: SocketAddr,

    /// HTTPS server bind address (requires --tls-cert and --tls-key)
    #[arg(long, env = "DEVSHARE_HTTPS_ADDR", requires_all = ["tls_cert", "tls_key"])]
    https_addr: Option<SocketAddr>,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "DEVSHARE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "DEVSHARE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Public domain name for this relay
    /// Agents are reachable at {id}.{domain} (or {domain}/{id} with path routing)
    #[arg(long, env = "DEVSHARE_DOMAIN", default_value = "localhost")]
    domain: String,

    /// How public requests select an agent: "subdomain" or "path"
    #[arg(long, env = "DEVSHARE_ROUTING", default_value = "subdomain")]
    routing: RoutingStrategy,

    /// Path agents open their control WebSocket on
    #[arg(long, env = "DEVSHARE_CONTROL_PATH", default_value = "/ws")]
    control_path: String,

    /// Host the relay dials to reach an agent's declared port
    #[arg(long, env = "DEVSHARE_AGENT_HOST", default_value = "localhost")]
    agent_host: String,

    /// Seconds a new control channel may stay unregistered
    #[arg(long, env = "DEVSHARE_REGISTRATION_TIMEOUT_SECS", default_value = "30")]
    registration_timeout_secs: u64,

    /// Seconds between pings to registered agents (0 disables)
    #[arg(long, env = "DEVSHARE_PING_INTERVAL_SECS", default_value = "30")]
    ping_interval_secs: u64,

    /// Close agents silent for this many seconds (0 disables)
    #[arg(long, env = "DEVSHARE_IDLE_TIMEOUT_SECS", default_value = "90")]
    idle_timeout_secs: u64,

    /// Seconds to wait for a local service to send response headers
    #[arg(long, env = "DEVSHARE_UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    upstream_timeout_secs: u64,

    /// Do not inject CORS headers or answer preflight requests
    #[arg(long, env = "DEVSHARE_NO_CORS")]
    no_cors: bool,

    /// Require agents to present "Authorization: Bearer <token>"
    #[arg(long, env = "DEVSHARE_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DEVSHARE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        let tls = match (self.https_addr, self.tls_cert, self.tls_key) {
            (Some(addr), Some(cert_path), Some(key_path)) => Some(TlsConfig {
                addr,
                cert_path,
                key_path,
            }),
            _ => None,
        };

        RelayConfig {
            http_addr: self.http_addr,
            tls,
            domain: self.domain,
            routing: self.routing,
            control_path: self.control_path,
            agent_host: self.agent_host,
            registration_timeout: Duration::from_secs(self.registration_timeout_secs),
            ping_interval: seconds(self.ping_interval_secs),
            idle_timeout: seconds(self.idle_timeout_secs),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
            cors: !self.no_cors,
            auth_token: self.auth_token,
            ..RelayConfig::default()
        }
    }
}

/// `0` means disabled
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for the HTTPS listener)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.into_config();

    info!("Starting DevShare relay");
    info!("HTTP endpoint: {}", config.http_addr);
    if let Some(tls) = &config.tls {
        info!("HTTPS endpoint: {}", tls.addr);
    }
    info!("Control path: {}", config.control_path);
    info!("Public domain: {} (routing by {})", config.domain, config.routing);

    let relay = Relay::bind(config)
        .await
        .context("Failed to start relay")?;

    info!(
        "Agents will be reachable at e.g. {}",
        relay.public_url("{id}")
    );

    relay.run().await.context("Relay stopped with an error")?;
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Cli::parse_from(["devshare-relay"]).into_config();
        let defaults = RelayConfig::default();

        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.domain, defaults.domain);
        assert_eq!(config.routing, defaults.routing);
        assert_eq!(config.control_path, defaults.control_path);
        assert_eq!(config.registration_timeout, defaults.registration_timeout);
        assert_eq!(config.ping_interval, defaults.ping_interval);
        assert_eq!(config.idle_timeout, defaults.idle_timeout);
        assert!(config.cors);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_flags() {
        let config = Cli::parse_from([
            "devshare-relay",
            "--routing",
            "path",
            "--domain",
            "share.example.com",
            "--ping-interval-secs",
            "0",
            "--no-cors",
            "--auth-token",
            "s3cret",
        ])
        .into_config();

        assert_eq!(config.routing, RoutingStrategy::PathPrefix);
        assert_eq!(config.domain, "share.example.com");
        assert!(config.ping_interval.is_none());
        assert!(!config.cors);
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_https_requires_certificates() {
        assert!(Cli::try_parse_from(["devshare-relay", "--https-addr", "0.0.0.0:443"]).is_err());

        let config = Cli::parse_from([
            "devshare-relay",
            "--https-addr",
            "0.0.0.0:443",
            "--tls-cert",
            "cert.pem",
            "--tls-key",
            "key.pem",
        ])
        .into_config();
        let tls = config.tls.unwrap();
        assert_eq!(tls.addr.port(), 443);
        assert_eq!(tls.cert_path, PathBuf::from("cert.pem"));
    }
}
