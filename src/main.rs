//! DevShare CLI - share a local port through a relay
//!
//! Registers the port with a relay and prints the public URL plus every
//! request the relay forwards.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use devshare_client::{default_relay_url, probe, AgentConfig, AgentConnector, AgentEvent, ClientError};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How the relay maps public URLs onto agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Routing {
    /// `http://<id>.<domain>`
    Subdomain,
    /// `http://<domain>/<id>`
    Path,
}

/// DevShare - make a local server reachable from the internet
#[derive(Parser, Debug)]
#[command(name = "devshare")]
#[command(about = "DevShare - make a local server reachable from the internet")]
#[command(version)]
struct Cli {
    /// Local port number to expose
    #[arg(short, long, env = "DEVSHARE_PORT")]
    port: u16,

    /// Relay control channel URL
    #[arg(long, env = "DEVSHARE_RELAY", default_value_t = default_relay_url())]
    relay: String,

    /// Domain the relay serves public URLs under
    #[arg(long, env = "DEVSHARE_DOMAIN", default_value = "localhost")]
    domain: String,

    /// Routing strategy the relay runs with (only affects the printed URL)
    #[arg(long, env = "DEVSHARE_ROUTING", value_enum, default_value_t = Routing::Subdomain)]
    routing: Routing,

    /// Bearer token for relays that require one
    #[arg(long, env = "DEVSHARE_TOKEN")]
    token: Option<String>,

    /// Do not check that something is listening on the local port first
    #[arg(long)]
    skip_probe: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn agent_config(&self) -> AgentConfig {
        let config = AgentConfig::new(self.relay.clone(), self.port);
        match &self.token {
            Some(token) => config.with_token(token.clone()),
            None => config,
        }
    }

    fn public_url(&self, public_id: &str) -> String {
        match self.routing {
            Routing::Subdomain => format!("http://{}.{}", public_id, self.domain),
            Routing::Path => format!("http://{}/{}", self.domain, public_id),
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (used for wss:// relays)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if cli.port == 0 {
        anyhow::bail!("Port must be between 1 and 65535");
    }

    if !cli.skip_probe && !probe("localhost", cli.port, Duration::from_secs(2)).await {
        anyhow::bail!(
            "Nothing is listening on localhost:{}. Start your server first or pass --skip-probe",
            cli.port
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("🔗 Connecting to DevShare server...");
    debug!("Relay: {}", cli.relay);

    let connector = AgentConnector::new(cli.agent_config());
    let mut connection = tokio::select! {
        _ = &mut ctrl_c => {
            println!("\nShutting down...");
            return Ok(());
        }
        result = connector.connect() => match result {
            Ok(connection) => connection,
            Err(e @ ClientError::Connect(_)) => {
                return Err(e).context("Could not connect to DevShare server. Is it running?");
            }
            Err(e) => return Err(e).context("Registration failed"),
        },
    };

    println!("✅ Connected to DevShare server!");
    println!(
        "✨ Your local server is now public at: {}",
        cli.public_url(connection.public_id())
    );
    info!("Forwarding to localhost:{}", cli.port);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nShutting down...");
                connection.disconnect().await.context("Failed to close connection")?;
                return Ok(());
            }
            event = connection.next_event() => match event {
                Ok(Some(AgentEvent::Request { method, path })) => {
                    println!("📥 Incoming request: {} {}", method, path);
                }
                Ok(None) => {
                    println!("Connection closed");
                    return Ok(());
                }
                Err(e) => return Err(e).context("Relay reported an error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_is_required() {
        assert!(Cli::try_parse_from(["devshare"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["devshare", "-p", "8080"]);
        assert_eq!(cli.port, 8080);
        assert_eq!(cli.relay, "ws://localhost:3000/ws");
        assert!(cli.token.is_none());
        assert_eq!(cli.public_url("abc123"), "http://abc123.localhost");
    }

    #[test]
    fn test_token_is_forwarded() {
        let cli = Cli::parse_from([
            "devshare",
            "--port",
            "3000",
            "--relay",
            "wss://share.example.com/ws",
            "--domain",
            "share.example.com",
            "--token",
            "s3cret",
        ]);

        let config = cli.agent_config();
        assert_eq!(config.relay_url, "wss://share.example.com/ws");
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(cli.public_url("abc123"), "http://abc123.share.example.com");
    }

    #[test]
    fn test_path_routing_url() {
        let cli = Cli::parse_from([
            "devshare",
            "-p",
            "8080",
            "--domain",
            "share.example.com",
            "--routing",
            "path",
        ]);

        assert_eq!(cli.routing, Routing::Path);
        assert_eq!(cli.public_url("abc123"), "http://share.example.com/abc123");
    }
}
