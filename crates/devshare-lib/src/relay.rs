//! Relay composition
//!
//! Binds the public listeners, wires the registry, control handler and proxy
//! together, and runs everything until a shutdown signal arrives.
//!
//! ```ignore
//! use devshare_lib::{Relay, RelayConfig};
//!
//! let relay = Relay::bind(RelayConfig::default()).await?;
//! println!("listening on {}", relay.local_addr());
//! relay.run().await?;
//! ```

use crate::config::{RelayConfig, TlsConfig};
use axum_server::tls_rustls::RustlsConfig;
use devshare_control::{AllowAll, BearerToken, ChannelAuthorizer, ControlHandler};
use devshare_router::{Registry, RoutePolicy};
use devshare_server_http::{permissive_cors, router, AppState, ProxyEngine};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long the HTTPS listener waits for open connections on shutdown
const TLS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Server error: {0}")]
    Serve(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    fn bind(addr: SocketAddr, e: std::io::Error) -> Self {
        RelayError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: e.to_string(),
        }
    }
}

/// A bound relay, ready to serve
pub struct Relay {
    registry: Arc<Registry>,
    state: AppState,
    http_listener: TcpListener,
    http_addr: SocketAddr,
    https: Option<(std::net::TcpListener, SocketAddr, RustlsConfig)>,
}

impl Relay {
    /// Bind every configured listener
    ///
    /// Listeners are bound eagerly so port conflicts surface here and
    /// `local_addr` reports the real port when binding to port 0.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let http_listener = TcpListener::bind(config.http_addr)
            .await
            .map_err(|e| RelayError::bind(config.http_addr, e))?;
        let http_addr = http_listener.local_addr()?;
        info!("HTTP listener bound on {}", http_addr);

        let https = match &config.tls {
            Some(tls) => Some(Self::bind_tls(tls).await?),
            None => None,
        };

        let registry = Arc::new(Registry::new());

        let authorizer: Arc<dyn ChannelAuthorizer> = match &config.auth_token {
            Some(token) => {
                info!("Control channels require a bearer token");
                Arc::new(BearerToken::new(token.clone()))
            }
            None => Arc::new(AllowAll),
        };

        let policy = RoutePolicy::new(config.routing, config.domain.clone());
        info!(
            "Routing by {} under '{}', control path {}",
            policy.strategy(),
            policy.base_domain(),
            config.control_path
        );

        let state = AppState {
            registry: registry.clone(),
            policy,
            control: ControlHandler::new(registry.clone(), config.control_config()),
            authorizer,
            proxy: ProxyEngine::new(config.proxy_config()),
            control_path: config.control_path.clone(),
            cors: config.cors.then(permissive_cors),
            scheme: "http",
        };

        Ok(Self {
            registry,
            state,
            http_listener,
            http_addr,
            https,
        })
    }

    async fn bind_tls(
        tls: &TlsConfig,
    ) -> Result<(std::net::TcpListener, SocketAddr, RustlsConfig), RelayError> {
        // Initialize Rustls crypto provider (required before building server configs)
        let _ = rustls::crypto::ring::default_provider().install_default();

        info!(
            "Loading TLS certificate from {} and key from {}",
            tls.cert_path.display(),
            tls.key_path.display()
        );
        let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .map_err(|e| RelayError::Tls(format!("Invalid cert/key: {}", e)))?;

        let listener =
            std::net::TcpListener::bind(tls.addr).map_err(|e| RelayError::bind(tls.addr, e))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("HTTPS listener bound on {}", addr);

        Ok((listener, addr, rustls_config))
    }

    /// Replace the control channel authorizer
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ChannelAuthorizer>) -> Self {
        self.state.authorizer = authorizer;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(|(_, addr, _)| *addr)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Public URL an agent registered as `public_id` is reachable at
    pub fn public_url(&self, public_id: &str) -> String {
        self.state
            .policy
            .public_url("http", public_id, Some(self.http_addr.port()))
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl-C, shutting down");
        })
        .await
    }

    /// Serve until `shutdown` resolves, then stop accepting and close agents
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            registry,
            state,
            http_listener,
            http_addr,
            https,
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();

        let app = router(state.for_scheme("http"))
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut http_stop = stop_rx.clone();
        join_set.spawn(async move {
            info!("Relay serving HTTP on {}", http_addr);
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_stop.wait_for(|stop| *stop).await;
                })
                .await
                .map_err(|e| RelayError::Serve(format!("HTTP listener: {}", e)))
        });

        if let Some((listener, addr, tls)) = https {
            let handle = axum_server::Handle::new();
            let app = router(state.for_scheme("https"))
                .into_make_service_with_connect_info::<SocketAddr>();

            let drain = handle.clone();
            let mut https_stop = stop_rx.clone();
            tokio::spawn(async move {
                let _ = https_stop.wait_for(|stop| *stop).await;
                drain.graceful_shutdown(Some(TLS_DRAIN_TIMEOUT));
            });

            join_set.spawn(async move {
                info!("Relay serving HTTPS on {}", addr);
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(handle)
                    .serve(app)
                    .await
                    .map_err(|e| RelayError::Serve(format!("HTTPS listener: {}", e)))
            });
        }

        let mut outcome = Ok(());

        tokio::select! {
            _ = shutdown => {}
            Some(joined) = join_set.join_next() => {
                outcome = flatten(joined);
                if let Err(e) = &outcome {
                    error!("Listener stopped unexpectedly: {}", e);
                }
            }
        }

        let _ = stop_tx.send(true);

        // Dropping the sessions ends each control channel
        let agents = registry.public_ids();
        if !agents.is_empty() {
            info!("Disconnecting {} agent(s)", agents.len());
        }
        for public_id in agents {
            registry.unregister(&public_id);
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = flatten(joined) {
                warn!("Listener error during shutdown: {}", e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!("Relay stopped");
        outcome
    }
}

fn flatten(
    joined: Result<Result<(), RelayError>, tokio::task::JoinError>,
) -> Result<(), RelayError> {
    joined.map_err(|e| RelayError::Serve(format!("listener task failed: {}", e)))?
}
