//! Reverse proxy from public callers to an agent's local service
//!
//! Requests and responses are streamed in both directions. A request asking
//! for a protocol upgrade is forwarded with its `Connection`/`Upgrade`
//! headers intact; if the upstream answers `101` both connections are
//! spliced together until either side closes.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use devshare_router::InFlightRequest;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Errors forwarding a request upstream
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("Upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ProxyError::Timeout(_) => "Local service timed out",
            _ => "Local service unavailable",
        };
        (status, body).into_response()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the relay dials to reach agents' local services
    pub upstream_host: String,
    pub connect_timeout: Duration,
    /// Bound on waiting for upstream response headers
    pub response_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: "localhost".to_string(),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Where and on whose behalf a request is forwarded
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    pub port: u16,
    /// Path and query as the local service should see them
    pub path_and_query: String,
    pub client_addr: Option<SocketAddr>,
    /// Scheme the public caller used
    pub scheme: &'static str,
}

#[derive(Clone)]
pub struct ProxyEngine {
    client: Client<HttpConnector, Body>,
    config: ProxyConfig,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Forward one request and return the upstream response
    ///
    /// Dropping the returned future aborts the upstream exchange. The
    /// `in_flight` guard is released once response headers arrive, or when an
    /// upgraded connection ends.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
        target: ForwardTarget,
        in_flight: InFlightRequest,
    ) -> Result<Response, ProxyError> {
        let upgrade = is_upgrade_request(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let authority = format!("{}:{}", self.config.upstream_host, target.port);
        let uri: Uri = format!("http://{}{}", authority, target.path_and_query)
            .parse()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", authority, e)))?;

        let (parts, body) = req.into_parts();
        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers, upgrade);
        append_forwarded(&mut headers, target.client_addr, original_host, target.scheme);

        let host = HeaderValue::from_str(&authority)
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", authority, e)))?;
        headers.insert(header::HOST, host);

        let mut upstream_req = Request::new(body);
        *upstream_req.method_mut() = parts.method;
        *upstream_req.uri_mut() = uri;
        *upstream_req.version_mut() = Version::HTTP_11;
        *upstream_req.headers_mut() = headers;

        debug!(
            "Proxying {} {} to {}",
            upstream_req.method(),
            target.path_and_query,
            authority
        );

        let mut response = match tokio::time::timeout(
            self.config.response_timeout,
            self.client.request(upstream_req),
        )
        .await
        {
            Err(_) => return Err(ProxyError::Timeout(self.config.response_timeout)),
            Ok(Err(e)) if e.is_connect() => {
                return Err(ProxyError::Connect {
                    target: authority,
                    reason: error_chain(&e),
                })
            }
            Ok(Err(e)) => return Err(ProxyError::Upstream(error_chain(&e))),
            Ok(Ok(response)) => response,
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let (parts, _) = response.into_parts();

                tokio::spawn(async move {
                    let _in_flight = in_flight;
                    let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Upgrade to {} failed: {}", authority, e);
                            return;
                        }
                    };

                    let mut client = TokioIo::new(client);
                    let mut upstream = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                        Ok((up, down)) => debug!(
                            "Upgraded connection to {} closed ({} bytes up, {} bytes down)",
                            authority, up, down
                        ),
                        Err(e) => debug!("Upgraded connection to {} ended: {}", authority, e),
                    }
                });

                return Ok(Response::from_parts(parts, Body::empty()));
            }
        }

        strip_hop_by_hop(response.headers_mut(), false);
        Ok(response.map(Body::new))
    }
}

/// Whether a request asks to switch protocols
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Remove hop-by-hop headers, including any named in `Connection`
///
/// With `keep_upgrade` the `Connection`/`Upgrade` pair survives so the
/// upstream can complete the handshake.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .filter(|name| !(keep_upgrade && *name == header::UPGRADE))
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP.iter() {
        if keep_upgrade && (*name == header::CONNECTION || *name == header::UPGRADE) {
            continue;
        }
        headers.remove(name);
    }

    if keep_upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

fn append_forwarded(
    headers: &mut HeaderMap,
    client_addr: Option<SocketAddr>,
    original_host: Option<HeaderValue>,
    scheme: &'static str,
) {
    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme));
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
