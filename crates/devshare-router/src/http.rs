//! HTTP routing-key extraction
//!
//! A deployment picks exactly one strategy: the leftmost host label
//! (`a1b2c3.example.com`) or the first path segment (`example.com/a1b2c3/...`).

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// How the routing key is derived from a public request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    /// `<id>.<base_domain>`
    #[default]
    Subdomain,
    /// `<base_domain>/<id>/<rest>`; `<rest>` is what the agent sees
    PathPrefix,
}

#[derive(Debug, Error)]
#[error("Unknown routing strategy '{0}' (expected 'subdomain' or 'path')")]
pub struct ParseStrategyError(String);

impl FromStr for RoutingStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subdomain" | "host" => Ok(Self::Subdomain),
            "path" | "path-prefix" => Ok(Self::PathPrefix),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subdomain => write!(f, "subdomain"),
            Self::PathPrefix => write!(f, "path"),
        }
    }
}

/// Resolved routing key for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    /// Public identifier to look up in the registry
    pub public_id: String,
    /// Path and query to forward to the agent's local service
    pub forward_path: String,
}

/// Routing policy of one relay deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    strategy: RoutingStrategy,
    base_domain: String,
}

impl RoutePolicy {
    pub fn new(strategy: RoutingStrategy, base_domain: impl Into<String>) -> Self {
        let base_domain: String = base_domain.into();
        let base_domain = normalize_host(&base_domain);
        Self {
            strategy,
            base_domain,
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Derive the routing key from the Host header and request target
    ///
    /// Returns `None` when the request does not address any agent, e.g. the
    /// bare base domain under subdomain routing.
    pub fn resolve(&self, host: Option<&str>, path_and_query: &str) -> Option<RouteKey> {
        let key = match self.strategy {
            RoutingStrategy::Subdomain => self.resolve_subdomain(host?, path_and_query),
            RoutingStrategy::PathPrefix => Self::resolve_path_prefix(path_and_query),
        };
        trace!("Resolved routing key {:?} for host={:?}", key, host);
        key
    }

    fn resolve_subdomain(&self, host: &str, path_and_query: &str) -> Option<RouteKey> {
        let host = normalize_host(host);
        let label = host
            .strip_suffix(self.base_domain.as_str())?
            .strip_suffix('.')?;

        if label.is_empty() || label.contains('.') {
            return None;
        }

        let forward_path = if path_and_query.is_empty() {
            "/".to_string()
        } else {
            path_and_query.to_string()
        };

        Some(RouteKey {
            public_id: label.to_string(),
            forward_path,
        })
    }

    fn resolve_path_prefix(path_and_query: &str) -> Option<RouteKey> {
        let rest = path_and_query.strip_prefix('/')?;
        let end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
        let (segment, remainder) = rest.split_at(end);

        if segment.is_empty() {
            return None;
        }

        let forward_path = if remainder.starts_with('/') {
            remainder.to_string()
        } else {
            format!("/{}", remainder)
        };

        Some(RouteKey {
            public_id: segment.to_ascii_lowercase(),
            forward_path,
        })
    }

    /// Human-facing public URL for an identifier
    pub fn public_url(&self, scheme: &str, public_id: &str, port: Option<u16>) -> String {
        let port = match (scheme, port) {
            (_, None) | ("http", Some(80)) | ("https", Some(443)) => String::new(),
            (_, Some(p)) => format!(":{}", p),
        };

        match self.strategy {
            RoutingStrategy::Subdomain => {
                format!("{}://{}.{}{}", scheme, public_id, self.base_domain, port)
            }
            RoutingStrategy::PathPrefix => {
                format!("{}://{}{}/{}", scheme, self.base_domain, port, public_id)
            }
        }
    }
}

/// Lowercase a host and drop any port or trailing dot
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}
