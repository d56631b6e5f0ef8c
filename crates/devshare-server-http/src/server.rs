//! Public HTTP surface of the relay
//!
//! A single fallback handler sees every request. The control path on the
//! bare relay host upgrades to a control channel; anything else is resolved
//! to a routing key and proxied to the owning agent.

use crate::proxy::{ForwardTarget, ProxyEngine};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use devshare_control::{ChannelAuthorizer, ControlHandler};
use devshare_proto::ControlMessage;
use devshare_router::{AgentSession, Registry, RoutePolicy, RoutingStrategy};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::{service_fn, Layer, ServiceExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared state behind every listener
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub policy: RoutePolicy,
    pub control: ControlHandler,
    pub authorizer: Arc<dyn ChannelAuthorizer>,
    pub proxy: ProxyEngine,
    pub control_path: String,
    /// `None` disables CORS injection and the preflight short-circuit
    pub cors: Option<CorsLayer>,
    /// Scheme of the listener this state is attached to
    pub scheme: &'static str,
}

impl AppState {
    /// Copy of this state for a listener speaking `scheme`
    pub fn for_scheme(&self, scheme: &'static str) -> Self {
        Self {
            scheme,
            ..self.clone()
        }
    }

    fn is_control_request(&self, host: Option<&str>, path: &str) -> bool {
        if path != self.control_path {
            return false;
        }
        match self.policy.strategy() {
            RoutingStrategy::PathPrefix => true,
            RoutingStrategy::Subdomain => self.policy.resolve(host, path).is_none(),
        }
    }
}

/// Permissive CORS: any origin, method and header
pub fn permissive_cors() -> CorsLayer {
    CorsLayer::permissive()
}

/// Build the router serving both the control path and public traffic
pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let host = request_host(&req);
    let path = req.uri().path().to_string();

    if state.is_control_request(host.as_deref(), &path) {
        return accept_control(state, req, peer).await;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let Some(key) = state.policy.resolve(host.as_deref(), &path_and_query) else {
        debug!("No routing key for host={:?} path={}", host, path);
        return not_found("No agent addressed by this request");
    };

    let Some(session) = state.registry.lookup(&key.public_id) else {
        debug!("No agent registered for {}", key.public_id);
        return not_found(&format!("No agent connected for '{}'", key.public_id));
    };

    let target = ForwardTarget {
        port: session.local_port(),
        path_and_query: key.forward_path,
        client_addr: peer,
        scheme: state.scheme,
    };

    match state.cors.clone() {
        Some(cors) => {
            let proxy = state.proxy.clone();
            let service = cors.layer(service_fn(move |req: Request| {
                let proxy = proxy.clone();
                let session = Arc::clone(&session);
                let target = target.clone();
                async move {
                    if req.method() == Method::OPTIONS {
                        return Ok::<_, Infallible>(StatusCode::OK.into_response());
                    }
                    Ok(forward(&proxy, session, req, target).await)
                }
            }));
            match service.oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            }
        }
        None => forward(&state.proxy, session, req, target).await,
    }
}

async fn forward(
    proxy: &ProxyEngine,
    session: Arc<AgentSession>,
    req: Request,
    target: ForwardTarget,
) -> Response {
    let method = req.method().clone();

    session.notify(ControlMessage::request(
        method.as_str(),
        target.path_and_query.as_str(),
    ));
    let in_flight = session.track_request();

    match proxy.forward(req, target.clone(), in_flight).await {
        Ok(response) => {
            debug!(
                "{} {} via {} -> {}",
                method,
                target.path_and_query,
                session.public_id(),
                response.status()
            );
            response
        }
        Err(e) => {
            warn!(
                "Proxy error for {} {} via {}: {}",
                method,
                target.path_and_query,
                session.public_id(),
                e
            );
            e.into_response()
        }
    }
}

async fn accept_control(state: AppState, req: Request, peer: Option<SocketAddr>) -> Response {
    let (mut parts, _body) = req.into_parts();

    if let Err(e) = state.authorizer.authorize(&parts.headers).await {
        warn!("Rejected control channel from {:?}: {}", peer, e);
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let control = state.control.clone();
    upgrade.on_upgrade(move |socket| async move {
        let reason = control.handle_connection(socket, peer).await;
        info!("Control channel from {:?} finished: {}", peer, reason);
    })
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, message.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyConfig;
    use axum::body::Body;
    use devshare_control::{AllowAll, ControlConfig};
    use http_body_util::BodyExt;

    fn state(strategy: RoutingStrategy) -> AppState {
        let registry = Arc::new(Registry::new());
        AppState {
            registry: registry.clone(),
            policy: RoutePolicy::new(strategy, "devshare.test"),
            control: ControlHandler::new(registry, ControlConfig::default()),
            authorizer: Arc::new(AllowAll),
            proxy: ProxyEngine::new(ProxyConfig::default()),
            control_path: "/ws".to_string(),
            cors: Some(permissive_cors()),
            scheme: "http",
        }
    }

    fn get(host: &str, path: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_control_request_detection() {
        let subdomain = state(RoutingStrategy::Subdomain);
        assert!(subdomain.is_control_request(Some("devshare.test"), "/ws"));
        assert!(subdomain.is_control_request(None, "/ws"));
        assert!(!subdomain.is_control_request(Some("abc123.devshare.test"), "/ws"));
        assert!(!subdomain.is_control_request(Some("devshare.test"), "/ws/extra"));

        let path = state(RoutingStrategy::PathPrefix);
        assert!(path.is_control_request(Some("devshare.test"), "/ws"));
        assert!(!path.is_control_request(Some("devshare.test"), "/abc123/ws"));
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let app = router(state(RoutingStrategy::Subdomain));

        let response = app
            .clone()
            .oneshot(get("zzzzzz.devshare.test", "/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.contains("zzzzzz"));

        let response = app.oneshot(get("devshare.test", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preflight_to_unknown_key_is_not_found() {
        let app = router(state(RoutingStrategy::Subdomain));

        let request = http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/api")
            .header(header::HOST, "zzzzzz.devshare.test")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_control_path_without_upgrade_is_rejected() {
        let app = router(state(RoutingStrategy::Subdomain));

        let response = app.oneshot(get("devshare.test", "/ws")).await.unwrap();
        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
    }
}
