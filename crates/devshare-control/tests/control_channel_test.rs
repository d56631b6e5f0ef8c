//! Control channel lifecycle tests
//!
//! Drives `ControlHandler` over an in-memory transport so every state
//! transition can be observed without sockets.

use async_trait::async_trait;
use devshare_control::{ChannelError, CloseReason, ControlConfig, ControlHandler, ControlTransport, Inbound};
use devshare_proto::ControlMessage;
use devshare_router::{IdGenerator, Registry, RegistryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
enum Outbound {
    Text(String),
    Ping,
    Close(Option<String>),
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl ControlTransport for MemoryTransport {
    async fn recv_frame(&mut self) -> Result<Option<Inbound>, ChannelError> {
        Ok(self.inbound.recv().await)
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), ChannelError> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self, reason: Option<String>) {
        let _ = self.outbound.send(Outbound::Close(reason));
    }
}

/// The agent's end of an in-memory channel
struct Agent {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    task: JoinHandle<CloseReason>,
}

impl Agent {
    fn connect(handler: &ControlHandler) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = MemoryTransport {
            inbound: in_rx,
            outbound: out_tx,
        };

        let handler = handler.clone();
        let task = tokio::spawn(async move { handler.handle_connection(transport, None).await });

        Self {
            tx: Some(in_tx),
            rx: out_rx,
            task,
        }
    }

    fn send(&self, text: &str) {
        self.tx
            .as_ref()
            .expect("agent already hung up")
            .send(Inbound::Text(text.to_string()))
            .expect("handler gone");
    }

    fn hang_up(&mut self) {
        self.tx.take();
    }

    async fn next(&mut self) -> Outbound {
        timeout(Duration::from_secs(120), self.rx.recv())
            .await
            .expect("timed out waiting for relay frame")
            .expect("relay side dropped")
    }

    async fn next_message(&mut self) -> ControlMessage {
        match self.next().await {
            Outbound::Text(text) => ControlMessage::from_json(&text).expect("invalid control frame"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    async fn register(&mut self, port: u16) -> String {
        self.send(&format!(r#"{{"port":{}}}"#, port));
        match self.next_message().await {
            ControlMessage::Connected { subdomain } => subdomain,
            other => panic!("expected connected, got {:?}", other),
        }
    }

    async fn finish(self) -> CloseReason {
        timeout(Duration::from_secs(120), self.task)
            .await
            .expect("handler did not finish")
            .expect("handler panicked")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn quiet_config() -> ControlConfig {
    ControlConfig {
        ping_interval: None,
        idle_timeout: None,
        ..ControlConfig::default()
    }
}

fn handler_with(config: ControlConfig) -> (Arc<Registry>, ControlHandler) {
    let registry = Arc::new(Registry::new());
    let handler = ControlHandler::new(registry.clone(), config);
    (registry, handler)
}

#[tokio::test]
async fn test_register_then_peer_close_unregisters() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(3000).await;
    info!("Agent registered as {}", public_id);

    let session = registry.lookup(&public_id).expect("session should be registered");
    assert_eq!(session.local_port(), 3000);
    drop(session);

    agent.hang_up();
    assert_eq!(agent.finish().await, CloseReason::PeerClosed);
    assert!(registry.lookup(&public_id).is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_notifications_are_delivered_in_order() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(8080).await;

    let session = registry.lookup(&public_id).unwrap();
    assert!(session.notify(ControlMessage::request("GET", "/health")));
    assert!(session.notify(ControlMessage::request("POST", "/api/items")));
    drop(session);

    assert_eq!(
        agent.next_message().await,
        ControlMessage::request("GET", "/health")
    );
    assert_eq!(
        agent.next_message().await,
        ControlMessage::request("POST", "/api/items")
    );

    agent.hang_up();
    agent.finish().await;
}

#[tokio::test]
async fn test_message_before_registration_is_rejected() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    agent.send(r#"{"hello":"relay"}"#);

    match agent.next_message().await {
        ControlMessage::Error { error } => assert!(error.contains("registration"), "{}", error),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(matches!(agent.next().await, Outbound::Close(Some(_))));
    assert!(matches!(agent.finish().await, CloseReason::ProtocolViolation(_)));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_malformed_and_invalid_registration() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    for frame in ["not json at all", r#"{"port":0}"#, r#"{"port":"http"}"#, r#"{"port":70000}"#] {
        let mut agent = Agent::connect(&handler);
        agent.send(frame);

        match agent.next_message().await {
            ControlMessage::Error { .. } => {}
            other => panic!("expected error for {:?}, got {:?}", frame, other),
        }
        assert!(
            matches!(agent.finish().await, CloseReason::ProtocolViolation(_)),
            "frame {:?} should be a protocol violation",
            frame
        );
    }

    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_oversized_invalid_port_is_not_echoed() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    agent.send(&format!(r#"{{"port":"{}"}}"#, "z".repeat(300)));

    match agent.next_message().await {
        ControlMessage::Error { error } => {
            assert!(error.contains("bad port value"), "{}", error);
            assert!(error.len() < 123, "error frame too long: {}", error.len());
        }
        other => panic!("expected error, got {:?}", other),
    }
    match agent.next().await {
        Outbound::Close(Some(reason)) => assert!(reason.len() < 123, "{}", reason),
        other => panic!("expected close with reason, got {:?}", other),
    }
    assert!(matches!(agent.finish().await, CloseReason::ProtocolViolation(_)));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_second_registration_closes_channel() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(3000).await;

    agent.send(r#"{"port":4000}"#);
    match agent.next_message().await {
        ControlMessage::Error { error } => assert!(error.contains(&public_id)),
        other => panic!("expected error, got {:?}", other),
    }

    assert!(matches!(agent.finish().await, CloseReason::ProtocolViolation(_)));
    assert!(registry.lookup(&public_id).is_none());
}

#[tokio::test]
async fn test_unknown_frames_after_registration_are_ignored() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(3000).await;

    agent.send("garbage");
    agent.send(r#"{"type":"status","ok":true}"#);

    // Channel must still be usable afterwards
    let session = registry.lookup(&public_id).unwrap();
    assert!(session.notify(ControlMessage::request("GET", "/")));
    drop(session);
    assert_eq!(agent.next_message().await, ControlMessage::request("GET", "/"));
    assert!(registry.exists(&public_id));

    agent.hang_up();
    assert_eq!(agent.finish().await, CloseReason::PeerClosed);
}

#[tokio::test(start_paused = true)]
async fn test_registration_timeout() {
    init_tracing();
    let (registry, handler) = handler_with(ControlConfig {
        registration_timeout: Duration::from_secs(5),
        ..quiet_config()
    });

    let mut agent = Agent::connect(&handler);
    assert_eq!(agent.next().await, Outbound::Close(None));
    assert_eq!(agent.finish().await, CloseReason::RegistrationTimeout);
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_after_silence() {
    init_tracing();
    let (registry, handler) = handler_with(ControlConfig {
        idle_timeout: Some(Duration::from_secs(10)),
        ..quiet_config()
    });

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(3000).await;

    assert_eq!(agent.next().await, Outbound::Close(None));
    assert_eq!(agent.finish().await, CloseReason::IdleTimeout);
    assert!(registry.lookup(&public_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pings_are_sent() {
    init_tracing();
    let (_registry, handler) = handler_with(ControlConfig {
        ping_interval: Some(Duration::from_secs(2)),
        ..quiet_config()
    });

    let mut agent = Agent::connect(&handler);
    agent.register(3000).await;

    assert_eq!(agent.next().await, Outbound::Ping);
    assert_eq!(agent.next().await, Outbound::Ping);

    agent.hang_up();
    assert_eq!(agent.finish().await, CloseReason::PeerClosed);
}

#[tokio::test]
async fn test_external_unregister_closes_channel() {
    init_tracing();
    let (registry, handler) = handler_with(quiet_config());

    let mut agent = Agent::connect(&handler);
    let public_id = agent.register(3000).await;

    assert!(registry.unregister(&public_id).is_some());
    assert_eq!(agent.next().await, Outbound::Close(None));
    assert_eq!(agent.finish().await, CloseReason::Unregistered);
}

struct FixedGenerator;

impl IdGenerator for FixedGenerator {
    fn generate(&self) -> String {
        "aaaaaa".to_string()
    }
}

#[tokio::test]
async fn test_exhausted_identifiers_report_error() {
    init_tracing();
    let registry = Arc::new(Registry::with_generator(Arc::new(FixedGenerator)).with_max_attempts(3));
    let handler = ControlHandler::new(registry.clone(), quiet_config());

    let mut first = Agent::connect(&handler);
    assert_eq!(first.register(3000).await, "aaaaaa");

    let mut second = Agent::connect(&handler);
    second.send(r#"{"port":4000}"#);
    match second.next_message().await {
        ControlMessage::Error { error } => assert!(error.contains("3 attempts"), "{}", error),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(
        second.finish().await,
        CloseReason::RegistrationFailed(RegistryError::RegistrationExhausted { attempts: 3 })
    );

    // The first agent keeps its identifier
    assert_eq!(registry.lookup("aaaaaa").unwrap().local_port(), 3000);

    first.hang_up();
    first.finish().await;
    assert!(registry.is_empty());
}
