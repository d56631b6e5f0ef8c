//! Control channel client
//!
//! Opens the WebSocket to the relay, registers the local port and then
//! yields the relay's notifications as [`AgentEvent`]s.

use devshare_proto::{ControlMessage, RegisterRequest};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AgentConfig;

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Relay rejected the agent: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Control channel closed")]
    Closed,
}

/// Something the relay reported after registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A public request was forwarded to the local service
    Request { method: String, path: String },
}

pub struct AgentConnector {
    config: AgentConfig,
}

impl AgentConnector {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Connect and register; resolves once the relay assigns a public id
    pub async fn connect(self) -> Result<AgentConnection, ClientError> {
        let url = Url::parse(&self.config.relay_url)
            .map_err(|e| ClientError::Connect(format!("invalid relay URL: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Connect(format!(
                "unsupported scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::Connect(format!("invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Connecting to relay at {}", url);
        let (mut stream, _) = match timeout(self.config.connect_timeout, connect_async(request)).await
        {
            Err(_) => {
                return Err(ClientError::Connect(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout
                )))
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                return Err(ClientError::Rejected(format!(
                    "relay answered HTTP {}",
                    response.status()
                )))
            }
            Ok(Err(e)) => return Err(ClientError::Connect(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        let register = RegisterRequest {
            port: self.config.local_port,
        }
        .to_json()
        .map_err(|e| ClientError::Protocol(e.to_string()))?;

        stream
            .send(Message::Text(register.into()))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let public_id = match timeout(
            self.config.registration_timeout,
            Self::await_connected(&mut stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ClientError::Protocol(
                    "relay did not confirm registration".to_string(),
                ))
            }
        };

        info!(
            "Registered local port {} as {}",
            self.config.local_port, public_id
        );
        Ok(AgentConnection { public_id, stream })
    }

    async fn await_connected(stream: &mut ControlStream) -> Result<String, ClientError> {
        match read_control(stream).await? {
            None => Err(ClientError::Closed),
            Some(ControlMessage::Connected { subdomain }) => Ok(subdomain),
            Some(ControlMessage::Error { error }) => Err(ClientError::Rejected(error)),
            Some(other) => Err(ClientError::Protocol(format!(
                "unexpected message before registration: {:?}",
                other
            ))),
        }
    }
}

/// A registered control channel
pub struct AgentConnection {
    public_id: String,
    stream: ControlStream,
}

impl AgentConnection {
    /// Identifier the relay assigned to this agent
    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    /// Next notification, or `None` once the relay closes the channel
    ///
    /// An `error` frame from the relay surfaces as [`ClientError::Rejected`].
    pub async fn next_event(&mut self) -> Result<Option<AgentEvent>, ClientError> {
        loop {
            match read_control(&mut self.stream).await? {
                None => return Ok(None),
                Some(ControlMessage::Request { method, path }) => {
                    return Ok(Some(AgentEvent::Request { method, path }))
                }
                Some(ControlMessage::Error { error }) => return Err(ClientError::Rejected(error)),
                Some(ControlMessage::Connected { subdomain }) => {
                    warn!("Ignoring repeated connected frame for {}", subdomain);
                }
            }
        }
    }

    /// Close the control channel
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(ClientError::Protocol(e.to_string())),
        }
    }
}

/// Read the next control frame, skipping transport-level frames
async fn read_control(stream: &mut ControlStream) -> Result<Option<ControlMessage>, ClientError> {
    loop {
        let message = match stream.next().await {
            None => return Ok(None),
            Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(ClientError::Protocol(e.to_string())),
            Some(Ok(message)) => message,
        };

        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    debug!("Relay closed control channel: {} {}", frame.code, frame.reason);
                }
                return Ok(None);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        return ControlMessage::from_json(&text)
            .map(Some)
            .map_err(|e| ClientError::Protocol(format!("undecodable frame {:?}: {}", text, e)));
    }
}
