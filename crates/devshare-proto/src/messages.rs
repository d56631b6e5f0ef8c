//! Control channel message types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registration frame sent by the agent as the first message on the channel
///
/// Wire form: `{"port": 8080}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Port on the agent's host that receives forwarded traffic
    pub port: u16,
}

/// Frames pushed from the relay to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Registration acknowledged; carries the assigned public identifier
    Connected { subdomain: String },
    /// A public request was forwarded to the agent's local port (informational)
    Request { method: String, path: String },
    /// Fatal condition; the relay closes the channel right after sending it
    Error { error: String },
}

impl ControlMessage {
    pub fn connected(subdomain: impl Into<String>) -> Self {
        Self::Connected {
            subdomain: subdomain.into(),
        }
    }

    pub fn request(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Request {
            method: method.into(),
            path: path.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a relay frame (used on the agent side)
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A decoded frame received from an agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// `{"port": n}`
    Register(RegisterRequest),
    /// Well-formed JSON that is not a registration
    Unknown(serde_json::Value),
}

/// Errors decoding agent frames
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

impl AgentMessage {
    /// Decode a text frame sent by an agent
    ///
    /// Any JSON object carrying a `port` key is treated as a registration
    /// attempt; if the port is not an integer in `1..=65535` the frame is an
    /// invalid registration rather than an unknown message.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        let Some(port) = value.get("port") else {
            return Ok(Self::Unknown(value));
        };

        let port = port
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                DecodeError::InvalidRegistration(format!("bad port value {}", excerpt(port)))
            })?;

        if port == 0 {
            return Err(DecodeError::InvalidRegistration(
                "port must be non-zero".to_string(),
            ));
        }

        Ok(Self::Register(RegisterRequest { port }))
    }
}

/// Longest slice of an agent-supplied value echoed back in errors
const MAX_ECHO_LEN: usize = 32;

fn excerpt(value: &serde_json::Value) -> String {
    let text = value.to_string();
    match text.char_indices().nth(MAX_ECHO_LEN) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

impl RegisterRequest {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
