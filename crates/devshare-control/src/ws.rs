//! Control transport over an axum WebSocket

use crate::transport::{ChannelError, ControlTransport, Inbound};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};

/// Largest close reason that fits a control frame (125 bytes minus the code)
const MAX_CLOSE_REASON: usize = 123;

#[async_trait]
impl ControlTransport for WebSocket {
    async fn recv_frame(&mut self) -> Result<Option<Inbound>, ChannelError> {
        match WebSocket::recv(self).await {
            None => Ok(None),
            Some(Err(e)) => Err(ChannelError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => Ok(Some(Inbound::Text(text.as_str().to_string()))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Inbound::Text(
                String::from_utf8_lossy(&data).into_owned(),
            ))),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Ok(Some(Inbound::Heartbeat)),
            Some(Ok(Message::Close(_))) => Ok(None),
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        WebSocket::send(self, Message::Text(text.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), ChannelError> {
        WebSocket::send(self, Message::Ping(Bytes::new()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self, reason: Option<String>) {
        let frame = CloseFrame {
            code: if reason.is_some() {
                close_code::POLICY
            } else {
                close_code::NORMAL
            },
            reason: close_reason(reason.as_deref().unwrap_or_default()).into(),
        };
        let _ = WebSocket::send(self, Message::Close(Some(frame))).await;
    }
}

/// Cut `reason` to fit a close frame without splitting a character
fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
