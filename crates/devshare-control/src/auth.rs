//! Gatekeeping for control channel upgrades
//!
//! The relay core trusts any channel that completes registration; an
//! authorizer decides who may open one in the first place.

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid credentials")]
    InvalidCredentials,
}

/// Decides whether an upgrade request may open a control channel
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError>;
}

/// Accepts every channel
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl ChannelAuthorizer for AllowAll {
    async fn authorize(&self, _headers: &HeaderMap) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Requires `Authorization: Bearer <token>` with a shared token
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken").finish_non_exhaustive()
    }
}

#[async_trait]
impl ChannelAuthorizer for BearerToken {
    async fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;

        let presented = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or(AuthError::InvalidCredentials)?;

        if constant_time_eq(presented.trim().as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.authorize(&HeaderMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_bearer_token_accepts_match() {
        let auth = BearerToken::new("s3cret");
        assert!(auth.authorize(&headers_with("Bearer s3cret")).await.is_ok());
    }

    #[tokio::test]
    async fn test_bearer_token_rejects() {
        let auth = BearerToken::new("s3cret");

        assert_eq!(
            auth.authorize(&HeaderMap::new()).await,
            Err(AuthError::MissingCredentials)
        );
        assert_eq!(
            auth.authorize(&headers_with("Bearer nope")).await,
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            auth.authorize(&headers_with("Basic s3cret")).await,
            Err(AuthError::InvalidCredentials)
        );
    }
}
