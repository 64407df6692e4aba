//! Authentication tokens
//!
//! The client never talks to an auth backend itself; it asks a
//! [`TokenProvider`] for a token before every connection attempt and again
//! shortly before the current token expires.

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use core::future::Future;
use core::time::Duration;
use std::sync::Arc;
use wirelink_core::{AuthError, Timestamp};

// ----------------------------------------------------------------------------
// Auth Token
// ----------------------------------------------------------------------------

/// Token plus its expiry, when known
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: Option<Timestamp>,
}

impl AuthToken {
    /// Token with expiry taken from its JWT `exp` claim, if it has one
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let expires_at = jwt_expiry(&value);
        Self { value, expires_at }
    }

    /// Override the expiry
    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// When a refresh should happen, given the refresh threshold
    pub fn refresh_at(&self, threshold: Duration) -> Option<Timestamp> {
        self.expires_at
            .map(|expiry| expiry.saturating_sub_duration(threshold))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

impl core::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Expiry of a JWT from its `exp` claim (seconds since epoch)
pub fn jwt_expiry(token: &str) -> Option<Timestamp> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_u64()?;
    Some(Timestamp::new(exp.saturating_mul(1_000)))
}

// ----------------------------------------------------------------------------
// Token Provider
// ----------------------------------------------------------------------------

/// Source of authentication tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<AuthToken, AuthError>;
}

/// Shared provider handle
pub type SharedTokenProvider = Arc<dyn TokenProvider>;

/// Provider backed by an async closure
pub struct FnTokenProvider<F> {
    fetch: F,
}

#[async_trait]
impl<F, Fut> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AuthToken, AuthError>> + Send + 'static,
{
    async fn token(&self) -> Result<AuthToken, AuthError> {
        (self.fetch)().await
    }
}

/// Wrap an async closure as a token provider
pub fn token_provider_fn<F, Fut>(fetch: F) -> SharedTokenProvider
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AuthToken, AuthError>> + Send + 'static,
{
    Arc::new(FnTokenProvider { fetch })
}

/// Ask the provider for a token, bounded by `timeout`
pub async fn fetch_token(
    provider: &dyn TokenProvider,
    timeout: Duration,
) -> Result<AuthToken, AuthError> {
    match tokio::time::timeout(timeout, provider.token()).await {
        Ok(result) => {
            let token = result?;
            if token.value.is_empty() {
                return Err(AuthError::InvalidToken {
                    reason: "empty token".into(),
                });
            }
            Ok(token)
        }
        Err(_) => Err(AuthError::Timeout {
            duration_ms: timeout.as_millis() as u64,
        }),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
