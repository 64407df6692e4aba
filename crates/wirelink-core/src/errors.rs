//! Error types for the Wirelink client
//!
//! Per-message failures (validation, compression, rate limiting) are handled
//! inside the middleware chain and never reach the caller; connection-level
//! failures (transport, auth) surface through connection-state transitions.
//! `WirelinkError` unifies all of them for the places where a `Result` is
//! returned.

use std::io;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Malformed incoming message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message is not a JSON object: {reason}")]
    Malformed { reason: String },
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("Unknown message type: {kind}")]
    UnknownType { kind: String },
    #[error("Timestamp is not numeric")]
    InvalidTimestamp,
}

/// Socket-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Invalid transport URL: {url}")]
    InvalidUrl { url: String },
}

/// Token provider failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Token provider rejected: {reason}")]
    ProviderRejected { reason: String },
    #[error("Token provider timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },
    #[error("Server requires authentication: {reason}")]
    AuthRequired { reason: String },
    #[error("Authentication is configured but no token provider was supplied")]
    ProviderMissing,
}

/// Compression and decompression failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressionError {
    #[error("Compression failed: {reason}")]
    Encode { reason: String },
    #[error("Decompression failed: {reason}")]
    Decode { reason: String },
}

/// Invalid client configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Missing required setting: {field}")]
    Missing { field: &'static str },
}

/// Offline queue persistence failures
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Persistence I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Persistence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Illegal connection state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event}")]
    InvalidTransition { from_state: String, event: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the Wirelink client
#[derive(Debug, thiserror::Error)]
pub enum WirelinkError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rate limited: {reason}")]
    RateLimited { reason: String },

    #[error("Middleware {name} failed: {reason}")]
    Middleware { name: &'static str, reason: String },

    #[error("Scheduling error: {reason}")]
    Scheduling { reason: String },

    #[error("Client has been shut down")]
    ClientClosed,
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl WirelinkError {
    /// Create a rate limiting error with a reason
    pub fn rate_limited<T: Into<String>>(reason: T) -> Self {
        WirelinkError::RateLimited {
            reason: reason.into(),
        }
    }

    /// Create a middleware failure
    pub fn middleware<T: Into<String>>(name: &'static str, reason: T) -> Self {
        WirelinkError::Middleware {
            name,
            reason: reason.into(),
        }
    }

    /// Create a transport connection failed error
    pub fn connection_failed<U: Into<String>, R: Into<String>>(url: U, reason: R) -> Self {
        WirelinkError::Transport(TransportError::ConnectionFailed {
            url: url.into(),
            reason: reason.into(),
        })
    }

    /// Create a configuration error for a field
    pub fn invalid_config<T: Into<String>>(field: &'static str, reason: T) -> Self {
        WirelinkError::Configuration(ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        })
    }

    /// Whether this error came from authentication
    pub fn is_auth(&self) -> bool {
        matches!(self, WirelinkError::Auth(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, WirelinkError>;
