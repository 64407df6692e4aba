//! Centralized Configuration Management
//!
//! This module consolidates every configuration structure used by the
//! Wirelink client. All structures deserialize with defaults for missing
//! fields so a TOML file only needs to name what it changes.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::middleware::LogLevel;

// ----------------------------------------------------------------------------
// Reconnect Configuration
// ----------------------------------------------------------------------------

/// Reconnection backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether transport failures trigger automatic reconnection
    pub enabled: bool,
    /// Attempts before the client gives up and enters `failed`
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any retry delay
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Randomize each delay by `± jitter_factor`
    pub jitter: bool,
    /// Relative jitter width (0.25 = ±25%)
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.25,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ----------------------------------------------------------------------------
// Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Liveness probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Time between heartbeats while connected
    pub interval_ms: u64,
    /// Time allowed for the server's reply
    pub timeout_ms: u64,
    /// Consecutive missed replies before the connection is forced closed
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Authentication Configuration
// ----------------------------------------------------------------------------

/// How the token is presented to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthTokenType {
    /// `Authorization: Bearer <token>` header on the upgrade request
    Bearer,
    /// `token=<token>` query parameter on the connection URL
    Query,
}

/// Authentication settings; the token provider itself is supplied to the
/// client builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token_type: AuthTokenType,
    /// Refresh the token when it expires within this window
    pub refresh_threshold_ms: u64,
    /// Fetch a fresh token and reconnect once when the server demands auth
    pub retry_on_auth_failure: bool,
    /// Upper bound on a single token provider call
    pub token_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_type: AuthTokenType::Bearer,
            refresh_threshold_ms: 300_000,
            retry_on_auth_failure: true,
            token_timeout_ms: 10_000,
        }
    }
}

impl AuthConfig {
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.refresh_threshold_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_millis(self.token_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Message Queue Configuration
// ----------------------------------------------------------------------------

/// Outbound queue used while the connection is down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Maximum queued messages; the oldest is dropped on overflow
    pub max_size: usize,
    /// Snapshot the queue to the offline store on every change
    pub persist_offline: bool,
    /// Messages sent per flush slice after reconnecting
    pub batch_size: usize,
    /// Pause between flush slices
    pub flush_interval_ms: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            persist_offline: false,
            batch_size: 10,
            flush_interval_ms: 100,
        }
    }
}

impl MessageQueueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Rate Limiting Configuration
// ----------------------------------------------------------------------------

/// Outgoing fixed-window rate limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub messages_per_second: u32,
    /// Minimum number of messages admitted per window
    pub burst_size: u32,
    pub window_size_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            messages_per_second: 10,
            burst_size: 20,
            window_size_ms: 1_000,
        }
    }
}

impl RateLimitingConfig {
    /// Messages admitted per window
    pub fn max_messages(&self) -> u32 {
        let per_window =
            (self.messages_per_second as u64 * self.window_size_ms).div_ceil(1_000) as u32;
        per_window.max(self.burst_size)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }
}

// ----------------------------------------------------------------------------
// Middleware Configuration
// ----------------------------------------------------------------------------

/// Transform middleware flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub validate_schema: bool,
    pub sanitize_content: bool,
    pub include_metadata: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            validate_schema: true,
            sanitize_content: true,
            include_metadata: true,
        }
    }
}

/// Incoming batching; disabled unless configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_size: usize,
    pub max_wait_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_wait_ms: 100,
        }
    }
}

impl BatchingConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Settings for the default middleware units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub transform: TransformConfig,
    /// Capacity of the deduplication cache
    pub dedup_cache_size: usize,
    pub batching: Option<BatchingConfig>,
    /// Level for the logging middleware; `None` leaves it out of the chain
    pub log_level: Option<LogLevel>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            transform: TransformConfig::default(),
            dedup_cache_size: 1_000,
            batching: None,
            log_level: Some(LogLevel::Debug),
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Quality Thresholds
// ----------------------------------------------------------------------------

/// One rung of the quality ladder; exceeding any limit fails the rung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThreshold {
    pub latency_ms: f64,
    pub error_rate: f64,
    pub reconnections: Option<u64>,
}

/// Thresholds for classifying connection quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub poor: QualityThreshold,
    pub fair: QualityThreshold,
    pub good: QualityThreshold,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            poor: QualityThreshold {
                latency_ms: 1_000.0,
                error_rate: 0.05,
                reconnections: Some(3),
            },
            fair: QualityThreshold {
                latency_ms: 500.0,
                error_rate: 0.02,
                reconnections: Some(1),
            },
            good: QualityThreshold {
                latency_ms: 200.0,
                error_rate: 0.005,
                reconnections: None,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for one client instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint (required)
    pub url: String,
    /// Sub-protocols offered during the handshake
    pub protocols: Vec<String>,
    /// Upper bound on a single transport open
    pub connection_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub authentication: Option<AuthConfig>,
    pub message_queue: MessageQueueConfig,
    pub rate_limiting: RateLimitingConfig,
    /// Compress outgoing payloads above the size threshold
    pub compression: bool,
    pub middleware: MiddlewareConfig,
    pub quality: QualityThresholds,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            protocols: Vec::new(),
            connection_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            authentication: None,
            message_queue: MessageQueueConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            compression: true,
            middleware: MiddlewareConfig::default(),
            quality: QualityThresholds::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for a server URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short timers and no jitter, for deterministic tests
    pub fn testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout_ms: 1_000,
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                backoff_factor: 2.0,
                jitter: false,
                jitter_factor: 0.0,
            },
            heartbeat: HeartbeatConfig {
                enabled: false,
                interval_ms: 1_000,
                timeout_ms: 200,
                max_missed: 2,
            },
            rate_limiting: RateLimitingConfig {
                messages_per_second: 1_000,
                burst_size: 1_000,
                window_size_ms: 1_000,
            },
            middleware: MiddlewareConfig {
                log_level: None,
                ..MiddlewareConfig::default()
            },
            ..Self::default()
        }
    }

    /// Aggressive liveness detection for interactive sessions
    pub fn low_latency(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout_ms: 5_000,
            reconnect: ReconnectConfig {
                initial_delay_ms: 250,
                max_delay_ms: 5_000,
                ..ReconnectConfig::default()
            },
            heartbeat: HeartbeatConfig {
                enabled: true,
                interval_ms: 10_000,
                timeout_ms: 2_000,
                max_missed: 2,
            },
            ..Self::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing { field: "url" });
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(invalid("reconnect.backoff_factor", "must be at least 1.0"));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(invalid(
                "reconnect.initial_delay_ms",
                "must not exceed reconnect.max_delay_ms",
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter_factor) {
            return Err(invalid("reconnect.jitter_factor", "must be in [0, 1)"));
        }
        if self.heartbeat.enabled {
            if self.heartbeat.interval_ms == 0 {
                return Err(invalid("heartbeat.interval_ms", "must be positive"));
            }
            if self.heartbeat.timeout_ms == 0 {
                return Err(invalid("heartbeat.timeout_ms", "must be positive"));
            }
            if self.heartbeat.max_missed == 0 {
                return Err(invalid("heartbeat.max_missed", "must be positive"));
            }
        }
        if self.message_queue.max_size == 0 {
            return Err(invalid("message_queue.max_size", "must be positive"));
        }
        if self.message_queue.batch_size == 0 {
            return Err(invalid("message_queue.batch_size", "must be positive"));
        }
        if self.rate_limiting.window_size_ms == 0 {
            return Err(invalid("rate_limiting.window_size_ms", "must be positive"));
        }
        if self.middleware.dedup_cache_size == 0 {
            return Err(invalid("middleware.dedup_cache_size", "must be positive"));
        }
        if let Some(batching) = &self.middleware.batching {
            if batching.max_size == 0 {
                return Err(invalid("middleware.batching.max_size", "must be positive"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
