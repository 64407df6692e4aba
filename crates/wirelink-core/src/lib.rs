//! Wirelink Core
//!
//! This crate provides the transport-independent pieces of the Wirelink
//! real-time client: the message envelope, client configuration, the
//! composable middleware units and the chain that runs them, the outbound
//! message queue with offline persistence, reconnect backoff, and the metrics
//! collector. The connection manager that drives all of this lives in
//! `wirelink-client`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod backoff;
pub mod chain;
pub mod config;
pub mod errors;
pub mod message;
pub mod metrics;
pub mod middleware;
pub mod persistence;
pub mod queue;
pub mod timer;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use backoff::ReconnectPolicy;
pub use chain::MiddlewareChain;
pub use config::{
    AuthConfig, AuthTokenType, BatchingConfig, ClientConfig, HeartbeatConfig, MessageQueueConfig,
    MiddlewareConfig, QualityThreshold, QualityThresholds, RateLimitingConfig, ReconnectConfig,
    TransformConfig,
};
pub use errors::{
    AuthError, CompressionError, ConfigError, PersistenceError, Result, StateTransitionError,
    TransportError, ValidationError, WirelinkError,
};
pub use message::{Message, MessageType, Priority, PROTOCOL_VERSION};
pub use metrics::{
    ConnectionQuality, ErrorEvent, ErrorKind, MetricsCollector, MetricsSnapshot,
};
pub use middleware::{
    Batch, BatchHandler, BatchKey, BatchingMiddleware, CompressionMiddleware,
    DeduplicationMiddleware, Direction, FlushReason, LogLevel, LoggingMiddleware,
    MessageMiddleware, MiddlewareResult, MiddlewareStats, RateLimitMiddleware,
    TransformMiddleware,
};
pub use persistence::{JsonFileStore, MemoryStore, OfflineStore, QueueSnapshot};
pub use queue::{MessageQueue, QueuePush};
pub use timer::TimerSet;
pub use types::{SharedTimeSource, SystemTimeSource, TimeSource, Timestamp};

#[cfg(any(test, feature = "testing"))]
pub use types::ManualTimeSource;
