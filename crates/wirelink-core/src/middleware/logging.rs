//! Message logging
//!
//! Passthrough in both directions; records a one-line summary of each message
//! at the configured level.

use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Direction, MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::ClientConfig;
use crate::message::Message;

/// Level at which message summaries are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Logs every message passing through the chain
pub struct LoggingMiddleware {
    level: LogLevel,
    stats: MiddlewareStats,
}

impl LoggingMiddleware {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            stats: MiddlewareStats::default(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    fn record(&mut self, direction: Direction, message: &Message) {
        let kind = message.kind.as_str();
        let id = message.id.as_deref().unwrap_or_default();
        let timestamp = message.timestamp.map(|t| t.as_millis());
        let size = message.payload_size();

        match self.level {
            LogLevel::Debug => debug!(%direction, kind, id, ?timestamp, size, "Message"),
            LogLevel::Info => info!(%direction, kind, id, ?timestamp, size, "Message"),
            LogLevel::Warn => warn!(%direction, kind, id, ?timestamp, size, "Message"),
            LogLevel::Error => error!(%direction, kind, id, ?timestamp, size, "Message"),
        }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl MessageMiddleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn incoming(&mut self, message: Message) -> MiddlewareResult {
        self.record(Direction::Incoming, &message);
        Ok(self.stats.pass(Some(message)))
    }

    fn outgoing(&mut self, message: Message) -> MiddlewareResult {
        self.record(Direction::Outgoing, &message);
        Ok(self.stats.pass(Some(message)))
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        if let Some(level) = config.middleware.log_level {
            self.level = level;
        }
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}
