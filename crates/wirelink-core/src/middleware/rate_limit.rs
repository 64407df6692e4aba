//! Outgoing rate limiting
//!
//! A fixed window counter: the window restarts once `window` has elapsed since
//! it opened, and messages beyond the window capacity are dropped.

use core::time::Duration;
use tracing::warn;

use super::{MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::{ClientConfig, RateLimitingConfig};
use crate::message::Message;
use crate::types::{SharedTimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Rate Window
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Timestamp,
    count: u32,
}

// ----------------------------------------------------------------------------
// Rate Limit Middleware
// ----------------------------------------------------------------------------

/// Drops outgoing messages above `max_messages` per window
pub struct RateLimitMiddleware {
    max_messages: u32,
    window_ms: u64,
    window: Option<RateWindow>,
    time_source: SharedTimeSource,
    stats: MiddlewareStats,
}

impl RateLimitMiddleware {
    /// Limiter admitting `max_messages` per `window`
    pub fn new(max_messages: u32, window: Duration, time_source: SharedTimeSource) -> Self {
        Self {
            max_messages,
            window_ms: window.as_millis() as u64,
            window: None,
            time_source,
            stats: MiddlewareStats::default(),
        }
    }

    /// Limiter derived from the client's rate limiting settings
    pub fn from_config(config: &RateLimitingConfig, time_source: SharedTimeSource) -> Self {
        Self::new(config.max_messages(), config.window(), time_source)
    }

    /// Messages admitted in the current window
    pub fn current_count(&self) -> u32 {
        self.window.map_or(0, |window| window.count)
    }

    /// Messages dropped since creation
    pub fn dropped(&self) -> u64 {
        self.stats.dropped
    }

    fn admit(&mut self) -> bool {
        let now = self.time_source.now();
        let window = match self.window {
            Some(window) if now - window.started_at < self.window_ms => window,
            _ => RateWindow {
                started_at: now,
                count: 0,
            },
        };

        if window.count >= self.max_messages {
            self.window = Some(window);
            return false;
        }

        self.window = Some(RateWindow {
            count: window.count + 1,
            ..window
        });
        true
    }
}

impl MessageMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn outgoing(&mut self, message: Message) -> MiddlewareResult {
        if self.admit() {
            return Ok(self.stats.pass(Some(message)));
        }

        warn!(
            kind = %message.kind,
            limit = self.max_messages,
            window_ms = self.window_ms,
            "Rate limit exceeded, dropping outgoing message"
        );
        Ok(self.stats.pass(None))
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        self.max_messages = config.rate_limiting.max_messages();
        self.window_ms = config.rate_limiting.window_size_ms;
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
