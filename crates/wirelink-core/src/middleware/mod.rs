//! Message middleware
//!
//! Each unit looks at messages flowing in one or both directions and either
//! passes a (possibly rewritten) message on, or drops it by returning
//! `Ok(None)`. Units are composed by [`crate::chain::MiddlewareChain`].

use core::fmt;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::errors::WirelinkError;
use crate::message::Message;

pub mod batching;
pub mod compression;
pub mod deduplication;
pub mod logging;
pub mod rate_limit;
pub mod transform;

pub use batching::{Batch, BatchHandler, BatchKey, BatchingMiddleware, FlushReason};
pub use compression::CompressionMiddleware;
pub use deduplication::DeduplicationMiddleware;
pub use logging::{LogLevel, LoggingMiddleware};
pub use rate_limit::RateLimitMiddleware;
pub use transform::TransformMiddleware;

/// Outcome of one middleware step: a message to pass on, or `None` to drop it
pub type MiddlewareResult = Result<Option<Message>, WirelinkError>;

// ----------------------------------------------------------------------------
// Direction
// ----------------------------------------------------------------------------

/// Which way a message is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Server to caller
    Incoming,
    /// Caller to server
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

// ----------------------------------------------------------------------------
// Middleware Stats
// ----------------------------------------------------------------------------

/// Per-unit counters reported through the metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiddlewareStats {
    /// Messages the unit looked at
    pub processed: u64,
    /// Messages the unit dropped
    pub dropped: u64,
    /// Errors the unit returned or the chain caught
    pub errors: u64,
}

impl MiddlewareStats {
    pub(crate) fn pass(&mut self, message: Option<Message>) -> Option<Message> {
        self.processed += 1;
        if message.is_none() {
            self.dropped += 1;
        }
        message
    }
}

// ----------------------------------------------------------------------------
// Middleware Trait
// ----------------------------------------------------------------------------

/// A composable message processing step
///
/// Both directions default to passthrough, so a unit only implements the
/// side it cares about.
pub trait MessageMiddleware: Send {
    /// Stable name used for removal and in logs
    fn name(&self) -> &'static str;

    /// Process a message received from the server
    fn incoming(&mut self, message: Message) -> MiddlewareResult {
        Ok(Some(message))
    }

    /// Process a message about to be sent to the server
    fn outgoing(&mut self, message: Message) -> MiddlewareResult {
        Ok(Some(message))
    }

    /// Deliver anything the unit is holding back
    fn flush(&mut self) {}

    /// Release timers and held state without delivering it
    fn shutdown(&mut self) {}

    /// Pick up changed settings after a configuration update
    fn reconfigure(&mut self, _config: &ClientConfig) {}

    fn stats(&self) -> MiddlewareStats {
        MiddlewareStats::default()
    }
}

impl fmt::Debug for dyn MessageMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMiddleware")
            .field("name", &self.name())
            .finish()
    }
}
