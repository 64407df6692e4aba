//! Incoming message deduplication
//!
//! Messages are identified by `type:id:timestamp`. Seen identities are kept in
//! a bounded FIFO set; once the set is full the oldest identity is evicted, so
//! a very old duplicate can slip through again.

use hashbrown::HashSet;
use std::collections::VecDeque;
use tracing::debug;

use super::{MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::ClientConfig;
use crate::message::Message;

/// Default number of identities remembered
pub const DEFAULT_CACHE_SIZE: usize = 1_000;

// ----------------------------------------------------------------------------
// Bounded FIFO Set
// ----------------------------------------------------------------------------

/// Set with insertion-order eviction
#[derive(Debug, Clone)]
pub struct BoundedFifoSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedFifoSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(DEFAULT_CACHE_SIZE)),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    /// Insert a key; returns false if it was already present
    pub fn insert(&mut self, key: String) -> bool {
        if self.members.contains(&key) {
            return false;
        }

        self.members.insert(key.clone());
        self.order.push_back(key);
        self.evict_overflow();
        true
    }

    /// Change the capacity, evicting the oldest keys if needed
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict_overflow();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    fn evict_overflow(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Middleware
// ----------------------------------------------------------------------------

/// Drops incoming messages whose identity was seen recently
pub struct DeduplicationMiddleware {
    seen: BoundedFifoSet,
    stats: MiddlewareStats,
}

impl DeduplicationMiddleware {
    pub fn new(max_cache_size: usize) -> Self {
        Self {
            seen: BoundedFifoSet::new(max_cache_size),
            stats: MiddlewareStats::default(),
        }
    }

    /// Identities currently remembered
    pub fn cache_len(&self) -> usize {
        self.seen.len()
    }
}

impl Default for DeduplicationMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl MessageMiddleware for DeduplicationMiddleware {
    fn name(&self) -> &'static str {
        "deduplication"
    }

    fn incoming(&mut self, message: Message) -> MiddlewareResult {
        // Nothing to key on; schema validation decides about these
        let Some(key) = message.dedup_key() else {
            return Ok(self.stats.pass(Some(message)));
        };

        if !self.seen.insert(key) {
            debug!(
                kind = %message.kind,
                id = message.id.as_deref().unwrap_or_default(),
                "Dropping duplicate message"
            );
            return Ok(self.stats.pass(None));
        }

        Ok(self.stats.pass(Some(message)))
    }

    fn shutdown(&mut self) {
        self.seen.clear();
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        self.seen.set_capacity(config.middleware.dedup_cache_size);
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
