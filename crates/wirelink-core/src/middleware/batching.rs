//! Priority batching of incoming messages
//!
//! Incoming messages are grouped by `(type, priority)`. A group is delivered
//! to the batch handler when it reaches `max_size`, or `max_wait` after its
//! first pending message arrived, whichever comes first. The middleware
//! swallows every message; consumers receive them only through batches.
//!
//! Group state is shared with the flush timers behind one mutex, so the size
//! check and the append can never interleave with a timer flush.

use core::fmt;
use core::time::Duration;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

use super::{MessageMiddleware, MiddlewareResult, MiddlewareStats};
use crate::config::{BatchingConfig, ClientConfig};
use crate::message::{Message, MessageType, Priority};
use crate::timer::TimerSet;
use crate::types::{SharedTimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Batch Types
// ----------------------------------------------------------------------------

/// Group identity: message kind plus its priority bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BatchKey {
    pub kind: MessageType,
    pub priority: Priority,
}

impl BatchKey {
    pub fn for_message(message: &Message) -> Self {
        Self {
            kind: message.kind.clone(),
            priority: message.priority(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.priority)
    }
}

/// Why a batch was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The group reached `max_size`
    Size,
    /// `max_wait` elapsed
    Timeout,
    /// Explicit flush, e.g. on disconnect
    Forced,
}

/// Messages delivered together, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub key: BatchKey,
    pub messages: Vec<Message>,
    pub flushed_at: Timestamp,
    pub reason: FlushReason,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Receiver for delivered batches
pub type BatchHandler = Arc<dyn Fn(Batch) + Send + Sync>;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

struct BatchState {
    groups: HashMap<BatchKey, Vec<Message>>,
    timers: TimerSet<BatchKey>,
    /// Generation of the live timer per group; stale firings are ignored
    armed: HashMap<BatchKey, u64>,
    next_generation: u64,
    handler: Option<BatchHandler>,
    destroyed: bool,
    batches_flushed: u64,
}

impl BatchState {
    fn flush_group(&mut self, key: &BatchKey, reason: FlushReason, now: Timestamp) {
        self.timers.cancel(key);
        self.armed.remove(key);
        let Some(messages) = self.groups.remove(key) else {
            return;
        };
        if messages.is_empty() || self.destroyed {
            return;
        }

        self.batches_flushed += 1;
        debug!(group = %key, size = messages.len(), ?reason, "Flushing batch");

        let batch = Batch {
            key: key.clone(),
            messages,
            flushed_at: now,
            reason,
        };
        match &self.handler {
            Some(handler) => handler(batch),
            None => warn!(group = %key, "No batch handler registered, discarding batch"),
        }
    }

    /// A group timer woke up; only the generation armed last may flush
    fn timer_fired(&mut self, key: &BatchKey, generation: u64, now: Timestamp) {
        if self.armed.get(key) != Some(&generation) {
            trace!(group = %key, generation, "Ignoring stale batch timer");
            return;
        }
        self.armed.remove(key);
        self.timers.release(key);
        if !self.destroyed {
            self.flush_group(key, FlushReason::Timeout, now);
        }
    }
}

// ----------------------------------------------------------------------------
// Batching Middleware
// ----------------------------------------------------------------------------

/// Groups incoming messages and delivers them to a batch handler
pub struct BatchingMiddleware {
    state: Arc<Mutex<BatchState>>,
    max_size: usize,
    max_wait: Duration,
    time_source: SharedTimeSource,
    stats: MiddlewareStats,
}

impl BatchingMiddleware {
    pub fn new(config: &BatchingConfig, time_source: SharedTimeSource) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState {
                groups: HashMap::new(),
                timers: TimerSet::new(),
                armed: HashMap::new(),
                next_generation: 0,
                handler: None,
                destroyed: false,
                batches_flushed: 0,
            })),
            max_size: config.max_size.max(1),
            max_wait: config.max_wait(),
            time_source,
            stats: MiddlewareStats::default(),
        }
    }

    /// Set the receiver for delivered batches
    pub fn with_handler(self, handler: BatchHandler) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn set_handler(&self, handler: BatchHandler) {
        self.state.lock().handler = Some(handler);
    }

    /// Messages waiting in all groups
    pub fn pending(&self) -> usize {
        self.state.lock().groups.values().map(Vec::len).sum()
    }

    /// Batches delivered so far
    pub fn batches_flushed(&self) -> u64 {
        self.state.lock().batches_flushed
    }

    /// Deliver every pending group now
    pub fn flush_all(&self) {
        let now = self.time_source.now();
        let mut state = self.state.lock();
        let keys: Vec<BatchKey> = state.groups.keys().cloned().collect();
        for key in keys {
            state.flush_group(&key, FlushReason::Forced, now);
        }
    }

    fn arm_timer(&self, state: &mut BatchState, key: BatchKey) {
        let weak: Weak<Mutex<BatchState>> = Arc::downgrade(&self.state);
        let time_source = self.time_source.clone();
        let timer_key = key.clone();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.armed.insert(key.clone(), generation);

        let armed = state.timers.arm(key.clone(), self.max_wait, move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            state
                .lock()
                .timer_fired(&timer_key, generation, time_source.now());
        });

        if let Err(e) = armed {
            warn!(group = %key, error = %e, "Cannot schedule batch timer, flushing now");
            state.flush_group(&key, FlushReason::Forced, self.time_source.now());
        }
    }
}

impl MessageMiddleware for BatchingMiddleware {
    fn name(&self) -> &'static str {
        "batching"
    }

    fn incoming(&mut self, message: Message) -> MiddlewareResult {
        self.stats.processed += 1;

        let key = BatchKey::for_message(&message);
        let mut state = self.state.lock();
        if state.destroyed {
            self.stats.dropped += 1;
            return Ok(None);
        }

        let group = state.groups.entry(key.clone()).or_default();
        group.push(message);
        let size = group.len();

        if size >= self.max_size {
            state.flush_group(&key, FlushReason::Size, self.time_source.now());
        } else if !state.timers.is_armed(&key) {
            self.arm_timer(&mut state, key);
        }

        Ok(None)
    }

    fn flush(&mut self) {
        self.flush_all();
    }

    fn shutdown(&mut self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.timers.cancel_all();
        state.armed.clear();
        state.groups.clear();
        state.handler = None;
    }

    fn reconfigure(&mut self, config: &ClientConfig) {
        if let Some(batching) = &config.middleware.batching {
            self.max_size = batching.max_size.max(1);
            self.max_wait = batching.max_wait();
        }
    }

    fn stats(&self) -> MiddlewareStats {
        self.stats.clone()
    }
}

impl Drop for BatchingMiddleware {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.timers.cancel_all();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemTimeSource;
    use serde_json::json;

    fn collector() -> (BatchHandler, Arc<Mutex<Vec<Batch>>>) {
        let batches: Arc<Mutex<Vec<Batch>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let handler: BatchHandler = Arc::new(move |batch: Batch| sink.lock().push(batch));
        (handler, batches)
    }

    fn batching(max_size: usize, max_wait_ms: u64) -> BatchingMiddleware {
        BatchingMiddleware::new(
            &BatchingConfig {
                max_size,
                max_wait_ms,
            },
            SystemTimeSource::shared(),
        )
    }

    fn message(kind: &str, n: u64) -> Message {
        Message::new(kind, json!({ "n": n })).with_id(format!("{}-{}", kind, n))
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_immediately() {
        let (handler, batches) = collector();
        let mut batching = batching(2, 1_000).with_handler(handler);

        assert_eq!(batching.incoming(message("notification", 1)).unwrap(), None);
        assert!(batches.lock().is_empty());
        assert_eq!(batching.incoming(message("notification", 2)).unwrap(), None);

        let delivered = batches.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].reason, FlushReason::Size);
        assert_eq!(delivered[0].len(), 2);
        drop(delivered);
        assert_eq!(batching.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_trigger() {
        let (handler, batches) = collector();
        let mut batching = batching(10, 100).with_handler(handler);

        batching.incoming(message("notification", 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        batching.incoming(message("notification", 2)).unwrap();
        assert!(batches.lock().is_empty());

        // The timer armed by the first message fires at 100ms
        tokio::time::sleep(Duration::from_millis(60)).await;
        let delivered = batches.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].reason, FlushReason::Timeout);
        assert_eq!(delivered[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_separate() {
        let (handler, batches) = collector();
        let mut batching = batching(2, 100).with_handler(handler);

        batching.incoming(message("notification", 1)).unwrap();
        batching.incoming(message("error", 1)).unwrap();
        batching.incoming(message("notification", 2)).unwrap();

        {
            let delivered = batches.lock();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].key.kind, MessageType::Notification);
            assert_eq!(delivered[0].key.priority, Priority::Low);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let delivered = batches.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].key.priority, Priority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_and_shutdown() {
        let (handler, batches) = collector();
        let mut batching = batching(10, 100).with_handler(handler);

        batching.incoming(message("notification", 1)).unwrap();
        batching.incoming(message("presence_update", 1)).unwrap();
        batching.flush();
        assert_eq!(batches.lock().len(), 2);
        assert!(batches.lock().iter().all(|b| b.reason == FlushReason::Forced));

        batching.incoming(message("notification", 2)).unwrap();
        batching.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Pending messages are discarded and later input is ignored
        assert_eq!(batches.lock().len(), 2);
        batching.incoming(message("notification", 3)).unwrap();
        batching.flush();
        assert_eq!(batches.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_flush_rearmed_group() {
        let (handler, batches) = collector();
        let mut batching = batching(2, 100).with_handler(handler);
        let key = BatchKey::for_message(&message("notification", 1));

        batching.incoming(message("notification", 1)).unwrap();
        let stale = batching.state.lock().armed[&key];
        batching.incoming(message("notification", 2)).unwrap();
        assert_eq!(batches.lock().len(), 1);

        // A new group arms a fresh timer; the old firing must not flush it
        batching.incoming(message("notification", 3)).unwrap();
        let now = batching.time_source.now();
        batching.state.lock().timer_fired(&key, stale, now);
        assert_eq!(batches.lock().len(), 1);
        assert_eq!(batching.pending(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let delivered = batches.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].reason, FlushReason::Timeout);
        assert_eq!(delivered[1].len(), 1);
    }

    #[test]
    fn test_without_runtime_flushes_immediately() {
        let (handler, batches) = collector();
        let mut batching = batching(10, 100).with_handler(handler);

        batching.incoming(message("notification", 1)).unwrap();
        assert_eq!(batches.lock().len(), 1);
        assert_eq!(batching.pending(), 0);
    }
}
