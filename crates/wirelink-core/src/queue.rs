//! Outbound message queue
//!
//! Holds messages sent while the connection is down. The queue is bounded:
//! when full, the oldest message is dropped to make room. With offline
//! persistence enabled every mutation is written through to an
//! [`OfflineStore`], and a new queue starts from the stored snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MessageQueueConfig;
use crate::message::Message;
use crate::persistence::{OfflineStore, QueueSnapshot};
use crate::types::SharedTimeSource;

/// Result of queueing a message
#[derive(Debug, Clone, PartialEq)]
pub enum QueuePush {
    /// Queued without displacing anything
    Queued { depth: usize },
    /// Queued after dropping the oldest entry
    DroppedOldest { dropped: Message, depth: usize },
}

impl QueuePush {
    pub fn depth(&self) -> usize {
        match self {
            QueuePush::Queued { depth } | QueuePush::DroppedOldest { depth, .. } => *depth,
        }
    }
}

/// Bounded FIFO of outbound messages
pub struct MessageQueue {
    entries: VecDeque<Message>,
    max_size: usize,
    store: Option<Arc<dyn OfflineStore>>,
    time_source: SharedTimeSource,
    dropped: u64,
}

impl MessageQueue {
    /// Queue without persistence
    pub fn new(max_size: usize, time_source: SharedTimeSource) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
            store: None,
            time_source,
            dropped: 0,
        }
    }

    /// Queue configured from client settings
    ///
    /// The store is only used when `persist_offline` is set; in that case the
    /// queue starts with whatever the store holds.
    pub fn from_config(
        config: &MessageQueueConfig,
        store: Option<Arc<dyn OfflineStore>>,
        time_source: SharedTimeSource,
    ) -> Self {
        let mut queue = Self::new(config.max_size, time_source);
        if config.persist_offline {
            if let Some(store) = store {
                queue.store = Some(store);
                queue.restore();
            }
        }
        queue
    }

    /// Append a message, dropping the oldest entry if full
    pub fn push(&mut self, message: Message) -> QueuePush {
        self.entries.push_back(message);
        let outcome = match self.evict_one() {
            Some(dropped) => QueuePush::DroppedOldest {
                dropped,
                depth: self.entries.len(),
            },
            None => QueuePush::Queued {
                depth: self.entries.len(),
            },
        };
        self.persist();
        outcome
    }

    /// Put messages back at the head, preserving their order
    ///
    /// Used when a send fails after the messages left the queue. If that
    /// overflows the queue, the oldest entries are the ones dropped.
    pub fn requeue(&mut self, messages: Vec<Message>) -> usize {
        for message in messages.into_iter().rev() {
            self.entries.push_front(message);
        }
        let mut dropped = 0;
        while self.evict_one().is_some() {
            dropped += 1;
        }
        self.persist();
        dropped
    }

    /// Remove up to `count` messages from the head, bumping their retry counter
    pub fn take_batch(&mut self, count: usize) -> Vec<Message> {
        let count = count.min(self.entries.len());
        let batch: Vec<Message> = self
            .entries
            .drain(..count)
            .map(|mut message| {
                message.retry = Some(message.retry.unwrap_or(0) + 1);
                message
            })
            .collect();
        if !batch.is_empty() {
            self.persist();
        }
        batch
    }

    /// Change the capacity, dropping the oldest entries if needed
    pub fn resize(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
        let mut dropped = 0;
        while self.evict_one().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            self.persist();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Messages dropped on overflow since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    fn evict_one(&mut self) -> Option<Message> {
        if self.entries.len() <= self.max_size {
            return None;
        }
        let dropped = self.entries.pop_front()?;
        self.dropped += 1;
        warn!(
            kind = %dropped.kind,
            id = dropped.id.as_deref().unwrap_or_default(),
            max_size = self.max_size,
            "Queue full, dropping oldest message"
        );
        Some(dropped)
    }

    fn restore(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load() {
            Ok(Some(snapshot)) => {
                debug!(count = snapshot.messages.len(), "Restored offline queue");
                self.entries = snapshot.messages.into();
                while self.evict_one().is_some() {}
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load offline queue"),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = QueueSnapshot {
            messages: self.entries.iter().cloned().collect(),
            saved_at: self.time_source.now(),
        };
        if let Err(e) = store.save(&snapshot) {
            warn!(error = %e, "Failed to persist offline queue");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
