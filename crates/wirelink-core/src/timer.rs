//! Keyed one-shot timers
//!
//! A [`TimerSet`] owns a tokio task per armed key. Cancelling a key aborts its
//! task, and dropping the set aborts every task it still owns, so a timer can
//! never outlive the component that armed it.

use core::hash::Hash;
use core::time::Duration;
use hashbrown::HashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::errors::{Result, WirelinkError};

/// Set of one-shot timers indexed by key
#[derive(Debug)]
pub struct TimerSet<K: Eq + Hash> {
    timers: HashMap<K, JoinHandle<()>>,
}

impl<K: Eq + Hash + Clone + core::fmt::Debug> TimerSet<K> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
        }
    }

    /// Run `fire` once after `delay`, replacing any timer armed for `key`
    ///
    /// Fails when called outside a tokio runtime.
    pub fn arm<F>(&mut self, key: K, delay: Duration, fire: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Handle::try_current().map_err(|e| WirelinkError::Scheduling {
            reason: e.to_string(),
        })?;

        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });

        trace!(?key, delay_ms = delay.as_millis() as u64, "Timer armed");
        if let Some(previous) = self.timers.insert(key, task) {
            previous.abort();
        }
        Ok(())
    }

    /// Whether a timer for `key` is armed and has not fired yet
    pub fn is_armed(&self, key: &K) -> bool {
        self.timers
            .get(key)
            .is_some_and(|task| !task.is_finished())
    }

    /// Abort the timer for `key`; returns whether one was armed
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some(task) => {
                let armed = !task.is_finished();
                task.abort();
                armed
            }
            None => false,
        }
    }

    /// Abort every timer
    pub fn cancel_all(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }

    /// Forget the timer for `key` without aborting it
    ///
    /// Called from inside a firing timer to clear its own slot.
    pub fn release(&mut self, key: &K) {
        self.timers.remove(key);
    }

    /// Number of timers still pending
    pub fn armed_count(&self) -> usize {
        self.timers.values().filter(|task| !task.is_finished()).count()
    }
}

impl<K: Eq + Hash + Clone + core::fmt::Debug> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
