//! Middleware chain
//!
//! Runs an ordered list of [`MessageMiddleware`] units over each message. The
//! first unit to drop a message short-circuits the rest. A unit that errors or
//! panics loses only the message it was processing; the chain stays usable.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};

use crate::config::ClientConfig;
use crate::message::Message;
use crate::middleware::{Direction, MessageMiddleware, MiddlewareStats};

/// Ordered, mutable list of middleware units
#[derive(Debug, Default)]
pub struct MiddlewareChain {
    units: Vec<Box<dyn MessageMiddleware>>,
    /// Failures caught by the chain, by unit position
    failures: Vec<u64>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit at the end of the chain
    pub fn add(&mut self, unit: Box<dyn MessageMiddleware>) {
        self.units.push(unit);
        self.failures.push(0);
    }

    /// Insert a unit at `index`, clamped to the chain length
    pub fn insert(&mut self, index: usize, unit: Box<dyn MessageMiddleware>) {
        let index = index.min(self.units.len());
        self.units.insert(index, unit);
        self.failures.insert(index, 0);
    }

    /// Remove the first unit with `name`, shutting it down
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn MessageMiddleware>> {
        let index = self.units.iter().position(|unit| unit.name() == name)?;
        self.failures.remove(index);
        let mut unit = self.units.remove(index);
        unit.shutdown();
        Some(unit)
    }

    /// Unit names in execution order
    pub fn names(&self) -> Vec<&'static str> {
        self.units.iter().map(|unit| unit.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn process_incoming(&mut self, message: Message) -> Option<Message> {
        self.process(Direction::Incoming, message)
    }

    pub fn process_outgoing(&mut self, message: Message) -> Option<Message> {
        self.process(Direction::Outgoing, message)
    }

    fn process(&mut self, direction: Direction, message: Message) -> Option<Message> {
        let mut current = message;
        for (index, unit) in self.units.iter_mut().enumerate() {
            let name = unit.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| match direction {
                Direction::Incoming => unit.incoming(current),
                Direction::Outgoing => unit.outgoing(current),
            }));

            current = match outcome {
                Ok(Ok(Some(next))) => next,
                Ok(Ok(None)) => return None,
                Ok(Err(e)) => {
                    warn!(middleware = name, %direction, error = %e, "Middleware failed, dropping message");
                    self.failures[index] += 1;
                    return None;
                }
                Err(panic) => {
                    error!(
                        middleware = name,
                        %direction,
                        panic = panic_message(&*panic),
                        "Middleware panicked, dropping message"
                    );
                    self.failures[index] += 1;
                    return None;
                }
            };
        }
        Some(current)
    }

    /// Ask every unit to deliver what it is holding back
    pub fn flush_all(&mut self) {
        for unit in &mut self.units {
            let name = unit.name();
            if catch_unwind(AssertUnwindSafe(|| unit.flush())).is_err() {
                error!(middleware = name, "Middleware panicked during flush");
            }
        }
    }

    /// Shut every unit down and empty the chain
    pub fn destroy(&mut self) {
        for mut unit in self.units.drain(..) {
            let name = unit.name();
            if catch_unwind(AssertUnwindSafe(|| unit.shutdown())).is_err() {
                error!(middleware = name, "Middleware panicked during shutdown");
            }
        }
        self.failures.clear();
    }

    /// Propagate a configuration update to every unit
    pub fn reconfigure(&mut self, config: &ClientConfig) {
        for unit in &mut self.units {
            unit.reconfigure(config);
        }
    }

    /// Per-unit counters, including failures caught by the chain
    pub fn stats(&self) -> Vec<(&'static str, MiddlewareStats)> {
        self.units
            .iter()
            .zip(&self.failures)
            .map(|(unit, failures)| {
                let mut stats = unit.stats();
                stats.errors += failures;
                (unit.name(), stats)
            })
            .collect()
    }
}

impl Drop for MiddlewareChain {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
