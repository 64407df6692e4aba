//! Connection metrics
//!
//! Passive counters fed by the connection manager: traffic totals, heartbeat
//! latency samples, recorded errors, queue pressure. A connection quality
//! grade is derived from average latency, error rate and reconnect count.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{QualityThreshold, QualityThresholds};
use crate::middleware::MiddlewareStats;
use crate::types::{SharedTimeSource, Timestamp};

/// Latency samples retained for the average
pub const DEFAULT_LATENCY_SAMPLES: usize = 100;

/// Error events retained
pub const DEFAULT_ERROR_EVENTS: usize = 100;

// ----------------------------------------------------------------------------
// Quality and Error Types
// ----------------------------------------------------------------------------

/// Connection quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Poor => "poor",
        };
        f.write_str(name)
    }
}

/// Category of a recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Auth,
    Heartbeat,
    Send,
    Compression,
    Validation,
}

/// One recorded error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: Timestamp,
    /// Set once a connection has been re-established after the error
    pub recovered: bool,
}

/// Point-in-time view of all metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnections: u64,
    pub average_latency_ms: f64,
    pub latency_samples: usize,
    pub error_count: u64,
    pub error_rate: f64,
    pub recent_errors: Vec<ErrorEvent>,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    /// Messages sent per second since collection started
    pub send_throughput: f64,
    pub uptime_ms: u64,
    pub quality: ConnectionQuality,
    pub middleware: Vec<MiddlewareEntry>,
}

/// Counters for one middleware unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiddlewareEntry {
    pub name: String,
    #[serde(flatten)]
    pub stats: MiddlewareStats,
}

// ----------------------------------------------------------------------------
// Metrics Collector
// ----------------------------------------------------------------------------

/// Aggregates traffic, latency and error statistics
pub struct MetricsCollector {
    time_source: SharedTimeSource,
    thresholds: QualityThresholds,
    started_at: Timestamp,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    reconnections: u64,
    latencies: VecDeque<f64>,
    latency_capacity: usize,
    average_latency: f64,
    errors: VecDeque<ErrorEvent>,
    error_capacity: usize,
    error_count: u64,
    queue_depth: usize,
    queue_dropped: u64,
}

impl MetricsCollector {
    pub fn new(thresholds: QualityThresholds, time_source: SharedTimeSource) -> Self {
        let started_at = time_source.now();
        Self {
            time_source,
            thresholds,
            started_at,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            reconnections: 0,
            latencies: VecDeque::with_capacity(DEFAULT_LATENCY_SAMPLES),
            latency_capacity: DEFAULT_LATENCY_SAMPLES,
            average_latency: 0.0,
            errors: VecDeque::with_capacity(DEFAULT_ERROR_EVENTS),
            error_capacity: DEFAULT_ERROR_EVENTS,
            error_count: 0,
            queue_depth: 0,
            queue_dropped: 0,
        }
    }

    /// Override how many latency samples and error events are kept
    pub fn with_capacity(mut self, latency_samples: usize, error_events: usize) -> Self {
        self.latency_capacity = latency_samples.max(1);
        self.error_capacity = error_events.max(1);
        self
    }

    pub fn set_thresholds(&mut self, thresholds: QualityThresholds) {
        self.thresholds = thresholds;
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Add a heartbeat round-trip sample
    pub fn record_latency(&mut self, latency_ms: f64) {
        if self.latencies.len() == self.latency_capacity {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
        self.average_latency = self.latencies.iter().sum::<f64>() / self.latencies.len() as f64;
    }

    pub fn record_reconnection(&mut self) {
        self.reconnections += 1;
    }

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.errors.len() == self.error_capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorEvent {
            kind,
            message: message.into(),
            timestamp: self.time_source.now(),
            recovered: false,
        });
        self.error_count += 1;
    }

    /// Mark every retained error as recovered
    pub fn mark_recovered(&mut self) {
        for event in &mut self.errors {
            event.recovered = true;
        }
    }

    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth;
    }

    pub fn record_queue_drop(&mut self, count: u64) {
        self.queue_dropped += count;
    }

    pub fn average_latency(&self) -> f64 {
        self.average_latency
    }

    /// Errors per message handled in either direction
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_received;
        if total == 0 {
            return if self.error_count == 0 { 0.0 } else { 1.0 };
        }
        self.error_count as f64 / total as f64
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorEvent> {
        self.errors.iter()
    }

    /// Grade the connection against the configured thresholds
    pub fn quality(&self) -> ConnectionQuality {
        let latency = self.average_latency;
        let error_rate = self.error_rate();
        let exceeds = |threshold: &QualityThreshold| {
            latency > threshold.latency_ms
                || error_rate > threshold.error_rate
                || threshold
                    .reconnections
                    .is_some_and(|limit| self.reconnections > limit)
        };

        if exceeds(&self.thresholds.poor) {
            ConnectionQuality::Poor
        } else if exceeds(&self.thresholds.fair) {
            ConnectionQuality::Fair
        } else if exceeds(&self.thresholds.good) {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Excellent
        }
    }

    pub fn snapshot(&self, middleware: Vec<(&'static str, MiddlewareStats)>) -> MetricsSnapshot {
        let now = self.time_source.now();
        let uptime_ms = now - self.started_at;
        let send_throughput = if uptime_ms == 0 {
            0.0
        } else {
            self.messages_sent as f64 * 1_000.0 / uptime_ms as f64
        };

        MetricsSnapshot {
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            reconnections: self.reconnections,
            average_latency_ms: self.average_latency,
            latency_samples: self.latencies.len(),
            error_count: self.error_count,
            error_rate: self.error_rate(),
            recent_errors: self.errors.iter().cloned().collect(),
            queue_depth: self.queue_depth,
            queue_dropped: self.queue_dropped,
            send_throughput,
            uptime_ms,
            quality: self.quality(),
            middleware: middleware
                .into_iter()
                .map(|(name, stats)| MiddlewareEntry {
                    name: name.to_string(),
                    stats,
                })
                .collect(),
        }
    }

    /// Clear all counters and samples
    pub fn reset(&mut self) {
        *self = Self::new(self.thresholds.clone(), self.time_source.clone())
            .with_capacity(self.latency_capacity, self.error_capacity);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;
    use std::sync::Arc;

    fn collector() -> (MetricsCollector, ManualTimeSource) {
        let clock = ManualTimeSource::new_at(0);
        let metrics = MetricsCollector::new(QualityThresholds::default(), Arc::new(clock.clone()));
        (metrics, clock)
    }

    #[test]
    fn test_latency_ring_is_bounded() {
        let (metrics, _) = collector();
        let mut metrics = metrics.with_capacity(3, 3);

        for sample in [10.0, 20.0, 30.0, 100.0] {
            metrics.record_latency(sample);
        }
        // 10 fell out of the window
        assert_eq!(metrics.average_latency(), 50.0);
    }

    #[test]
    fn test_quality_grades() {
        let (mut metrics, _) = collector();
        for _ in 0..1_000 {
            metrics.record_sent(10);
        }
        assert_eq!(metrics.quality(), ConnectionQuality::Excellent);

        metrics.record_latency(300.0);
        assert_eq!(metrics.quality(), ConnectionQuality::Good);

        metrics.record_reconnection();
        metrics.record_reconnection();
        assert_eq!(metrics.quality(), ConnectionQuality::Fair);

        for _ in 0..60 {
            metrics.record_error(ErrorKind::Send, "write failed");
        }
        assert_eq!(metrics.quality(), ConnectionQuality::Poor);
    }

    #[test]
    fn test_error_events_bounded_and_recovered() {
        let (metrics, clock) = collector();
        let mut metrics = metrics.with_capacity(10, 2);

        metrics.record_error(ErrorKind::Transport, "first");
        clock.advance(5);
        metrics.record_error(ErrorKind::Heartbeat, "second");
        metrics.record_error(ErrorKind::Auth, "third");
        metrics.mark_recovered();

        let errors: Vec<&ErrorEvent> = metrics.errors().collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "second");
        assert_eq!(errors[0].timestamp, Timestamp::new(5));
        assert!(errors.iter().all(|e| e.recovered));

        // Total count is not bounded by the ring
        assert_eq!(metrics.snapshot(Vec::new()).error_count, 3);
    }

    #[test]
    fn test_snapshot_throughput_and_middleware() {
        let (mut metrics, clock) = collector();
        metrics.record_sent(100);
        metrics.record_sent(100);
        metrics.record_received(50);
        metrics.set_queue_depth(4);
        clock.advance(1_000);

        let snapshot = metrics.snapshot(vec![(
            "deduplication",
            MiddlewareStats {
                processed: 5,
                dropped: 1,
                errors: 0,
            },
        )]);

        assert_eq!(snapshot.bytes_sent, 200);
        assert_eq!(snapshot.bytes_received, 50);
        assert_eq!(snapshot.send_throughput, 2.0);
        assert_eq!(snapshot.queue_depth, 4);
        assert_eq!(snapshot.middleware[0].name, "deduplication");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["quality"], "excellent");
        assert_eq!(json["middleware"][0]["dropped"], 1);
    }
}
