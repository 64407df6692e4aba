//! Heartbeat liveness tracking
//!
//! The connection manager owns the timers; this monitor only keeps the
//! bookkeeping: which probe is outstanding, how many replies were missed in a
//! row, and a smoothed round-trip latency.

use tokio::time::Instant;
use wirelink_core::HeartbeatConfig;

/// Weight of the newest sample in the latency average
pub const LATENCY_SMOOTHING: f64 = 0.3;

/// What a heartbeat timeout means for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Reply missed, connection still considered alive
    Missed { consecutive: u32 },
    /// Too many replies missed; the connection is dead
    Dead { consecutive: u32 },
}

/// Tracks outstanding heartbeat probes
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    outstanding: Option<Instant>,
    missed: u32,
    latency_ms: Option<f64>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            outstanding: None,
            missed: 0,
            latency_ms: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: HeartbeatConfig) {
        self.config = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record that a probe went out at `sent_at`
    pub fn probe_sent(&mut self, sent_at: Instant) {
        self.outstanding = Some(sent_at);
    }

    /// Whether a probe is waiting for its reply
    pub fn awaiting_reply(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Record a reply; returns the round trip in milliseconds
    ///
    /// Replies with no outstanding probe are ignored.
    pub fn reply_received(&mut self, received_at: Instant) -> Option<f64> {
        let sent_at = self.outstanding.take()?;
        self.missed = 0;

        let rtt = received_at.saturating_duration_since(sent_at).as_micros() as f64 / 1_000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(previous) => LATENCY_SMOOTHING * rtt + (1.0 - LATENCY_SMOOTHING) * previous,
            None => rtt,
        });
        Some(rtt)
    }

    /// The reply window for the outstanding probe elapsed
    pub fn timeout_elapsed(&mut self) -> HeartbeatVerdict {
        self.outstanding = None;
        self.missed += 1;
        if self.missed >= self.config.max_missed.max(1) {
            HeartbeatVerdict::Dead {
                consecutive: self.missed,
            }
        } else {
            HeartbeatVerdict::Missed {
                consecutive: self.missed,
            }
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Smoothed round-trip latency
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    /// Forget probes and misses, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.missed = 0;
    }
}
