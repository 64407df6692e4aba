//! Reconnect backoff
//!
//! The delay before retry `n` (counting from zero) is
//! `min(max_delay, initial_delay * backoff_factor^n)`, optionally scaled by a
//! random factor in `[1 - jitter_factor, 1 + jitter_factor]`.

use core::time::Duration;
use rand::Rng;

use crate::config::ReconnectConfig;

/// Tracks reconnect attempts and computes retry delays
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before retry `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = (initial * self.config.backoff_factor.powi(exponent)).min(max);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Delay before retry `attempt`, with jitter applied if configured
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.config.jitter || self.config.jitter_factor <= 0.0 {
            return base;
        }
        let spread = self.config.jitter_factor.min(1.0);
        let scale = rng.gen_range(1.0 - spread..=1.0 + spread);
        Duration::from_millis((base.as_millis() as f64 * scale) as u64)
    }

    /// Reserve the next attempt and return its delay
    ///
    /// Returns `None` once `max_attempts` retries have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let delay = self.delay_with(self.attempt_count, &mut rand::thread_rng());
        self.attempt_count += 1;
        Some(delay)
    }

    /// Whether every allowed attempt has been used
    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.config.max_attempts
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Swap settings, keeping the attempt count
    pub fn set_config(&mut self, config: ReconnectConfig) {
        self.config = config;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(jitter: bool) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            max_attempts: 4,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            jitter,
            jitter_factor: 0.25,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = ReconnectPolicy::new(config(false));
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.base_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_attempts_run_out() {
        let mut policy = ReconnectPolicy::new(config(false));
        let delays: Vec<Duration> = core::iter::from_fn(|| policy.next_delay()).collect();

        assert_eq!(delays.len(), 4);
        assert!(policy.exhausted());
        assert_eq!(policy.next_delay(), None);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = ReconnectPolicy::new(config(true));
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 0..5 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let jittered = policy.delay_with(attempt, &mut rng).as_millis() as f64;
                assert!(jittered >= (base * 0.75).floor() && jittered <= base * 1.25);
            }
        }
    }
}
