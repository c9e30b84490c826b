//! Restart backoff policy
//!
//! Exponential backoff with a hard cap and ±20% jitter to keep a crashing
//! fleet from restarting in lockstep.

use std::time::Duration;

/// Backoff policy parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first restart (default: 1 second).
    pub base: Duration,
    /// Upper bound on any delay (default: 30 seconds).
    pub cap: Duration,
    /// Jitter fraction applied symmetrically (default: 0.2 for ±20%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Tracks the restart attempt count for one entity.
#[derive(Debug)]
pub struct RestartBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl RestartBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next restart, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = self.config.base.as_millis() as u64;
        let cap_ms = self.config.cap.as_millis() as u64;
        let raw_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);

        Duration::from_millis(apply_jitter(raw_ms, self.config.jitter))
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Clear the attempt counter after a healthy run.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Apply ±`jitter` to a delay, seeded from the clock.
fn apply_jitter(delay_ms: u64, jitter: f64) -> u64 {
    let range = (delay_ms as f64 * jitter) as u64;
    if range == 0 {
        return delay_ms;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    let offset = now % (2 * range + 1);
    delay_ms - range + offset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        }
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = RestartBackoff::new(no_jitter());

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        // Capped from here on
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = RestartBackoff::new(BackoffConfig::default());

        for expected_ms in [1000u64, 2000, 4000] {
            let delay = backoff.next_delay().as_millis() as u64;
            let low = expected_ms - expected_ms / 5;
            let high = expected_ms + expected_ms / 5;
            assert!(
                (low..=high).contains(&delay),
                "delay {delay}ms outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn test_reset_restarts_progression() {
        let mut backoff = RestartBackoff::new(no_jitter());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let mut backoff = RestartBackoff::new(no_jitter());
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
