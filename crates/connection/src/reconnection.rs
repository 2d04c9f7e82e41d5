//! Reconnection backoff policy.

use std::time::Duration;

use rand::Rng;

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt (backoff floor).
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff ceiling).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Relative jitter applied to every delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Un-jittered delay for a given attempt number (1-based).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay for a given attempt with random jitter, clamped to the ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let with_jitter = (base + base * jitter * offset)
            .min(self.max_delay.as_secs_f64())
            .max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Tracks consecutive failures of one session.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Number of consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current un-jittered interval; the floor when no failure is recorded.
    pub fn interval(&self) -> Duration {
        self.config.base_delay(self.attempt.max(1))
    }

    /// Back to the floor. Called only once a session is connected.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_config_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(2));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let config = ReconnectConfig::default();
        let expected = [2, 4, 8, 16, 30, 30, 30];
        for (i, &secs) in expected.iter().enumerate() {
            assert_eq!(
                config.base_delay((i + 1) as u32),
                Duration::from_secs(secs),
                "attempt {}",
                i + 1
            );
        }
    }

    #[test]
    fn jittered_delay_within_band_and_ceiling() {
        let config = ReconnectConfig::default();
        for attempt in 1..=12 {
            let base = config.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let secs = config.delay_for_attempt(attempt).as_secs_f64();
                assert!(secs >= base * 0.79, "attempt {attempt}: {secs:.3} too small");
                assert!(secs <= base * 1.21, "attempt {attempt}: {secs:.3} too large");
                assert!(secs <= 30.0, "attempt {attempt}: {secs:.3} above ceiling");
            }
        }
    }

    #[test]
    fn interval_non_decreasing_and_resets() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            backoff.next_delay();
            let interval = backoff.interval();
            assert!(interval >= last);
            assert!(interval <= Duration::from_secs(30));
            last = interval;
        }
        assert_eq!(backoff.attempt(), 20);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.interval(), Duration::from_secs(2));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let config = ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::default()
        };
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
    }
}
