//! Reconnect Backoff
//!
//! Exponential delay with random jitter for replication feed reconnects.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Upper bound of the random delay added to each step
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Stateful exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let shift = self.attempt.min(20);
        let exponential_ms = self
            .config
            .initial
            .as_millis()
            .saturating_mul(1u128 << shift);
        let capped_ms = exponential_ms.min(self.config.max.as_millis());
        Duration::from_millis(capped_ms.min(u64::MAX as u128) as u64)
    }

    /// Next delay, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.config.max)
    }

    /// Start over after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
