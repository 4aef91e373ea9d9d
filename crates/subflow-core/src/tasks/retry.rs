//! Task retry backoff with exponential delay and jitter

use std::time::Duration;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial delay
    pub initial_delay: Duration,

    /// Maximum delay
    pub max_delay: Duration,

    /// Multiplier (usually 2.0)
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0) to randomize delays
    pub jitter: f64,
}

impl ExponentialBackoff {
    /// Create new exponential backoff
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.1,
        }
    }

    /// Backoff seeded from the task configuration's base
    pub fn from_base_seconds(base_seconds: u64) -> Self {
        Self::new(
            Duration::from_secs(base_seconds.max(1)),
            Duration::from_secs(3600),
            2.0,
        )
    }

    /// With jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for attempt (1-indexed: the delay before retrying
    /// after the attempt-th failure)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powf(exponent);

        // Cap at max delay
        let delay_secs = delay_secs.min(self.max_delay.as_secs_f64());

        // Apply jitter
        let jitter = if self.jitter > 0.0 {
            use rand::Rng;
            let jitter_range = delay_secs * self.jitter;
            let mut rng = rand::thread_rng();
            rng.gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay_secs + jitter).max(0.0))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}
