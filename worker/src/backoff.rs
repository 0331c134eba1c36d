use rand::Rng;
use std::time::Duration;

const MAX_SHIFT: u32 = 32;

/// Exponential, capped, jittered retry delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_fraction: f64,
    /// Total forwards a payment gets before it is abandoned.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
            jitter_fraction: 0.1,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^retry, cap)`, before jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 1_u64 << retry.min(MAX_SHIFT);
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.cap)
    }

    /// Nominal delay plus `uniform(0, jitter_fraction * nominal)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        let spread = nominal.as_secs_f64() * self.jitter_fraction.max(0.0);
        let jitter = rand::thread_rng().gen_range(0.0..=spread);
        nominal + Duration::from_secs_f64(jitter)
    }

    pub fn upper_bound(&self) -> Duration {
        self.cap.mul_f64(1.0 + self.jitter_fraction.max(0.0))
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}
