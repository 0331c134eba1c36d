use crate::processor_type::ProcessorType;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Decides which processor the next attempt targets.
pub trait ProcessorSelector: Send + Sync {
    fn select(&self) -> ProcessorType;

    /// Feedback from the payment path after every forward.
    fn record_outcome(&self, _processor: ProcessorType, _success: bool) {}

    /// Feedback from the periodic health probe.
    fn apply_probe(&self, _processor: ProcessorType, _failing: bool) {}
}

/// Always targets the default processor; retries absorb its failures.
#[derive(Debug, Default)]
pub struct StaticDefault;

impl ProcessorSelector for StaticDefault {
    fn select(&self) -> ProcessorType {
        ProcessorType::Default
    }
}

#[derive(Debug, Clone)]
pub struct HealthAwareConfig {
    /// Consecutive payment-path failures that mark a processor unhealthy.
    pub failure_threshold: u32,
    /// How long a processor tripped by failures is avoided.
    pub cooldown: Duration,
}

impl Default for HealthAwareConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct ProcessorHealth {
    probe_failing: AtomicBool,
    consecutive_failures: AtomicU32,
    // Millis since `HealthAware::epoch`; 0 means not tripped.
    tripped_until: AtomicU64,
}

/// Prefers default while healthy, fails over to fallback, and falls back to
/// default again when both look unhealthy.
#[derive(Debug)]
pub struct HealthAware {
    config: HealthAwareConfig,
    epoch: Instant,
    processors: [ProcessorHealth; 2],
}

impl HealthAware {
    pub fn new(config: HealthAwareConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            processors: Default::default(),
        }
    }

    fn now_ms(&self) -> u64 {
        // Offset by one so a trip recorded at the epoch is never 0.
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub fn is_healthy(&self, processor: ProcessorType) -> bool {
        let health = &self.processors[processor.index()];
        if health.probe_failing.load(Ordering::Acquire) {
            return false;
        }
        let tripped_until = health.tripped_until.load(Ordering::Acquire);
        tripped_until == 0 || self.now_ms() >= tripped_until
    }
}

impl ProcessorSelector for HealthAware {
    fn select(&self) -> ProcessorType {
        if self.is_healthy(ProcessorType::Default) {
            ProcessorType::Default
        } else if self.is_healthy(ProcessorType::Fallback) {
            ProcessorType::Fallback
        } else {
            ProcessorType::Default
        }
    }

    fn record_outcome(&self, processor: ProcessorType, success: bool) {
        let health = &self.processors[processor.index()];

        if success {
            health.consecutive_failures.store(0, Ordering::Release);
            health.tripped_until.store(0, Ordering::Release);
            return;
        }

        let failures = health.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold {
            let until = self.now_ms() + self.config.cooldown.as_millis() as u64;
            let previous = health.tripped_until.swap(until, Ordering::AcqRel);
            if previous == 0 || previous <= self.now_ms() {
                tracing::warn!(
                    processor = %processor,
                    failures,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Processor marked unhealthy after consecutive failures"
                );
            }
        }
    }

    fn apply_probe(&self, processor: ProcessorType, failing: bool) {
        let health = &self.processors[processor.index()];
        let previous = health.probe_failing.swap(failing, Ordering::AcqRel);
        if previous != failing {
            tracing::info!(processor = %processor, failing, "Processor health changed");
        }
    }
}
