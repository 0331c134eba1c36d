use crate::payment_processor::FailureKind;
use crate::processor_type::ProcessorType;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    RetriesExhausted,
    RetryQueueClosed,
    Shutdown,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::RetriesExhausted => write!(f, "retries exhausted"),
            AbandonReason::RetryQueueClosed => write!(f, "retry queue closed"),
            AbandonReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Counters every dispatch stage reports through. Injected, never global.
pub trait DispatchMetrics: Send + Sync {
    fn payment_accepted(&self);
    fn payment_rejected(&self);
    fn forward_succeeded(&self, processor: ProcessorType);
    fn forward_failed(&self, processor: ProcessorType, kind: &FailureKind);
    fn retry_scheduled(&self, attempt: u32);
    fn payment_abandoned(&self, reason: AbandonReason);
    fn ledger_write_failed(&self, entries: usize);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded_default: u64,
    pub succeeded_fallback: u64,
    pub failed_default: u64,
    pub failed_fallback: u64,
    pub timeouts: u64,
    pub retries_scheduled: u64,
    pub abandoned_exhausted: u64,
    pub abandoned_queue_closed: u64,
    pub abandoned_shutdown: u64,
    pub ledger_write_failures: u64,
}

impl MetricsSnapshot {
    pub fn abandoned(&self) -> u64 {
        self.abandoned_exhausted + self.abandoned_queue_closed + self.abandoned_shutdown
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded_default + self.succeeded_fallback
    }

    pub fn failed(&self) -> u64 {
        self.failed_default + self.failed_fallback
    }
}

#[derive(Debug, Default)]
pub struct AtomicMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: [AtomicU64; 2],
    failed: [AtomicU64; 2],
    timeouts: AtomicU64,
    retries_scheduled: AtomicU64,
    abandoned_exhausted: AtomicU64,
    abandoned_queue_closed: AtomicU64,
    abandoned_shutdown: AtomicU64,
    ledger_write_failures: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            succeeded_default: load(&self.succeeded[ProcessorType::Default.index()]),
            succeeded_fallback: load(&self.succeeded[ProcessorType::Fallback.index()]),
            failed_default: load(&self.failed[ProcessorType::Default.index()]),
            failed_fallback: load(&self.failed[ProcessorType::Fallback.index()]),
            timeouts: load(&self.timeouts),
            retries_scheduled: load(&self.retries_scheduled),
            abandoned_exhausted: load(&self.abandoned_exhausted),
            abandoned_queue_closed: load(&self.abandoned_queue_closed),
            abandoned_shutdown: load(&self.abandoned_shutdown),
            ledger_write_failures: load(&self.ledger_write_failures),
        }
    }
}

impl DispatchMetrics for AtomicMetrics {
    fn payment_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn payment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn forward_succeeded(&self, processor: ProcessorType) {
        self.succeeded[processor.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn forward_failed(&self, processor: ProcessorType, kind: &FailureKind) {
        self.failed[processor.index()].fetch_add(1, Ordering::Relaxed);
        if matches!(kind, FailureKind::Timeout) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retry_scheduled(&self, _attempt: u32) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    fn payment_abandoned(&self, reason: AbandonReason) {
        let counter = match reason {
            AbandonReason::RetriesExhausted => &self.abandoned_exhausted,
            AbandonReason::RetryQueueClosed => &self.abandoned_queue_closed,
            AbandonReason::Shutdown => &self.abandoned_shutdown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn ledger_write_failed(&self, entries: usize) {
        self.ledger_write_failures
            .fetch_add(entries as u64, Ordering::Relaxed);
    }
}
