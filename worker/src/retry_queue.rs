use crate::metrics::{AbandonReason, DispatchMetrics};
use crate::payment::RetryEnvelope;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RetryQueueClosed(pub RetryEnvelope);

impl std::fmt::Display for RetryQueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retry queue closed")
    }
}

impl std::error::Error for RetryQueueClosed {}

struct Scheduled(RetryEnvelope);

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.0.not_before == other.0.not_before
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the heap pops the earliest `not_before` first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.not_before.cmp(&self.0.not_before)
    }
}

/// Producer handle used by workers to park failed payments.
#[derive(Clone)]
pub struct RetryQueue {
    inbound: mpsc::UnboundedSender<RetryEnvelope>,
}

/// Due envelopes, shared by the retry workers.
#[derive(Clone)]
pub struct RetryReceiver {
    ready: Arc<Mutex<mpsc::Receiver<RetryEnvelope>>>,
}

/// Holds envelopes until their `not_before` and releases them in due order.
pub struct RetryScheduler {
    inbound: mpsc::UnboundedReceiver<RetryEnvelope>,
    ready: mpsc::Sender<RetryEnvelope>,
    metrics: Arc<dyn DispatchMetrics>,
}

pub fn channel(
    ready_capacity: usize,
    metrics: Arc<dyn DispatchMetrics>,
) -> (RetryQueue, RetryScheduler, RetryReceiver) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = mpsc::channel(ready_capacity.max(1));

    (
        RetryQueue { inbound: inbound_tx },
        RetryScheduler {
            inbound: inbound_rx,
            ready: ready_tx,
            metrics,
        },
        RetryReceiver {
            ready: Arc::new(Mutex::new(ready_rx)),
        },
    )
}

impl RetryQueue {
    pub fn schedule(&self, envelope: RetryEnvelope) -> Result<(), RetryQueueClosed> {
        self.inbound
            .send(envelope)
            .map_err(|e| RetryQueueClosed(e.0))
    }
}

impl RetryReceiver {
    /// Next due envelope; `None` once the scheduler has stopped.
    pub async fn recv(&self) -> Option<RetryEnvelope> {
        let mut ready = self.ready.lock().await;
        ready.recv().await
    }

    /// Next due envelope if one has already been released.
    pub async fn try_recv(&self) -> Option<RetryEnvelope> {
        let mut ready = self.ready.lock().await;
        ready.try_recv().ok()
    }
}

impl RetryScheduler {
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.retry_loop(shutdown))
    }

    async fn retry_loop(mut self, shutdown: CancellationToken) {
        let mut heap: BinaryHeap<Scheduled> = BinaryHeap::with_capacity(8 * 1024);

        loop {
            let next_due = heap.peek().map(|item| item.0.not_before);
            let due_now = next_due.is_some_and(|at| at <= Instant::now());

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.inbound.recv() => match item {
                    Some(envelope) => heap.push(Scheduled(envelope)),
                    None => break,
                },
                permit = self.ready.reserve(), if due_now => match permit {
                    Ok(permit) => {
                        if let Some(Scheduled(envelope)) = heap.pop() {
                            permit.send(envelope);
                        }
                    }
                    Err(_) => break,
                },
                _ = sleep_until_due(next_due), if next_due.is_some() && !due_now => {}
            }
        }

        // Anything still parked (or racing in) will never be attempted again.
        self.inbound.close();
        while let Ok(envelope) = self.inbound.try_recv() {
            heap.push(Scheduled(envelope));
        }
        if !heap.is_empty() {
            tracing::warn!(pending = heap.len(), "Retry scheduler stopped with pending payments");
        }
        for Scheduled(envelope) in heap.drain() {
            tracing::warn!(
                correlation_id = %envelope.payment.correlation_id,
                attempt = envelope.attempt,
                "Payment abandoned at shutdown"
            );
            self.metrics.payment_abandoned(AbandonReason::Shutdown);
        }
    }
}

async fn sleep_until_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
