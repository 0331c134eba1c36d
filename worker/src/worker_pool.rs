use crate::backoff::BackoffPolicy;
use crate::ingestion::IngestionReceiver;
use crate::ledger_writer::LedgerWriter;
use crate::metrics::{AbandonReason, DispatchMetrics};
use crate::payment::{Payment, PaymentRecord, RetryEnvelope};
use crate::payment_processor::{ForwardOutcome, ProcessorClient};
use crate::retry_queue::{self, RetryQueue, RetryReceiver};
use crate::selector::ProcessorSelector;
use crate::store::LedgerEntry;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub retry_workers: usize,
    /// Outbound calls allowed at once, across main and retry workers.
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            retry_workers: 2,
            max_concurrency: 20,
            request_timeout: Duration::from_secs(3),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerDependencies {
    pub selector: Arc<dyn ProcessorSelector>,
    pub client: Arc<dyn ProcessorClient>,
    pub ledger: LedgerWriter,
    pub metrics: Arc<dyn DispatchMetrics>,
}

#[derive(Clone)]
struct WorkerContext {
    deps: WorkerDependencies,
    limiter: Arc<Semaphore>,
    retry_queue: RetryQueue,
    request_timeout: Duration,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    ingestion: IngestionReceiver,
    retries: RetryReceiver,
    metrics: Arc<dyn DispatchMetrics>,
    scheduler: JoinHandle<()>,
    scheduler_shutdown: CancellationToken,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawns `num_workers` main workers, `retry_workers` retry workers and
    /// the retry scheduler. Workers stop taking new work once `shutdown` is
    /// cancelled.
    pub fn start(
        config: WorkerPoolConfig,
        ingestion: IngestionReceiver,
        deps: WorkerDependencies,
        shutdown: CancellationToken,
    ) -> Self {
        let num_workers = config.num_workers.max(1);
        let retry_workers = config.retry_workers.max(1);

        let (retry_queue, scheduler, retry_receiver) =
            retry_queue::channel(retry_workers, Arc::clone(&deps.metrics));
        // Outlives the workers so their last failures can still be parked.
        let scheduler_shutdown = CancellationToken::new();
        let scheduler = scheduler.start(scheduler_shutdown.clone());

        let metrics = Arc::clone(&deps.metrics);
        let ctx = WorkerContext {
            deps,
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry_queue,
            request_timeout: config.request_timeout,
            backoff: config.backoff,
            shutdown: shutdown.clone(),
        };

        let mut workers = Vec::with_capacity(num_workers + retry_workers);
        for worker_id in 0..num_workers {
            let ctx = ctx.clone();
            let ingestion = ingestion.clone();
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, ingestion, ctx).await;
            }));
        }
        for worker_id in 0..retry_workers {
            let ctx = ctx.clone();
            let retries = retry_receiver.clone();
            workers.push(tokio::spawn(async move {
                Self::retry_worker_loop(worker_id, retries, ctx).await;
            }));
        }

        tracing::info!(
            num_workers,
            retry_workers,
            max_concurrency = config.max_concurrency,
            "Started worker pool"
        );

        Self {
            workers,
            ingestion,
            retries: retry_receiver,
            metrics,
            scheduler,
            scheduler_shutdown,
            shutdown,
        }
    }

    /// Cancels intake and closes the ingestion queue, lets workers finish the
    /// payment they hold for up to `grace`, then stops the retry scheduler.
    /// Payments still queued at that point are counted as abandoned.
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        self.ingestion.close().await;

        let abort_handles: Vec<_> = self.workers.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(self.workers)).await.is_err() {
            tracing::warn!("Workers did not drain within grace period, aborting");
            for handle in abort_handles {
                handle.abort();
            }
        }

        self.scheduler_shutdown.cancel();
        if let Err(e) = self.scheduler.await {
            tracing::error!(error = %e, "Retry scheduler task failed");
        }

        let mut stranded = 0usize;
        while self.ingestion.try_recv().await.is_some() {
            stranded += 1;
        }
        while self.retries.try_recv().await.is_some() {
            stranded += 1;
        }
        if stranded > 0 {
            tracing::warn!(stranded, "Payments left queued at shutdown");
            for _ in 0..stranded {
                self.metrics.payment_abandoned(AbandonReason::Shutdown);
            }
        }

        tracing::info!("Worker pool stopped");
    }

    async fn worker_loop(id: usize, ingestion: IngestionReceiver, ctx: WorkerContext) {
        loop {
            let payment = tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                payment = ingestion.recv() => match payment {
                    Some(payment) => payment,
                    None => break,
                },
            };

            ctx.dispatch(id, payment, 0).await;
        }
        tracing::info!(worker_id = id, "Worker shutting down");
    }

    async fn retry_worker_loop(id: usize, retries: RetryReceiver, ctx: WorkerContext) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                envelope = retries.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if envelope.not_before > Instant::now() {
                tokio::select! {
                    biased;
                    _ = ctx.shutdown.cancelled() => {
                        ctx.abandon(&envelope.payment, envelope.attempt, AbandonReason::Shutdown);
                        break;
                    }
                    _ = tokio::time::sleep_until(envelope.not_before) => {}
                }
            }

            ctx.dispatch(id, envelope.payment, envelope.attempt).await;
        }
        tracing::info!(worker_id = id, "Retry worker shutting down");
    }
}

impl WorkerContext {
    /// One attempt for `payment`, which has already failed `failed_attempts`
    /// times. Routes the outcome to the ledger or the retry queue.
    async fn dispatch(&self, worker_id: usize, payment: Payment, failed_attempts: u32) {
        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = self.limiter.acquire() => permit.ok(),
        };
        let Some(permit) = permit else {
            self.abandon(&payment, failed_attempts, AbandonReason::Shutdown);
            return;
        };

        let target = self.deps.selector.select();
        let record = PaymentRecord::new(&payment, OffsetDateTime::now_utc());
        let outcome = self
            .deps
            .client
            .forward(target, &record, self.request_timeout)
            .await;
        drop(permit);

        self.deps.selector.record_outcome(target, outcome.is_success());

        match outcome {
            ForwardOutcome::Success => {
                tracing::debug!(
                    worker_id,
                    correlation_id = %payment.correlation_id,
                    processor = %target,
                    "Payment forwarded"
                );
                self.deps.metrics.forward_succeeded(target);
                self.deps
                    .ledger
                    .append(LedgerEntry::new(target, &payment, &record));
            }
            ForwardOutcome::Failure(kind) => {
                self.deps.metrics.forward_failed(target, &kind);
                let failed_attempts = failed_attempts + 1;
                tracing::info!(
                    worker_id,
                    correlation_id = %payment.correlation_id,
                    processor = %target,
                    attempt = failed_attempts,
                    error = %kind,
                    "Payment failed to process"
                );
                self.retry(payment, failed_attempts);
            }
        }
    }

    fn retry(&self, payment: Payment, failed_attempts: u32) {
        if self.backoff.exhausted(failed_attempts) {
            self.abandon(&payment, failed_attempts, AbandonReason::RetriesExhausted);
            return;
        }

        let delay = self.backoff.delay(failed_attempts - 1);
        let envelope = RetryEnvelope::new(payment, failed_attempts, Instant::now() + delay);

        match self.retry_queue.schedule(envelope) {
            Ok(()) => self.deps.metrics.retry_scheduled(failed_attempts),
            Err(closed) => {
                self.abandon(&closed.0.payment, failed_attempts, AbandonReason::RetryQueueClosed)
            }
        }
    }

    fn abandon(&self, payment: &Payment, failed_attempts: u32, reason: AbandonReason) {
        tracing::warn!(
            correlation_id = %payment.correlation_id,
            attempt = failed_attempts,
            reason = %reason,
            "Payment abandoned"
        );
        self.deps.metrics.payment_abandoned(reason);
    }
}
