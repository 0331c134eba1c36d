use crate::ingestion::{IngestionQueue, SubmitError};
use crate::metrics::DispatchMetrics;
use crate::payment::Payment;
use crate::processor_type::ProcessorType;
use crate::store::{LedgerError, LedgerStore, StatsResponse};
use std::sync::Arc;
use time::OffsetDateTime;

/// What the HTTP layer talks to.
#[derive(Clone)]
pub struct PaymentService {
    queue: IngestionQueue,
    ledger: Arc<dyn LedgerStore>,
    metrics: Arc<dyn DispatchMetrics>,
}

impl PaymentService {
    pub fn new(
        queue: IngestionQueue,
        ledger: Arc<dyn LedgerStore>,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Self {
        Self {
            queue,
            ledger,
            metrics,
        }
    }

    pub async fn submit_payment(&self, payment: Payment) -> Result<(), SubmitError> {
        match self.queue.enqueue(payment).await {
            Ok(()) => {
                self.metrics.payment_accepted();
                Ok(())
            }
            Err(e) => {
                self.metrics.payment_rejected();
                Err(e)
            }
        }
    }

    /// Stats for `[from, to]`; a missing bound leaves that side open.
    pub async fn get_summary(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<StatsResponse, LedgerError> {
        let from_ms = from.map(to_millis).unwrap_or(i64::MIN);
        let to_ms = to.map(to_millis).unwrap_or(i64::MAX);

        let (default, fallback) = tokio::try_join!(
            self.ledger
                .range_aggregate(ProcessorType::Default, from_ms, to_ms),
            self.ledger
                .range_aggregate(ProcessorType::Fallback, from_ms, to_ms),
        )?;

        Ok(StatsResponse { default, fallback })
    }

    pub async fn purge(&self) -> Result<(), LedgerError> {
        tracing::warn!("Purging ledger");
        self.ledger.reset().await
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}
