use crate::metrics::DispatchMetrics;
use crate::store::{LedgerEntry, LedgerStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

/// Best-effort ledger appends, off the dispatch hot path.
///
/// Writes are never retried: the forward already succeeded, so a lost write
/// is counted through `ledger_write_failed` and logged instead.
#[derive(Clone)]
pub struct LedgerWriter {
    sender: mpsc::Sender<LedgerEntry>,
    metrics: Arc<dyn DispatchMetrics>,
}

impl LedgerWriter {
    /// Spawns the insert loop. It flushes and exits once every writer clone
    /// has been dropped.
    pub fn spawn(
        store: Arc<dyn LedgerStore>,
        metrics: Arc<dyn DispatchMetrics>,
        buffer: usize,
        batch_size: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let loop_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            Self::insert_loop(receiver, store, loop_metrics, batch_size.max(1)).await;
        });

        (Self { sender, metrics }, handle)
    }

    pub fn append(&self, entry: LedgerEntry) {
        if let Err(e) = self.sender.try_send(entry) {
            let entry = match e {
                mpsc::error::TrySendError::Full(entry) => entry,
                mpsc::error::TrySendError::Closed(entry) => entry,
            };
            tracing::error!(
                correlation_id = %entry.correlation_id,
                processor = %entry.processor,
                "Ledger writer unavailable, payment not recorded"
            );
            self.metrics.ledger_write_failed(1);
        }
    }

    async fn insert_loop(
        mut receiver: mpsc::Receiver<LedgerEntry>,
        store: Arc<dyn LedgerStore>,
        metrics: Arc<dyn DispatchMetrics>,
        batch_size: usize,
    ) {
        let mut buffer = Vec::<LedgerEntry>::with_capacity(batch_size);

        while let Some(first) = receiver.recv().await {
            buffer.push(first);

            let mut closed = false;
            while buffer.len() < batch_size {
                match receiver.try_recv() {
                    Ok(entry) => buffer.push(entry),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }

            Self::flush(&store, &metrics, &mut buffer).await;

            if closed {
                break;
            }
        }

        tracing::info!("Ledger writer drained");
    }

    async fn flush(
        store: &Arc<dyn LedgerStore>,
        metrics: &Arc<dyn DispatchMetrics>,
        buffer: &mut Vec<LedgerEntry>,
    ) {
        if buffer.is_empty() {
            return;
        }

        if let Err(e) = store.append_batch(buffer).await {
            tracing::error!(entries = buffer.len(), error = %e, "Failed to write ledger batch");
            metrics.ledger_write_failed(buffer.len());
        }
        buffer.clear();
    }
}
