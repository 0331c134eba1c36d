use crate::payment::Payment;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Fail immediately when the queue is full.
    RejectWhenFull,
    /// Wait for room, up to the given deadline.
    WaitForSpace(Duration),
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    Backpressure,
    Closed,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Backpressure => write!(f, "ingestion queue is full"),
            SubmitError::Closed => write!(f, "ingestion queue is closed"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Producer half, cloned into every boundary handler.
#[derive(Clone)]
pub struct IngestionQueue {
    sender: mpsc::Sender<Payment>,
    policy: AdmissionPolicy,
}

/// Consumer half, shared by all main workers.
#[derive(Clone)]
pub struct IngestionReceiver {
    receiver: Arc<Mutex<mpsc::Receiver<Payment>>>,
}

pub fn channel(capacity: usize, policy: AdmissionPolicy) -> (IngestionQueue, IngestionReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        IngestionQueue { sender, policy },
        IngestionReceiver {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}

impl IngestionQueue {
    pub async fn enqueue(&self, payment: Payment) -> Result<(), SubmitError> {
        match self.policy {
            AdmissionPolicy::RejectWhenFull => {
                self.sender.try_send(payment).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => SubmitError::Backpressure,
                    mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
                })
            }
            AdmissionPolicy::WaitForSpace(deadline) => self
                .sender
                .send_timeout(payment, deadline)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => SubmitError::Backpressure,
                    mpsc::error::SendTimeoutError::Closed(_) => SubmitError::Closed,
                }),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }
}

impl IngestionReceiver {
    /// Waits for the next payment; `None` once every producer is gone and the
    /// queue is drained. Cancel safe.
    pub async fn recv(&self) -> Option<Payment> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Next payment if one is already queued.
    pub async fn try_recv(&self) -> Option<Payment> {
        let mut receiver = self.receiver.lock().await;
        receiver.try_recv().ok()
    }

    /// Stops admission. Payments already queued can still be received;
    /// later `enqueue` calls fail with `SubmitError::Closed`.
    pub async fn close(&self) {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
    }
}
