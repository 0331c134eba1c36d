use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

/// A payment as accepted at the boundary. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Payment {
    #[serde(rename = "correlationId")]
    pub correlation_id: uuid::Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

impl Payment {
    pub fn new(correlation_id: uuid::Uuid, amount: Decimal) -> Self {
        Self {
            correlation_id,
            amount,
        }
    }
}

/// Body posted to a processor. Built fresh for every attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    #[serde(rename = "correlationId")]
    pub correlation_id: uuid::Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(rename = "requestedAt", with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

impl PaymentRecord {
    pub fn new(payment: &Payment, requested_at: OffsetDateTime) -> Self {
        Self {
            correlation_id: payment.correlation_id,
            amount: payment.amount,
            requested_at,
        }
    }

    pub fn requested_at_ms(&self) -> i64 {
        (self.requested_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// A payment waiting for its next attempt.
///
/// `attempt` counts the forwards that already failed, so a freshly created
/// envelope carries `attempt == 1`.
#[derive(Debug, Clone)]
pub struct RetryEnvelope {
    pub payment: Payment,
    pub attempt: u32,
    pub not_before: Instant,
}

impl RetryEnvelope {
    pub fn new(payment: Payment, attempt: u32, not_before: Instant) -> Self {
        Self {
            payment,
            attempt,
            not_before,
        }
    }
}
