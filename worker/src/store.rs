use crate::payment::{Payment, PaymentRecord};
use crate::processor_type::ProcessorType;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt::Display;

/// One successfully forwarded payment, scored by when it was forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub processor: ProcessorType,
    pub correlation_id: uuid::Uuid,
    pub amount: Decimal,
    pub timestamp_ms: i64,
}

impl LedgerEntry {
    pub fn new(processor: ProcessorType, payment: &Payment, record: &PaymentRecord) -> Self {
        Self {
            processor,
            correlation_id: payment.correlation_id,
            amount: payment.amount,
            timestamp_ms: record.requested_at_ms(),
        }
    }

    /// Sorted-set member: `"{correlationId}:{amount}"`.
    pub fn member(&self) -> String {
        format!("{}:{}", self.correlation_id, self.amount)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    #[serde(rename = "totalRequests")]
    pub count: i64,
    #[serde(rename = "totalAmount", with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsResponse {
    pub default: RequestStats,
    pub fallback: RequestStats,
}

#[derive(Debug)]
pub enum LedgerError {
    Pool(deadpool_postgres::PoolError),
    Query(tokio_postgres::Error),
}

impl Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Pool(e) => write!(f, "failed to get a client from the pool: {}", e),
            LedgerError::Query(e) => write!(f, "ledger query failed: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<deadpool_postgres::PoolError> for LedgerError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        LedgerError::Pool(e)
    }
}

impl From<tokio_postgres::Error> for LedgerError {
    fn from(e: tokio_postgres::Error) -> Self {
        LedgerError::Query(e)
    }
}

/// Time-indexed store: one sorted set per processor identity.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Adds the entry's member to its processor's set. Re-adding an existing
    /// member only moves its score.
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    async fn append_batch(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        for entry in entries {
            self.append(entry).await?;
        }
        Ok(())
    }

    /// Count and sum of amounts with score in `[from_ms, to_ms]`.
    async fn range_aggregate(
        &self,
        processor: ProcessorType,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<RequestStats, LedgerError>;

    /// Clears both sets. Destructive.
    async fn reset(&self) -> Result<(), LedgerError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ledger_entries (
        set_key TEXT NOT NULL,
        member TEXT NOT NULL,
        score BIGINT NOT NULL,
        amount NUMERIC NOT NULL,
        PRIMARY KEY (set_key, member)
    );
    CREATE INDEX IF NOT EXISTS ledger_entries_score_idx ON ledger_entries (set_key, score);
";

const UPSERT: &str = "
    INSERT INTO ledger_entries (set_key, member, score, amount)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (set_key, member) DO UPDATE SET score = EXCLUDED.score
";

const UPSERT_BATCH: &str = "
    INSERT INTO ledger_entries (set_key, member, score, amount)
    SELECT * FROM UNNEST($1::text[], $2::text[], $3::int8[], $4::numeric[])
    ON CONFLICT (set_key, member) DO UPDATE SET score = EXCLUDED.score
";

const RANGE_AGGREGATE: &str = "
    SELECT COUNT(*) AS total_requests,
           COALESCE(SUM(amount), 0) AS total_amount
    FROM ledger_entries
    WHERE set_key = $1
      AND score BETWEEN $2 AND $3
";

pub struct Store {
    dbpool: deadpool_postgres::Pool,
}

impl Store {
    pub fn new(dbpool: deadpool_postgres::Pool) -> Self {
        Self { dbpool }
    }

    /// Fails when the database is unreachable, so startup can refuse to run.
    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        let client = self.dbpool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Store {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let client = self.dbpool.get().await?;
        let stmt = client.prepare_cached(UPSERT).await?;

        client
            .execute(
                &stmt,
                &[
                    &entry.processor,
                    &entry.member(),
                    &entry.timestamp_ms,
                    &entry.amount,
                ],
            )
            .await?;

        Ok(())
    }

    async fn append_batch(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        match entries {
            [] => return Ok(()),
            [entry] => return self.append(entry).await,
            _ => {}
        }

        let mut keys = Vec::with_capacity(entries.len());
        let mut members = Vec::with_capacity(entries.len());
        let mut scores = Vec::with_capacity(entries.len());
        let mut amounts = Vec::with_capacity(entries.len());

        // A member repeated within one statement would hit the same row twice.
        let mut seen = std::collections::HashSet::with_capacity(entries.len());
        for entry in entries.iter().rev() {
            let member = entry.member();
            if !seen.insert((entry.processor, member.clone())) {
                continue;
            }
            keys.push(entry.processor);
            members.push(member);
            scores.push(entry.timestamp_ms);
            amounts.push(entry.amount);
        }

        let client = self.dbpool.get().await?;
        let stmt = client.prepare_cached(UPSERT_BATCH).await?;
        client
            .execute(&stmt, &[&keys, &members, &scores, &amounts])
            .await?;

        Ok(())
    }

    async fn range_aggregate(
        &self,
        processor: ProcessorType,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<RequestStats, LedgerError> {
        let client = self.dbpool.get().await?;
        let stmt = client.prepare_cached(RANGE_AGGREGATE).await?;
        let row = client.query_one(&stmt, &[&processor, &from_ms, &to_ms]).await?;

        Ok(RequestStats {
            count: row.get("total_requests"),
            total_amount: row.get("total_amount"),
        })
    }

    async fn reset(&self) -> Result<(), LedgerError> {
        let client = self.dbpool.get().await?;
        client.batch_execute("TRUNCATE TABLE ledger_entries").await?;
        Ok(())
    }
}
