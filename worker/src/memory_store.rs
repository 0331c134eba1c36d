use crate::processor_type::ProcessorType;
use crate::store::{LedgerEntry, LedgerError, LedgerStore, RequestStats};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct SortedSet {
    // member -> (score, amount)
    members: HashMap<String, (i64, Decimal)>,
    by_score: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, member: String, score: i64, amount: Decimal) {
        if let Some((old_score, _)) = self.members.insert(member.clone(), (score, amount)) {
            self.by_score.remove(&(old_score, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    fn aggregate(&self, from: i64, to: i64) -> RequestStats {
        if from > to {
            return RequestStats::default();
        }
        self.by_score
            .range((from, String::new())..)
            .take_while(|(score, _)| *score <= to)
            .fold(RequestStats::default(), |mut stats, (_, member)| {
                if let Some((_, amount)) = self.members.get(member) {
                    stats.count += 1;
                    stats.total_amount += *amount;
                }
                stats
            })
    }
}

/// In-process ledger with sorted-set semantics.
#[derive(Default, Clone)]
pub struct MemoryLedgerStore {
    sets: Arc<RwLock<[SortedSet; 2]>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, processor: ProcessorType) -> usize {
        self.sets.read().await[processor.index()].members.len()
    }

    pub async fn contains(&self, processor: ProcessorType, correlation_id: uuid::Uuid) -> bool {
        let prefix = format!("{}:", correlation_id);
        self.sets.read().await[processor.index()]
            .members
            .keys()
            .any(|member| member.starts_with(&prefix))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut sets = self.sets.write().await;
        sets[entry.processor.index()].add(entry.member(), entry.timestamp_ms, entry.amount);
        Ok(())
    }

    async fn range_aggregate(
        &self,
        processor: ProcessorType,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<RequestStats, LedgerError> {
        let sets = self.sets.read().await;
        Ok(sets[processor.index()].aggregate(from_ms, to_ms))
    }

    async fn reset(&self) -> Result<(), LedgerError> {
        let mut sets = self.sets.write().await;
        *sets = Default::default();
        Ok(())
    }
}
