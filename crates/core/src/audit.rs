use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::item::ItemId;

/// One successfully applied change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub record_id: String,
    pub rule_name: String,
    pub item_id: ItemId,
    pub extra: String,
    pub applied_at: DateTime<Utc>,
}

impl LedgerRecord {
    pub fn new(rule_name: impl Into<String>, item_id: ItemId, extra: impl Into<String>) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            rule_name: rule_name.into(),
            item_id,
            extra: extra.into(),
            applied_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("ledger write failed: {0}")]
pub struct LedgerError(pub String);

/// Append-only audit trail of applied changes.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    async fn append(&self, record: LedgerRecord) -> Result<(), LedgerError>;
}

#[derive(Clone, Default)]
pub struct InMemoryChangeLedger {
    records: Arc<Mutex<Vec<LedgerRecord>>>,
}

impl InMemoryChangeLedger {
    pub fn records(&self) -> Vec<LedgerRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn for_rule(&self, rule_name: &str) -> Vec<LedgerRecord> {
        self.records().into_iter().filter(|record| record.rule_name == rule_name).collect()
    }
}

#[async_trait]
impl ChangeLedger for InMemoryChangeLedger {
    async fn append(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{ChangeLedger, InMemoryChangeLedger, LedgerRecord};
    use crate::domain::item::ItemId;

    #[tokio::test]
    async fn in_memory_ledger_keeps_records_per_rule() {
        let ledger = InMemoryChangeLedger::default();
        ledger
            .append(LedgerRecord::new("stalled", ItemId::from("12"), "stalled"))
            .await
            .expect("append");
        ledger
            .append(LedgerRecord::new("regression", ItemId::from("13"), "regression,stalled"))
            .await
            .expect("append");

        let stalled = ledger.for_rule("stalled");
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].item_id, ItemId::from("12"));
        assert_eq!(ledger.records().len(), 2);
        assert_ne!(ledger.records()[0].record_id, ledger.records()[1].record_id);
    }
}
