use async_trait::async_trait;

use autotriage_core::audit::{InMemoryChangeLedger, LedgerRecord};

use super::{ChangeLedgerRepository, RepositoryError};

#[async_trait]
impl ChangeLedgerRepository for InMemoryChangeLedger {
    async fn list_for_rule(
        &self,
        rule_name: &str,
        limit: u32,
    ) -> Result<Vec<LedgerRecord>, RepositoryError> {
        let mut records = self.for_rule(rule_name);
        records.sort_by(|left, right| right.applied_at.cmp(&left.applied_at));
        records.truncate(limit as usize);
        Ok(records)
    }
}
