use async_trait::async_trait;
use thiserror::Error;

use autotriage_core::audit::LedgerRecord;

pub mod dedupe;
pub mod ledger;
pub mod memory;

pub use dedupe::SqlDedupeStore;
pub use ledger::SqlChangeLedger;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Read side of the change ledger, used for operator inspection.
#[async_trait]
pub trait ChangeLedgerRepository: Send + Sync {
    /// Most recent records of `rule_name` first.
    async fn list_for_rule(
        &self,
        rule_name: &str,
        limit: u32,
    ) -> Result<Vec<LedgerRecord>, RepositoryError>;
}
