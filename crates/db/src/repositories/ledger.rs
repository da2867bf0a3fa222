use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use autotriage_core::audit::{ChangeLedger, LedgerError, LedgerRecord};
use autotriage_core::domain::item::ItemId;

use super::{ChangeLedgerRepository, RepositoryError};
use crate::DbPool;

/// Append-only `change_ledger` table.
pub struct SqlChangeLedger {
    pool: DbPool,
}

impl SqlChangeLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &LedgerRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO change_ledger (id, rule_name, item_id, extra, applied_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.record_id)
        .bind(&record.rule_name)
        .bind(record.item_id.as_str())
        .bind(&record.extra)
        .bind(record.applied_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerRecord, RepositoryError> {
    let record_id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let rule_name: String =
        row.try_get("rule_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let item_id: String = row.try_get("item_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let extra: String = row.try_get("extra").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let applied_at: String =
        row.try_get("applied_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let applied_at = DateTime::parse_from_rfc3339(&applied_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("applied_at `{applied_at}`: {e}")))?;

    Ok(LedgerRecord { record_id, rule_name, item_id: ItemId(item_id), extra, applied_at })
}

#[async_trait]
impl ChangeLedger for SqlChangeLedger {
    async fn append(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        self.insert(&record).await.map_err(|e| LedgerError(e.to_string()))
    }
}

#[async_trait]
impl ChangeLedgerRepository for SqlChangeLedger {
    async fn list_for_rule(
        &self,
        rule_name: &str,
        limit: u32,
    ) -> Result<Vec<LedgerRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, rule_name, item_id, extra, applied_at
             FROM change_ledger
             WHERE rule_name = ?
             ORDER BY applied_at DESC, id
             LIMIT ?",
        )
        .bind(rule_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}
