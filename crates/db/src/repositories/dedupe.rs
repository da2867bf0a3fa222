use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use tracing::debug;

use autotriage_core::dedupe::{DedupeEntry, DedupeStore, DedupeStoreError};
use autotriage_core::domain::item::ItemId;

use super::RepositoryError;
use crate::DbPool;

pub struct SqlDedupeStore {
    pool: DbPool,
}

impl SqlDedupeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load_entries(&self, rule_name: &str) -> Result<Vec<DedupeEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT item_id, last_seen FROM dedupe_cache WHERE rule_name = ? ORDER BY item_id",
        )
        .bind(rule_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Replaces the rule's entries in one transaction.
    pub async fn replace_entries(
        &self,
        rule_name: &str,
        entries: &[DedupeEntry],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM dedupe_cache WHERE rule_name = ?")
            .bind(rule_name)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query("INSERT INTO dedupe_cache (rule_name, item_id, last_seen) VALUES (?, ?, ?)")
                .bind(rule_name)
                .bind(entry.item_id.as_str())
                .bind(entry.last_seen.to_rfc3339_opts(SecondsFormat::Micros, true))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            event_name = "db.dedupe_cache.replaced",
            rule_name,
            entries = entries.len(),
            "dedupe cache persisted"
        );
        Ok(())
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DedupeEntry, RepositoryError> {
    let item_id: String = row.try_get("item_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_seen: String =
        row.try_get("last_seen").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_seen = DateTime::parse_from_rfc3339(&last_seen)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("last_seen `{last_seen}`: {e}")))?;

    Ok(DedupeEntry { item_id: ItemId(item_id), last_seen })
}

#[async_trait]
impl DedupeStore for SqlDedupeStore {
    async fn load(&self, rule_name: &str) -> Result<Vec<DedupeEntry>, DedupeStoreError> {
        self.load_entries(rule_name).await.map_err(|e| DedupeStoreError(e.to_string()))
    }

    async fn save(&self, rule_name: &str, entries: &[DedupeEntry]) -> Result<(), DedupeStoreError> {
        self.replace_entries(rule_name, entries).await.map_err(|e| DedupeStoreError(e.to_string()))
    }
}
