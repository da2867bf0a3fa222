//! Items a rule already acted upon, with expiry.
//!
//! The cache is read once when a run starts and written once when it ends.
//! An item seen again refreshes its timestamp, so it only leaves the cache
//! after disappearing from results for longer than the retention window.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::item::ItemId;
use crate::errors::ConfigurationError;

/// How long a processed item stays in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheRetention {
    /// No caching: every item is treated as unseen and nothing is stored.
    Disabled,
    Days(u32),
    Forever,
}

impl CacheRetention {
    /// `0` disables the cache, `-1` keeps entries forever.
    pub fn from_config(max_days_in_cache: i64) -> Result<Self, ConfigurationError> {
        match max_days_in_cache {
            -1 => Ok(Self::Forever),
            0 => Ok(Self::Disabled),
            days if days > 0 => u32::try_from(days).map(Self::Days).map_err(|_| {
                ConfigurationError::InvalidLimit {
                    name: "max_days_in_cache".to_string(),
                    value: days,
                }
            }),
            other => Err(ConfigurationError::InvalidLimit {
                name: "max_days_in_cache".to_string(),
                value: other,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    fn is_expired(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Disabled => true,
            Self::Forever => false,
            Self::Days(days) => now - last_seen > Duration::days(i64::from(*days)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeEntry {
    pub item_id: ItemId,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DedupeCache {
    retention: CacheRetention,
    entries: BTreeMap<ItemId, DateTime<Utc>>,
}

impl DedupeCache {
    pub fn disabled() -> Self {
        Self { retention: CacheRetention::Disabled, entries: BTreeMap::new() }
    }

    /// Loads persisted entries, dropping the ones that expired before `now`.
    pub fn from_entries(
        entries: impl IntoIterator<Item = DedupeEntry>,
        retention: CacheRetention,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = entries
            .into_iter()
            .filter(|entry| !retention.is_expired(entry.last_seen, now))
            .map(|entry| (entry.item_id, entry.last_seen))
            .collect();
        Self { retention, entries }
    }

    pub fn retention(&self) -> CacheRetention {
        self.retention
    }

    pub fn contains(&self, item_id: &ItemId) -> bool {
        self.entries.contains_key(item_id)
    }

    /// Returns the ids not seen before, in input order. Ids already in the
    /// cache get their timestamp refreshed to `now`.
    pub fn partition(
        &mut self,
        item_ids: impl IntoIterator<Item = ItemId>,
        now: DateTime<Utc>,
    ) -> Vec<ItemId> {
        let mut unseen = Vec::new();
        for item_id in item_ids {
            match self.entries.get_mut(&item_id) {
                Some(last_seen) => *last_seen = now,
                None => unseen.push(item_id),
            }
        }
        unseen
    }

    pub fn record(&mut self, item_ids: impl IntoIterator<Item = ItemId>, now: DateTime<Utc>) {
        if !self.retention.is_enabled() {
            return;
        }
        for item_id in item_ids {
            self.entries.insert(item_id, now);
        }
    }

    pub fn entries(&self) -> Vec<DedupeEntry> {
        self.entries
            .iter()
            .map(|(item_id, last_seen)| DedupeEntry { item_id: item_id.clone(), last_seen: *last_seen })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("dedupe store failure: {0}")]
pub struct DedupeStoreError(pub String);

/// Persistence of a rule's cache between runs.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    async fn load(&self, rule_name: &str) -> Result<Vec<DedupeEntry>, DedupeStoreError>;
    /// Replaces everything stored for `rule_name`.
    async fn save(&self, rule_name: &str, entries: &[DedupeEntry]) -> Result<(), DedupeStoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryDedupeStore {
    rules: Arc<Mutex<HashMap<String, Vec<DedupeEntry>>>>,
}

impl InMemoryDedupeStore {
    pub fn entries(&self, rule_name: &str) -> Vec<DedupeEntry> {
        let rules = match self.rules.lock() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };
        rules.get(rule_name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DedupeStore for InMemoryDedupeStore {
    async fn load(&self, rule_name: &str) -> Result<Vec<DedupeEntry>, DedupeStoreError> {
        Ok(self.entries(rule_name))
    }

    async fn save(&self, rule_name: &str, entries: &[DedupeEntry]) -> Result<(), DedupeStoreError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|_| DedupeStoreError("in-memory dedupe store lock poisoned".to_string()))?;
        rules.insert(rule_name.to_string(), entries.to_vec());
        Ok(())
    }
}
