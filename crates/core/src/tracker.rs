//! The narrow interface the engine needs from the issue tracker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::change::FieldChange;
use crate::domain::item::{Item, ItemId};

/// Which tracker account performs a mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    #[default]
    Standard,
    /// Suppresses the tracker's own notification side effects.
    Silent,
}

/// Opaque search parameters, passed through to the tracker untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchQuery(pub Vec<(String, String)>);

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((key.into(), value.into()));
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.0
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("tracker transport failure: {0}")]
    Transport(String),
    #[error("tracker rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("could not decode tracker response: {0}")]
    Decode(String),
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
}

impl TrackerError {
    /// Failures worth another attempt within the same run.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::UnknownItem(_) => false,
        }
    }
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>, TrackerError>;

    async fn mutate(
        &self,
        item_id: &ItemId,
        change: &FieldChange,
        account: Account,
    ) -> Result<(), TrackerError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub item_id: ItemId,
    pub change: FieldChange,
    pub account: Account,
}

#[derive(Debug, Default)]
struct InMemoryState {
    items: BTreeMap<ItemId, Item>,
    mutations: Vec<MutationRecord>,
    attempts: HashMap<ItemId, u32>,
    pending_failures: HashMap<ItemId, u32>,
    broken: HashSet<ItemId>,
}

/// Tracker double holding items in memory. Failures can be injected per item.
#[derive(Clone, Default)]
pub struct InMemoryTracker {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTracker {
    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let tracker = Self::default();
        tracker.with_state(|state| {
            state.items = items.into_iter().map(|item| (item.id.clone(), item)).collect();
        });
        tracker
    }

    /// The next `times` mutations of `item_id` fail with a transport error.
    pub fn fail_next(&self, item_id: impl Into<ItemId>, times: u32) {
        self.with_state(|state| {
            state.pending_failures.insert(item_id.into(), times);
        });
    }

    /// Every mutation of `item_id` fails.
    pub fn fail_always(&self, item_id: impl Into<ItemId>) {
        self.with_state(|state| {
            state.broken.insert(item_id.into());
        });
    }

    pub fn mutations(&self) -> Vec<MutationRecord> {
        self.with_state(|state| state.mutations.clone())
    }

    pub fn attempts(&self, item_id: &ItemId) -> u32 {
        self.with_state(|state| state.attempts.get(item_id).copied().unwrap_or(0))
    }

    pub fn item(&self, item_id: &ItemId) -> Option<Item> {
        self.with_state(|state| state.items.get(item_id).cloned())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Tracker for InMemoryTracker {
    /// Items whose fields equal every query parameter; `id` matches the item id.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>, TrackerError> {
        Ok(self.with_state(|state| {
            state
                .items
                .values()
                .filter(|item| {
                    query.params().iter().all(|(key, expected)| match key.as_str() {
                        "id" => item.id.as_str() == expected,
                        field => match item.field(field) {
                            Some(Value::String(value)) => value == expected,
                            Some(other) => other.to_string() == *expected,
                            None => false,
                        },
                    })
                })
                .cloned()
                .collect()
        }))
    }

    async fn mutate(
        &self,
        item_id: &ItemId,
        change: &FieldChange,
        account: Account,
    ) -> Result<(), TrackerError> {
        self.with_state(|state| {
            *state.attempts.entry(item_id.clone()).or_default() += 1;

            if state.broken.contains(item_id) {
                return Err(TrackerError::Rejected {
                    status: 400,
                    message: format!("item {item_id} refuses changes"),
                });
            }
            if let Some(remaining) = state.pending_failures.get_mut(item_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TrackerError::Transport("injected failure".to_string()));
                }
            }

            if let Some(item) = state.items.get_mut(item_id) {
                for (field, value) in change.iter() {
                    item.fields.insert(field.clone(), value.clone());
                }
            }
            state.mutations.push(MutationRecord {
                item_id: item_id.clone(),
                change: change.clone(),
                account,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Account, InMemoryTracker, SearchQuery, Tracker, TrackerError};
    use crate::domain::change::FieldChange;
    use crate::domain::item::{Item, ItemId};

    #[tokio::test]
    async fn search_filters_on_fields_and_id() {
        let tracker = InMemoryTracker::with_items([
            Item::new("1").with_field("product", json!("Core")),
            Item::new("2").with_field("product", json!("Toolkit")),
        ]);

        let found = tracker
            .search(&SearchQuery::new().param("product", "Core"))
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ItemId::from("1"));

        let by_id = tracker.search(&SearchQuery::new().param("id", "2")).await.expect("search");
        assert_eq!(by_id[0].id, ItemId::from("2"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_before_success() {
        let tracker = InMemoryTracker::with_items([Item::new("1")]);
        tracker.fail_next("1", 1);
        let change = FieldChange::new().with("status", json!("RESOLVED"));
        let id = ItemId::from("1");

        let first = tracker.mutate(&id, &change, Account::Standard).await;
        assert!(matches!(first, Err(TrackerError::Transport(_))));
        tracker.mutate(&id, &change, Account::Silent).await.expect("second attempt succeeds");

        assert_eq!(tracker.attempts(&id), 2);
        assert_eq!(tracker.mutations()[0].account, Account::Silent);
        let item = tracker.item(&id).expect("item");
        assert_eq!(item.str_field("status"), Some("RESOLVED"));
    }

    #[test]
    fn server_errors_are_transient_but_client_errors_are_not() {
        assert!(TrackerError::Rejected { status: 503, message: String::new() }.is_transient());
        assert!(TrackerError::Rejected { status: 429, message: String::new() }.is_transient());
        assert!(!TrackerError::Rejected { status: 400, message: String::new() }.is_transient());
        assert!(TrackerError::Transport("reset".to_string()).is_transient());
    }
}
