use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::item::ItemId;
use crate::errors::InvariantViolation;

/// Field name to new value (or structured op such as `{"add": [..]}`) for one item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldChange(BTreeMap<String, Value>);

impl FieldChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }

    /// Union of two changes that must not touch the same field.
    pub fn merge_disjoint(
        &self,
        other: &FieldChange,
        item_id: &ItemId,
    ) -> Result<FieldChange, InvariantViolation> {
        let overlapping: Vec<String> =
            self.0.keys().filter(|field| other.0.contains_key(*field)).cloned().collect();
        if !overlapping.is_empty() {
            return Err(InvariantViolation::OverlappingFields {
                item_id: item_id.clone(),
                fields: overlapping,
            });
        }

        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(field, value)| (field.clone(), value.clone())));
        Ok(Self(merged))
    }
}

impl From<BTreeMap<String, Value>> for FieldChange {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self(value)
    }
}

impl FromIterator<(String, Value)> for FieldChange {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The per-item changes actually sent to the tracker, one merged change per item.
///
/// Built once and read-only afterwards. Provenance records which rules
/// contributed to each item and doubles as the ledger note.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: BTreeMap<ItemId, FieldChange>,
    provenance: BTreeMap<ItemId, BTreeSet<String>>,
}

impl ChangeSet {
    /// Every change is attributed to `rule_name`. Empty changes are dropped.
    pub fn for_rule(
        rule_name: &str,
        changes: impl IntoIterator<Item = (ItemId, FieldChange)>,
    ) -> Self {
        let mut set = Self::default();
        for (item_id, change) in changes {
            if change.is_empty() {
                continue;
            }
            set.provenance.entry(item_id.clone()).or_default().insert(rule_name.to_string());
            set.changes.insert(item_id, change);
        }
        set
    }

    pub(crate) fn insert_with_provenance(
        &mut self,
        item_id: ItemId,
        change: FieldChange,
        rules: BTreeSet<String>,
    ) {
        if change.is_empty() {
            return;
        }
        self.provenance.insert(item_id.clone(), rules);
        self.changes.insert(item_id, change);
    }

    pub fn get(&self, item_id: &ItemId) -> Option<&FieldChange> {
        self.changes.get(item_id)
    }

    pub fn contributors(&self, item_id: &ItemId) -> Option<&BTreeSet<String>> {
        self.provenance.get(item_id)
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.changes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &FieldChange)> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Ledger notes: the contributing rules of each item, comma separated.
    pub fn audit_notes(&self) -> BTreeMap<ItemId, String> {
        self.provenance
            .iter()
            .map(|(item_id, rules)| {
                (item_id.clone(), rules.iter().map(String::as_str).collect::<Vec<_>>().join(","))
            })
            .collect()
    }
}
