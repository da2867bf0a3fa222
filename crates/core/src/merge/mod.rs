//! Combines change sets produced by independently run rules.
//!
//! A field touched by a single rule passes through. A field touched by two or
//! more rules on the same item is contended and must be resolved by the merge
//! function registered for that field name. There is no implicit default: an
//! unregistered contended field is a configuration error.

pub mod strategies;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::domain::change::{ChangeSet, FieldChange};
use crate::domain::item::ItemId;
use crate::errors::ConfigurationError;

/// Resolves one contended field from `{rule name: that rule's value}`.
pub type MergeFn =
    Box<dyn Fn(&BTreeMap<String, Value>) -> Result<Value, ConfigurationError> + Send + Sync>;

#[derive(Default)]
pub struct MergeRegistry {
    functions: HashMap<String, MergeFn>,
}

impl MergeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, field: impl Into<String>, merge: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> Result<Value, ConfigurationError> + Send + Sync + 'static,
    {
        self.insert(field, Box::new(merge));
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, merge: MergeFn) {
        self.functions.insert(field.into(), merge);
    }

    pub fn contains(&self, field: &str) -> bool {
        self.functions.contains_key(field)
    }

    fn get(&self, field: &str) -> Option<&MergeFn> {
        self.functions.get(field)
    }
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<&String> = self.functions.keys().collect();
        fields.sort();
        f.debug_struct("MergeRegistry").field("fields", &fields).finish()
    }
}

#[derive(Debug, Default)]
pub struct CrossRuleMerger {
    registry: MergeRegistry,
}

impl CrossRuleMerger {
    pub fn new(registry: MergeRegistry) -> Self {
        Self { registry }
    }

    /// Every item is resolved before anything is returned, so a configuration
    /// error always surfaces before the merged set can reach the applier.
    pub fn merge(
        &self,
        contributions: &[(String, ChangeSet)],
    ) -> Result<ChangeSet, ConfigurationError> {
        let mut seen_rules = BTreeSet::new();
        let mut by_item: BTreeMap<&ItemId, BTreeMap<&str, &FieldChange>> = BTreeMap::new();

        for (rule_name, changes) in contributions {
            if !seen_rules.insert(rule_name.as_str()) {
                return Err(ConfigurationError::DuplicateRule(rule_name.clone()));
            }
            for (item_id, change) in changes.iter() {
                by_item.entry(item_id).or_default().insert(rule_name.as_str(), change);
            }
        }

        let mut merged = ChangeSet::default();
        for (item_id, rule_changes) in by_item {
            let mut per_field: BTreeMap<&str, BTreeMap<String, Value>> = BTreeMap::new();
            for (rule_name, change) in &rule_changes {
                for (field, value) in change.iter() {
                    per_field
                        .entry(field.as_str())
                        .or_default()
                        .insert((*rule_name).to_string(), value.clone());
                }
            }

            let mut change = FieldChange::new();
            for (field, mut values) in per_field {
                if values.len() == 1 {
                    if let Some((_, value)) = values.pop_first() {
                        change.insert(field, value);
                    }
                    continue;
                }

                let merge = self.registry.get(field).ok_or_else(|| {
                    ConfigurationError::MissingMergeFunction {
                        field: field.to_string(),
                        item_id: item_id.clone(),
                    }
                })?;
                debug!(
                    event_name = "engine.merge.contended_field",
                    item_id = %item_id,
                    field,
                    rules = ?values.keys().collect::<Vec<_>>(),
                    "resolving field touched by several rules"
                );
                change.insert(field, merge(&values)?);
            }

            let contributors = rule_changes.keys().map(|rule| (*rule).to_string()).collect();
            merged.insert_with_provenance(item_id.clone(), change, contributors);
        }

        Ok(merged)
    }
}
