//! Folds needinfo comments and field autofixes into one change per item.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::change::{ChangeSet, FieldChange};
use crate::domain::item::{looks_like_item_number, ItemId};
use crate::errors::InvariantViolation;

/// How a rule expresses its field autofixes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofixChanges {
    #[default]
    None,
    /// The same change for every matched item.
    Global(FieldChange),
    /// A distinct change per item.
    PerItem(BTreeMap<ItemId, FieldChange>),
}

impl AutofixChanges {
    /// Guesses the shape of an untyped change map: when every key looks like an
    /// item number the map is per-item, otherwise it is one global change.
    ///
    /// A global change whose field names happen to be numeric is misread as
    /// per-item. Rules should prefer building `Global`/`PerItem` directly.
    pub fn detect(raw: BTreeMap<String, Value>) -> Result<Self, serde_json::Error> {
        if raw.is_empty() {
            return Ok(Self::None);
        }
        if raw.keys().all(|key| looks_like_item_number(key)) {
            let per_item = raw
                .into_iter()
                .map(|(key, value)| {
                    serde_json::from_value::<FieldChange>(value).map(|change| (ItemId(key), change))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            return Ok(Self::PerItem(per_item));
        }
        Ok(Self::Global(FieldChange::from(raw)))
    }

    pub fn is_none(&self) -> bool {
        match self {
            Self::None => true,
            Self::Global(change) => change.is_empty(),
            Self::PerItem(changes) => changes.is_empty(),
        }
    }

    /// Drops per-item changes for items outside the run. A global change is kept
    /// as-is since it only ever targets the matched items.
    pub fn retain_items(self, mut keep: impl FnMut(&ItemId) -> bool) -> Self {
        match self {
            Self::PerItem(mut changes) => {
                changes.retain(|item_id, _| keep(item_id));
                Self::PerItem(changes)
            }
            other => other,
        }
    }

    fn change_for(&self, item_id: &ItemId) -> Option<&FieldChange> {
        match self {
            Self::None => None,
            Self::Global(change) => Some(change),
            Self::PerItem(changes) => changes.get(item_id),
        }
    }

    /// Adds per-item fixes (e.g. the ones surviving quota allocation). A global
    /// change is expanded over `matched_items` first.
    pub fn with_item_fixes(
        self,
        fixes: BTreeMap<ItemId, FieldChange>,
        matched_items: &BTreeSet<ItemId>,
    ) -> Result<Self, InvariantViolation> {
        if fixes.is_empty() {
            return Ok(self);
        }

        let mut per_item = match self {
            Self::None => BTreeMap::new(),
            Self::Global(change) => {
                matched_items.iter().map(|item_id| (item_id.clone(), change.clone())).collect()
            }
            Self::PerItem(changes) => changes,
        };

        for (item_id, fix) in fixes {
            let merged = match per_item.get(&item_id) {
                Some(existing) => existing.merge_disjoint(&fix, &item_id)?,
                None => fix,
            };
            per_item.insert(item_id, merged);
        }
        Ok(Self::PerItem(per_item))
    }
}

#[derive(Clone, Debug, Default)]
pub struct AutofixMerger;

impl AutofixMerger {
    /// One change per item. A global autofix is applied to every item in
    /// `matched_items`; per-item fixes apply to their own item only.
    ///
    /// Needinfo and autofix payloads come from independent sources and must
    /// never touch the same field.
    pub fn merge(
        &self,
        rule_name: &str,
        needinfo: &BTreeMap<ItemId, FieldChange>,
        autofix: &AutofixChanges,
        matched_items: &BTreeSet<ItemId>,
    ) -> Result<ChangeSet, InvariantViolation> {
        let mut targets: BTreeSet<&ItemId> = needinfo.keys().collect();
        match autofix {
            AutofixChanges::None => {}
            AutofixChanges::Global(_) => targets.extend(matched_items.iter()),
            AutofixChanges::PerItem(changes) => targets.extend(changes.keys()),
        }

        let mut merged = Vec::with_capacity(targets.len());
        for item_id in targets {
            let change = match (needinfo.get(item_id), autofix.change_for(item_id)) {
                (Some(comment), Some(fix)) => comment.merge_disjoint(fix, item_id)?,
                (Some(comment), None) => comment.clone(),
                (None, Some(fix)) => fix.clone(),
                (None, None) => continue,
            };
            merged.push((item_id.clone(), change));
        }

        Ok(ChangeSet::for_rule(rule_name, merged))
    }
}
