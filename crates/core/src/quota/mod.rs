//! Per-bucket action quotas.
//!
//! Candidates are filed under a grouping key (typically the owning team). When
//! a bucket holds more candidates than its limits allow, it is sorted so that
//! needinfo-bearing actions come first and, within each group, more important
//! items come first. The walk then keeps actions until the limits saturate.

pub mod needinfo;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::action::Candidate;
use crate::domain::change::FieldChange;
use crate::domain::item::{Item, ItemId};
use crate::errors::{ConfigurationError, InvariantViolation};

pub use needinfo::{
    NeedinfoAllocator, NeedinfoFormatter, NeedinfoMessage, NeedinfoPolicy, PlainNeedinfoFormatter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    AtMost(usize),
}

impl Limit {
    /// `-1` is unlimited, any other negative value is rejected.
    pub fn from_config(name: &str, value: i64) -> Result<Self, ConfigurationError> {
        match value {
            -1 => Ok(Self::Unlimited),
            value if value >= 0 => Ok(Self::AtMost(value as usize)),
            value => Err(ConfigurationError::InvalidLimit { name: name.to_string(), value }),
        }
    }

    /// Whether one more unit fits after `count` have been taken.
    pub fn allows(&self, count: usize) -> bool {
        match self {
            Self::Unlimited => true,
            Self::AtMost(limit) => count < *limit,
        }
    }

    /// Whether `count` units overflow this limit. Never true when unlimited.
    fn exceeded_by(&self, count: usize) -> bool {
        match self {
            Self::Unlimited => false,
            Self::AtMost(limit) => count > *limit,
        }
    }
}

/// Limits applied to every bucket of one rule. Fixed for the whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_needinfo: Limit,
    pub max_actions: Limit,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self { max_needinfo: Limit::Unlimited, max_actions: Limit::Unlimited }
    }

    pub fn from_config(max_needinfo: i64, max_actions: i64) -> Result<Self, ConfigurationError> {
        Ok(Self {
            max_needinfo: Limit::from_config("max_needinfo", max_needinfo)?,
            max_actions: Limit::from_config("max_actions", max_actions)?,
        })
    }

    /// A bucket is sorted as soon as it overflows any finite limit.
    fn requires_ordering(&self, bucket_len: usize) -> bool {
        self.max_needinfo.exceeded_by(bucket_len) || self.max_actions.exceeded_by(bucket_len)
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Owns the bucket map while a rule files its candidates.
#[derive(Clone, Debug)]
pub struct ActionBuckets<K = i64> {
    buckets: BTreeMap<String, Vec<Candidate<K>>>,
}

impl<K> Default for ActionBuckets<K> {
    fn default() -> Self {
        Self { buckets: BTreeMap::new() }
    }
}

impl<K> ActionBuckets<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files a candidate under its bucket. Filing the same action twice in one
    /// bucket keeps a single candidate with the higher importance.
    pub fn push(&mut self, candidate: Candidate<K>)
    where
        K: Ord,
    {
        let candidates = self.buckets.entry(candidate.bucket.clone()).or_default();
        match candidates.iter_mut().find(|filed| filed.action == candidate.action) {
            Some(filed) => {
                if candidate.importance > filed.importance {
                    filed.importance = candidate.importance;
                }
            }
            None => candidates.push(candidate),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.buckets.get(bucket).map(Vec::len).unwrap_or(0)
    }

    /// Drops every candidate whose item fails `keep`.
    pub fn retain_items(&mut self, mut keep: impl FnMut(&ItemId) -> bool) {
        for candidates in self.buckets.values_mut() {
            candidates.retain(|candidate| keep(candidate.action.item_id()));
        }
        self.buckets.retain(|_, candidates| !candidates.is_empty());
    }
}

impl<K: Ord> FromIterator<Candidate<K>> for ActionBuckets<K> {
    fn from_iter<T: IntoIterator<Item = Candidate<K>>>(iter: T) -> Self {
        let mut buckets = Self::new();
        for candidate in iter {
            buckets.push(candidate);
        }
        buckets
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub bucket: String,
    pub candidates: usize,
    pub needinfo_count: usize,
    pub action_count: usize,
    pub dropped: Vec<ItemId>,
}

/// What survived allocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Allocation {
    pub autofixes: BTreeMap<ItemId, FieldChange>,
    pub items_with_action: BTreeSet<ItemId>,
    pub buckets: Vec<BucketSummary>,
}

impl Allocation {
    /// Restricts a rule's item set to the items that kept at least one action.
    ///
    /// Only applied when the rule opts in; items are otherwise reported as-is.
    pub fn retain_items_with_action(
        &self,
        items: BTreeMap<ItemId, Item>,
    ) -> BTreeMap<ItemId, Item> {
        items.into_iter().filter(|(item_id, _)| self.items_with_action.contains(item_id)).collect()
    }
}

#[derive(Clone, Debug)]
pub struct QuotaAllocator {
    limits: QuotaLimits,
}

impl QuotaAllocator {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Truncates every bucket to the limits.
    ///
    /// Needinfo requests go through `needinfo`; an action whose request is
    /// rejected there loses its autofix as well.
    pub fn allocate<K: Ord>(
        &self,
        buckets: ActionBuckets<K>,
        needinfo: &mut NeedinfoAllocator,
    ) -> Result<Allocation, InvariantViolation> {
        let mut allocation = Allocation::default();

        for (bucket, mut candidates) in buckets.buckets {
            let total = candidates.len();
            if self.limits.requires_ordering(total) {
                candidates.sort_by(|left, right| {
                    right
                        .action
                        .has_needinfo()
                        .cmp(&left.action.has_needinfo())
                        .then_with(|| right.importance.cmp(&left.importance))
                });
            }

            let mut needinfo_count = 0usize;
            let mut action_count = 0usize;
            let mut dropped = Vec::new();

            for candidate in candidates {
                let action = candidate.action;
                let item_id = action.item_id().clone();
                let already_asked = action
                    .needinfo_request()
                    .is_some_and(|request| needinfo.holds(&item_id, &request.recipient_email));

                // Repeats an action another bucket already kept.
                if already_asked
                    && repeats_kept_autofix(allocation.autofixes.get(&item_id), action.autofix())
                {
                    continue;
                }

                if !self.limits.max_actions.allows(action_count) {
                    dropped.push(item_id);
                    continue;
                }

                if let Some(request) = action.needinfo_request().filter(|_| !already_asked) {
                    if !self.limits.max_needinfo.allows(needinfo_count) {
                        dropped.push(item_id);
                        continue;
                    }
                    if !needinfo.add(&item_id, request.clone()) {
                        dropped.push(item_id);
                        continue;
                    }
                    needinfo_count += 1;
                }

                if let Some(autofix) = action.autofix() {
                    let merged = match allocation.autofixes.get(&item_id) {
                        Some(existing) => existing.merge_disjoint(autofix, &item_id)?,
                        None => autofix.clone(),
                    };
                    allocation.autofixes.insert(item_id.clone(), merged);
                }

                action_count += 1;
                allocation.items_with_action.insert(item_id);
            }

            if !dropped.is_empty() {
                debug!(
                    event_name = "engine.quota.bucket_truncated",
                    bucket = %bucket,
                    candidates = total,
                    kept = action_count,
                    dropped = dropped.len(),
                    "bucket exceeded its quota"
                );
            }

            allocation.buckets.push(BucketSummary {
                bucket,
                candidates: total,
                needinfo_count,
                action_count,
                dropped,
            });
        }

        Ok(allocation)
    }
}

/// Whether every field of `autofix` is already kept with the same value.
fn repeats_kept_autofix(kept: Option<&FieldChange>, autofix: Option<&FieldChange>) -> bool {
    match (kept, autofix) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(kept), Some(autofix)) => {
            autofix.iter().all(|(field, value)| kept.get(field) == Some(value))
        }
    }
}
