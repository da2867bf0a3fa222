//! Mass-change limiter. Runs before any mutation, in dry run as well.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::change::{ChangeSet, FieldChange};
use crate::domain::item::ItemId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMode {
    #[default]
    Limited,
    /// Escape hatch (`--no-limit`).
    Unlimited,
}

/// A change set that passed the guard. The applier only accepts this type.
#[derive(Clone, Debug, PartialEq)]
pub struct GuardedChangeSet {
    rule_name: String,
    changes: ChangeSet,
}

impl GuardedChangeSet {
    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// The whole proposed batch of an aborted run, handed to the alerting collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbortSignal {
    pub rule_name: String,
    pub ceiling: usize,
    pub items: Vec<ItemId>,
    pub changes: BTreeMap<ItemId, FieldChange>,
}

impl AbortSignal {
    pub fn proposed(&self) -> usize {
        self.changes.len()
    }

    /// Bug-by-bug plain text listing of the aborted batch.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{}: {} proposed changes exceed the limit of {}; nothing was applied",
            self.rule_name,
            self.proposed(),
            self.ceiling
        )];
        for (item_id, change) in &self.changes {
            let fields: Vec<&str> = change.fields().collect();
            lines.push(format!("- {item_id}: {}", fields.join(", ")));
        }
        lines.join("\n")
    }
}

impl std::fmt::Display for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "too many changes for `{}`: {} proposed, limit {}",
            self.rule_name,
            self.proposed(),
            self.ceiling
        )
    }
}

impl std::error::Error for AbortSignal {}

#[derive(Clone, Copy, Debug)]
pub struct AbortGuard {
    ceiling: usize,
    mode: LimitMode,
}

impl AbortGuard {
    pub fn new(ceiling: usize, mode: LimitMode) -> Self {
        Self { ceiling, mode }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// All or nothing: either the whole set is released or the run aborts.
    pub fn check(
        &self,
        rule_name: &str,
        changes: ChangeSet,
    ) -> Result<GuardedChangeSet, AbortSignal> {
        if self.mode == LimitMode::Limited && changes.len() > self.ceiling {
            warn!(
                event_name = "engine.guard.aborted",
                rule_name,
                proposed = changes.len(),
                ceiling = self.ceiling,
                "proposed change count exceeds the ceiling; aborting run"
            );
            return Err(AbortSignal {
                rule_name: rule_name.to_string(),
                ceiling: self.ceiling,
                items: changes.item_ids().cloned().collect(),
                changes: changes.iter().map(|(id, change)| (id.clone(), change.clone())).collect(),
            });
        }

        Ok(GuardedChangeSet { rule_name: rule_name.to_string(), changes })
    }
}
