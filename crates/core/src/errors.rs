use thiserror::Error;

use crate::domain::item::ItemId;
use crate::run::states::RunPhase;
use crate::tracker::TrackerError;

/// Mistakes in how rules are configured or composed. Fatal, raised before any mutation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no merge function registered for field `{field}` touched by several rules (item {item_id})")]
    MissingMergeFunction { field: String, item_id: ItemId },
    #[error("merge function does not recognise the rule set {rules:?}")]
    UnexpectedRules { rules: Vec<String> },
    #[error("rule `{0}` contributed more than one change set to the same composition")]
    DuplicateRule(String),
    #[error("invalid limit `{value}` for `{name}` (expected -1 or a non-negative count)")]
    InvalidLimit { name: String, value: i64 },
}

/// Broken internal assumptions. Treated as bugs, never recovered from.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("item {item_id}: needinfo and autofix changes both touch {fields:?}")]
    OverlappingFields { item_id: ItemId, fields: Vec<String> },
    #[error("action for item {0} carries neither a needinfo nor an autofix")]
    EmptyAction(ItemId),
    #[error("invalid run phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition { from: RunPhase, to: RunPhase },
}

/// A mutation that still failed after the retry budget was spent.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("item {item_id}: mutation failed after {attempts} attempt(s): {message}")]
pub struct TransientApplyError {
    pub item_id: ItemId,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error("rule `{rule}` failed to collect candidates: {message}")]
    Rule { rule: String, message: String },
    #[error("tracker search failed: {0}")]
    Tracker(#[from] TrackerError),
    #[error("state store failure: {0}")]
    Store(String),
}

impl EngineError {
    /// Short machine-readable class used in command output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Invariant(_) => "invariant_violation",
            Self::Rule { .. } => "rule",
            Self::Tracker(_) => "tracker",
            Self::Store(_) => "store",
        }
    }
}
