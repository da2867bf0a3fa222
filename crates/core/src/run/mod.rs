//! One scheduled rule run, from collection to the dedupe cache.

pub mod engine;
pub mod states;

pub use engine::{
    NagNotice, NagRequest, PreparedRun, Rule, RuleCapabilities, RuleOutput, RuleSettings,
    RuleSummary, RunContext, RunEngine, RunOptions, RunOutcome, RunReport,
};
pub use states::{PhaseTracker, RunPhase};
