pub mod apply;
pub mod audit;
pub mod autofix;
pub mod config;
pub mod dedupe;
pub mod domain;
pub mod errors;
pub mod guard;
pub mod merge;
pub mod quota;
pub mod run;
pub mod tracker;

pub use apply::{ApplierConfig, ApplyOptions, ApplyReport, ChangeApplier, FailedChange};
pub use audit::{ChangeLedger, InMemoryChangeLedger, LedgerError, LedgerRecord};
pub use autofix::{AutofixChanges, AutofixMerger};
pub use dedupe::{
    CacheRetention, DedupeCache, DedupeEntry, DedupeStore, DedupeStoreError, InMemoryDedupeStore,
};
pub use domain::action::{Action, Candidate, NeedinfoRequest};
pub use domain::change::{ChangeSet, FieldChange};
pub use domain::item::{Item, ItemId};
pub use errors::{ConfigurationError, EngineError, InvariantViolation, TransientApplyError};
pub use guard::{AbortGuard, AbortSignal, GuardedChangeSet, LimitMode};
pub use merge::{strategies, CrossRuleMerger, MergeFn, MergeRegistry};
pub use quota::{
    ActionBuckets, Allocation, BucketSummary, Limit, NeedinfoAllocator, NeedinfoFormatter,
    NeedinfoMessage, NeedinfoPolicy, PlainNeedinfoFormatter, QuotaAllocator, QuotaLimits,
};
pub use run::{
    NagNotice, NagRequest, PhaseTracker, PreparedRun, Rule, RuleCapabilities, RuleOutput,
    RuleSettings, RuleSummary, RunContext, RunEngine, RunOptions, RunOutcome, RunPhase, RunReport,
};
pub use tracker::{Account, InMemoryTracker, MutationRecord, SearchQuery, Tracker, TrackerError};
