use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::apply::{ApplierConfig, ApplyOptions, ApplyReport, ChangeApplier};
use crate::audit::ChangeLedger;
use crate::autofix::{AutofixChanges, AutofixMerger};
use crate::dedupe::{CacheRetention, DedupeCache, DedupeStore};
use crate::domain::action::Candidate;
use crate::domain::change::ChangeSet;
use crate::domain::item::{Item, ItemId};
use crate::errors::{EngineError, InvariantViolation};
use crate::guard::{AbortGuard, AbortSignal, LimitMode};
use crate::merge::CrossRuleMerger;
use crate::quota::{
    ActionBuckets, BucketSummary, NeedinfoAllocator, NeedinfoFormatter, NeedinfoMessage,
    NeedinfoPolicy, PlainNeedinfoFormatter, QuotaAllocator, QuotaLimits,
};
use crate::run::states::{PhaseTracker, RunPhase};
use crate::tracker::{Account, Tracker};

/// Behaviors a rule opts into when it is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCapabilities {
    /// The rule notifies item owners in addition to changing items.
    pub nag: bool,
}

/// An owner to notify about an item, as reported by a nagging rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NagRequest {
    pub item_id: ItemId,
    pub owner_email: String,
}

/// One notification per owner per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NagNotice {
    pub owner_email: String,
    pub items: Vec<ItemId>,
}

/// What a rule hands to the engine after querying the tracker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleOutput {
    pub items: Vec<Item>,
    pub candidates: Vec<Candidate>,
    pub autofix: AutofixChanges,
    pub nags: Vec<NagRequest>,
}

#[derive(Clone)]
pub struct RunContext {
    pub date: NaiveDate,
    pub tracker: Arc<dyn Tracker>,
}

#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> RuleCapabilities {
        RuleCapabilities::default()
    }

    async fn collect(&self, context: &RunContext) -> Result<RuleOutput, EngineError>;
}

/// Per-rule limits, resolved from configuration before the run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleSettings {
    pub limits: QuotaLimits,
    pub exclude_no_action_items: bool,
    pub cache_retention: CacheRetention,
    pub change_ceiling: usize,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            limits: QuotaLimits::unlimited(),
            exclude_no_action_items: false,
            cache_retention: CacheRetention::Days(7),
            change_ceiling: 300,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub limit_mode: LimitMode,
    pub account: Account,
    pub date: NaiveDate,
    pub now: DateTime<Utc>,
}

impl RunOptions {
    /// Dry run, guarded, standard account, dated `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            dry_run: true,
            limit_mode: LimitMode::Limited,
            account: Account::Standard,
            date: now.date_naive(),
            now,
        }
    }

    pub fn production(mut self) -> Self {
        self.dry_run = false;
        self
    }
}

/// What one rule contributed to a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub rule_name: String,
    pub items: Vec<ItemId>,
    pub already_seen: usize,
    pub buckets: Vec<BucketSummary>,
    pub needinfo_messages: Vec<NeedinfoMessage>,
    pub nags: Vec<NagNotice>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub rule_name: String,
    pub phases: Vec<RunPhase>,
    pub rules: Vec<RuleSummary>,
    pub apply: ApplyReport,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete(RunReport),
    Aborted(AbortSignal),
}

impl RunOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// A rule run stopped after merging, before the guard.
#[derive(Clone, Debug)]
pub struct PreparedRun {
    summary: RuleSummary,
    settings: RuleSettings,
    phases: PhaseTracker,
    cache: DedupeCache,
    changes: ChangeSet,
}

impl PreparedRun {
    pub fn rule_name(&self) -> &str {
        &self.summary.rule_name
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn summary(&self) -> &RuleSummary {
        &self.summary
    }

    pub fn phase(&self) -> RunPhase {
        self.phases.current()
    }
}

/// Result of the guard plus apply step, shared by single and composed runs.
enum Guarded {
    Applied(ApplyReport),
    Aborted(AbortSignal),
}

pub struct RunEngine {
    tracker: Arc<dyn Tracker>,
    ledger: Arc<dyn ChangeLedger>,
    dedupe: Arc<dyn DedupeStore>,
    needinfo_policy: NeedinfoPolicy,
    formatter: Arc<dyn NeedinfoFormatter + Send + Sync>,
    applier_config: ApplierConfig,
}

impl RunEngine {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        ledger: Arc<dyn ChangeLedger>,
        dedupe: Arc<dyn DedupeStore>,
    ) -> Self {
        Self {
            tracker,
            ledger,
            dedupe,
            needinfo_policy: NeedinfoPolicy::default(),
            formatter: Arc::new(PlainNeedinfoFormatter),
            applier_config: ApplierConfig::default(),
        }
    }

    pub fn with_needinfo_policy(mut self, policy: NeedinfoPolicy) -> Self {
        self.needinfo_policy = policy;
        self
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn NeedinfoFormatter + Send + Sync>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_applier_config(mut self, config: ApplierConfig) -> Self {
        self.applier_config = config;
        self
    }

    /// Collects, filters already-processed items, allocates quotas and folds
    /// needinfos and autofixes into one change per item. Nothing is mutated.
    pub async fn prepare(
        &self,
        rule: &dyn Rule,
        settings: RuleSettings,
        options: &RunOptions,
    ) -> Result<PreparedRun, EngineError> {
        let rule_name = rule.name().to_string();
        let mut phases = PhaseTracker::new();

        let context = RunContext { date: options.date, tracker: Arc::clone(&self.tracker) };
        let output = rule.collect(&context).await.map_err(|collect_error| {
            error!(
                event_name = "engine.run.collect_failed",
                rule_name = %rule_name,
                error = %collect_error,
                "rule failed while collecting candidates"
            );
            collect_error
        })?;

        let mut cache = if settings.cache_retention.is_enabled() {
            let entries = self
                .dedupe
                .load(&rule_name)
                .await
                .map_err(|store_error| EngineError::Store(store_error.to_string()))?;
            DedupeCache::from_entries(entries, settings.cache_retention, options.now)
        } else {
            DedupeCache::disabled()
        };

        let RuleOutput { items, candidates, autofix, nags } = output;
        let mut items: BTreeMap<ItemId, Item> =
            items.into_iter().map(|item| (item.id.clone(), item)).collect();
        for candidate in &candidates {
            let item_id = candidate.action.item_id();
            if !items.contains_key(item_id) {
                items.insert(item_id.clone(), Item::new(item_id.clone()));
            }
        }

        let total = items.len();
        let unseen: BTreeSet<ItemId> =
            cache.partition(items.keys().cloned().collect::<Vec<_>>(), options.now).into_iter().collect();
        let already_seen = total - unseen.len();
        items.retain(|item_id, _| unseen.contains(item_id));

        let mut buckets: ActionBuckets = candidates.into_iter().collect();
        buckets.retain_items(|item_id| unseen.contains(item_id));
        let autofix = autofix.retain_items(|item_id| unseen.contains(item_id));

        let mut needinfo = NeedinfoAllocator::new(self.needinfo_policy.clone());
        let allocation = QuotaAllocator::new(settings.limits).allocate(buckets, &mut needinfo)?;
        phases.advance(RunPhase::QuotaAllocated)?;

        if settings.exclude_no_action_items {
            items = allocation.retain_items_with_action(items);
        }

        let matched: BTreeSet<ItemId> = items.keys().cloned().collect();
        let needinfo_changes = needinfo.changes(&rule_name, self.formatter.as_ref());
        let autofix = autofix.with_item_fixes(allocation.autofixes.clone(), &matched)?;
        let changes = AutofixMerger.merge(&rule_name, &needinfo_changes, &autofix, &matched)?;
        phases.advance(RunPhase::Merged)?;

        let nags = if rule.capabilities().nag {
            group_nags(nags, &matched)
        } else {
            if !nags.is_empty() {
                debug!(
                    event_name = "engine.run.nags_ignored",
                    rule_name = %rule_name,
                    count = nags.len(),
                    "rule does not nag; owner notifications dropped"
                );
            }
            Vec::new()
        };

        info!(
            event_name = "engine.run.prepared",
            rule_name = %rule_name,
            items = matched.len(),
            already_seen,
            changes = changes.len(),
            needinfo_recipients = needinfo.recipient_count(),
            "rule run prepared"
        );

        Ok(PreparedRun {
            summary: RuleSummary {
                rule_name,
                items: matched.into_iter().collect(),
                already_seen,
                buckets: allocation.buckets,
                needinfo_messages: needinfo.messages(),
                nags,
            },
            settings,
            phases,
            cache,
            changes,
        })
    }

    /// Guards, applies and records the prepared run in the dedupe cache.
    pub async fn finish(
        &self,
        prepared: PreparedRun,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let PreparedRun { summary, settings, mut phases, mut cache, changes } = prepared;
        let rule_name = summary.rule_name.clone();

        match self
            .guard_and_apply(&rule_name, changes, settings.change_ceiling, options, &mut phases)
            .await?
        {
            Guarded::Aborted(signal) => Ok(RunOutcome::Aborted(signal)),
            Guarded::Applied(report) => {
                self.record_processed(&rule_name, &mut cache, &summary.items, &report, options)
                    .await?;
                phases.advance(RunPhase::Complete)?;
                Ok(RunOutcome::Complete(RunReport {
                    rule_name,
                    phases: phases.history().to_vec(),
                    rules: vec![summary],
                    apply: report,
                }))
            }
        }
    }

    pub async fn run(
        &self,
        rule: &dyn Rule,
        settings: RuleSettings,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let prepared = self.prepare(rule, settings, options).await?;
        self.finish(prepared, options).await
    }

    /// Runs several rules up to the merge step, combines their changes and
    /// applies the result in a single guarded pass.
    pub async fn compose(
        &self,
        name: &str,
        rules: &[(&dyn Rule, RuleSettings)],
        merger: &CrossRuleMerger,
        change_ceiling: usize,
        options: &RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let mut prepared_runs = Vec::with_capacity(rules.len());
        for (rule, settings) in rules {
            prepared_runs.push(self.prepare(*rule, *settings, options).await?);
        }

        let contributions: Vec<(String, ChangeSet)> = prepared_runs
            .iter()
            .map(|prepared| (prepared.rule_name().to_string(), prepared.changes.clone()))
            .collect();
        let merged = merger.merge(&contributions).map_err(|merge_error| {
            error!(
                event_name = "engine.compose.merge_failed",
                rule_name = name,
                error = %merge_error,
                "rules could not be composed"
            );
            merge_error
        })?;

        let mut phases = PhaseTracker::new();
        phases.advance(RunPhase::QuotaAllocated)?;
        phases.advance(RunPhase::Merged)?;

        let report =
            match self.guard_and_apply(name, merged, change_ceiling, options, &mut phases).await? {
                Guarded::Aborted(signal) => return Ok(RunOutcome::Aborted(signal)),
                Guarded::Applied(report) => report,
            };

        let mut summaries = Vec::with_capacity(prepared_runs.len());
        for prepared in prepared_runs {
            let PreparedRun { summary, mut cache, .. } = prepared;
            self.record_processed(&summary.rule_name, &mut cache, &summary.items, &report, options)
                .await?;
            summaries.push(summary);
        }
        phases.advance(RunPhase::Complete)?;

        Ok(RunOutcome::Complete(RunReport {
            rule_name: name.to_string(),
            phases: phases.history().to_vec(),
            rules: summaries,
            apply: report,
        }))
    }

    async fn guard_and_apply(
        &self,
        rule_name: &str,
        changes: ChangeSet,
        change_ceiling: usize,
        options: &RunOptions,
        phases: &mut PhaseTracker,
    ) -> Result<Guarded, InvariantViolation> {
        let guarded = match AbortGuard::new(change_ceiling, options.limit_mode).check(rule_name, changes)
        {
            Ok(guarded) => guarded,
            Err(signal) => {
                phases.advance(RunPhase::Aborted)?;
                error!(
                    event_name = "engine.run.aborted",
                    rule_name,
                    ceiling = signal.ceiling,
                    proposed = signal.proposed(),
                    "too many changes; nothing applied"
                );
                return Ok(Guarded::Aborted(signal));
            }
        };
        phases.advance(RunPhase::GuardChecked)?;
        phases.advance(RunPhase::Applying)?;

        let audit_notes = guarded.changes().audit_notes();
        let applier = ChangeApplier::with_config(
            Arc::clone(&self.tracker),
            Arc::clone(&self.ledger),
            self.applier_config.clone(),
        );
        let report = applier
            .apply(
                &guarded,
                ApplyOptions { account: options.account, dry_run: options.dry_run },
                &audit_notes,
            )
            .await;
        Ok(Guarded::Applied(report))
    }

    /// Items whose change failed stay out of the cache so the next run retries them.
    async fn record_processed(
        &self,
        rule_name: &str,
        cache: &mut DedupeCache,
        items: &[ItemId],
        report: &ApplyReport,
        options: &RunOptions,
    ) -> Result<(), EngineError> {
        if options.dry_run || !cache.retention().is_enabled() {
            return Ok(());
        }

        let failed: BTreeSet<&ItemId> = report.failed.iter().map(|failure| &failure.item_id).collect();
        cache.record(items.iter().filter(|item_id| !failed.contains(item_id)).cloned(), options.now);
        self.dedupe.save(rule_name, &cache.entries()).await.map_err(|store_error| {
            warn!(
                event_name = "engine.run.cache_save_failed",
                rule_name,
                error = %store_error,
                "dedupe cache could not be saved"
            );
            EngineError::Store(store_error.to_string())
        })
    }
}

fn group_nags(nags: Vec<NagRequest>, matched: &BTreeSet<ItemId>) -> Vec<NagNotice> {
    let mut by_owner: BTreeMap<String, Vec<ItemId>> = BTreeMap::new();
    for nag in nags {
        if !matched.contains(&nag.item_id) {
            continue;
        }
        let items = by_owner.entry(nag.owner_email.trim().to_ascii_lowercase()).or_default();
        if !items.contains(&nag.item_id) {
            items.push(nag.item_id);
        }
    }
    by_owner.into_iter().map(|(owner_email, items)| NagNotice { owner_email, items }).collect()
}
