use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use autotriage_core::{
    AutofixChanges, DedupeStore, EngineError, FieldChange, InMemoryTracker, Item, ItemId, Rule,
    RuleOutput, RuleSettings, RunContext, RunEngine, RunOptions, RunOutcome,
};
use autotriage_db::migrations::run_pending;
use autotriage_db::{connect, ChangeLedgerRepository, SqlChangeLedger, SqlDedupeStore};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

struct ClosingRule {
    ids: Vec<&'static str>,
}

#[async_trait]
impl Rule for ClosingRule {
    fn name(&self) -> &str {
        "stale-closer"
    }

    async fn collect(&self, _context: &RunContext) -> Result<RuleOutput, EngineError> {
        Ok(RuleOutput {
            items: self.ids.iter().map(|id| Item::new(*id)).collect(),
            autofix: AutofixChanges::Global(FieldChange::new().with("status", json!("RESOLVED"))),
            ..RuleOutput::default()
        })
    }
}

fn production_options() -> ContractResult<RunOptions> {
    let now = Utc
        .with_ymd_and_hms(2024, 3, 4, 8, 0, 0)
        .single()
        .ok_or_else(|| "invalid fixed timestamp".to_string())?;
    Ok(RunOptions::new(now).production())
}

fn applied(outcome: RunOutcome) -> ContractResult<Vec<ItemId>> {
    match outcome {
        RunOutcome::Complete(report) => Ok(report.apply.applied),
        RunOutcome::Aborted(signal) => Err(format!("run aborted: {}", signal.summary())),
    }
}

#[tokio::test]
async fn engine_state_survives_a_reopened_database() -> ContractResult {
    let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
    let url = format!("sqlite://{}", dir.path().join("autotriage.db").display());
    let ids = vec!["101", "102", "103"];
    let tracker = InMemoryTracker::with_items(ids.iter().map(|id| Item::new(*id)));
    let rule = ClosingRule { ids: ids.clone() };

    {
        let pool = connect(&url).await.map_err(|e| e.to_string())?;
        run_pending(&pool).await.map_err(|e| e.to_string())?;
        let engine = RunEngine::new(
            Arc::new(tracker.clone()),
            Arc::new(SqlChangeLedger::new(pool.clone())),
            Arc::new(SqlDedupeStore::new(pool.clone())),
        );

        let first = applied(
            engine
                .run(&rule, RuleSettings::default(), &production_options()?)
                .await
                .map_err(|e| e.to_string())?,
        )?;
        require_eq!(first.len(), 3);
        pool.close().await;
    }

    let pool = connect(&url).await.map_err(|e| e.to_string())?;
    run_pending(&pool).await.map_err(|e| e.to_string())?;

    let cached = SqlDedupeStore::new(pool.clone())
        .load("stale-closer")
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(cached.len(), 3);

    let ledger = SqlChangeLedger::new(pool.clone());
    let records = ledger.list_for_rule("stale-closer", 10).await.map_err(|e| e.to_string())?;
    require_eq!(records.len(), 3);
    require!(
        records.iter().all(|record| record.extra == "stale-closer"),
        "ledger extra should name the producing rule: {records:?}"
    );

    let engine = RunEngine::new(
        Arc::new(tracker.clone()),
        Arc::new(SqlChangeLedger::new(pool.clone())),
        Arc::new(SqlDedupeStore::new(pool.clone())),
    );
    let second = applied(
        engine
            .run(&rule, RuleSettings::default(), &production_options()?)
            .await
            .map_err(|e| e.to_string())?,
    )?;
    require!(second.is_empty(), "second run should skip cached items, applied {second:?}");
    require_eq!(tracker.mutations().len(), 3);

    Ok(())
}

#[tokio::test]
async fn dry_run_leaves_both_tables_untouched() -> ContractResult {
    let pool = connect("sqlite::memory:").await.map_err(|e| e.to_string())?;
    run_pending(&pool).await.map_err(|e| e.to_string())?;
    let tracker = InMemoryTracker::with_items([Item::new("7")]);
    let engine = RunEngine::new(
        Arc::new(tracker.clone()),
        Arc::new(SqlChangeLedger::new(pool.clone())),
        Arc::new(SqlDedupeStore::new(pool.clone())),
    );
    let now = Utc
        .with_ymd_and_hms(2024, 3, 4, 8, 0, 0)
        .single()
        .ok_or_else(|| "invalid fixed timestamp".to_string())?;

    let outcome = engine
        .run(&ClosingRule { ids: vec!["7"] }, RuleSettings::default(), &RunOptions::new(now))
        .await
        .map_err(|e| e.to_string())?;
    require!(!outcome.is_aborted(), "dry run should not abort");

    let ledger = SqlChangeLedger::new(pool.clone());
    require!(
        ledger.list_for_rule("stale-closer", 10).await.map_err(|e| e.to_string())?.is_empty(),
        "dry run must not write the ledger"
    );
    require!(
        SqlDedupeStore::new(pool).load("stale-closer").await.map_err(|e| e.to_string())?.is_empty(),
        "dry run must not write the cache"
    );
    require!(tracker.mutations().is_empty(), "dry run must not mutate the tracker");

    Ok(())
}
