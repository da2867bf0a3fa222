//! Pushes guarded change sets to the tracker.
//!
//! Items are applied one after another. Each item gets its own attempt budget
//! and a failed item never blocks or rolls back the others. Successful
//! mutations are appended to the change ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audit::{ChangeLedger, LedgerRecord};
use crate::domain::change::FieldChange;
use crate::domain::item::ItemId;
use crate::errors::TransientApplyError;
use crate::guard::GuardedChangeSet;
use crate::tracker::{Account, Tracker};

#[derive(Clone, Debug)]
pub struct ApplierConfig {
    /// Attempts per item, including the first one
    pub max_retries: u32,
    /// Fixed pause between two attempts on the same item
    pub retry_delay: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay: Duration::from_secs(1) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub account: Account,
    pub dry_run: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedChange {
    pub item_id: ItemId,
    pub attempts: u32,
    pub error: String,
    pub payload: FieldChange,
}

impl From<&FailedChange> for TransientApplyError {
    fn from(value: &FailedChange) -> Self {
        Self {
            item_id: value.item_id.clone(),
            attempts: value.attempts,
            message: value.error.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub rule_name: String,
    pub dry_run: bool,
    pub applied: Vec<ItemId>,
    pub failed: Vec<FailedChange>,
    /// Changes that would have been sent, filled in dry run only.
    pub planned: BTreeMap<ItemId, FieldChange>,
}

impl ApplyReport {
    pub fn failure_errors(&self) -> Vec<TransientApplyError> {
        self.failed.iter().map(TransientApplyError::from).collect()
    }
}

pub struct ChangeApplier {
    tracker: Arc<dyn Tracker>,
    ledger: Arc<dyn ChangeLedger>,
    config: ApplierConfig,
}

impl ChangeApplier {
    pub fn new(tracker: Arc<dyn Tracker>, ledger: Arc<dyn ChangeLedger>) -> Self {
        Self::with_config(tracker, ledger, ApplierConfig::default())
    }

    pub fn with_config(
        tracker: Arc<dyn Tracker>,
        ledger: Arc<dyn ChangeLedger>,
        config: ApplierConfig,
    ) -> Self {
        Self { tracker, ledger, config }
    }

    pub async fn apply(
        &self,
        guarded: &GuardedChangeSet,
        options: ApplyOptions,
        audit_extra: &BTreeMap<ItemId, String>,
    ) -> ApplyReport {
        let rule_name = guarded.rule_name();
        let mut report = ApplyReport {
            rule_name: rule_name.to_string(),
            dry_run: options.dry_run,
            ..ApplyReport::default()
        };

        if options.dry_run {
            for (item_id, change) in guarded.changes().iter() {
                info!(
                    event_name = "engine.apply.dry_run",
                    rule_name,
                    item_id = %item_id,
                    change = %serde_json::to_string(change).unwrap_or_default(),
                    "dry run: change not sent"
                );
                report.planned.insert(item_id.clone(), change.clone());
            }
            return report;
        }

        for (item_id, change) in guarded.changes().iter() {
            match self.apply_one(rule_name, item_id, change, options.account).await {
                Ok(()) => {
                    let extra = audit_extra.get(item_id).cloned().unwrap_or_default();
                    if let Err(ledger_error) =
                        self.ledger.append(LedgerRecord::new(rule_name, item_id.clone(), extra)).await
                    {
                        warn!(
                            event_name = "engine.apply.ledger_failed",
                            rule_name,
                            item_id = %item_id,
                            error = %ledger_error,
                            "change applied but could not be recorded in the ledger"
                        );
                    }
                    report.applied.push(item_id.clone());
                }
                Err(failed) => report.failed.push(failed),
            }
        }

        info!(
            event_name = "engine.apply.finished",
            rule_name,
            applied = report.applied.len(),
            failed = report.failed.len(),
            "change application finished"
        );
        report
    }

    async fn apply_one(
        &self,
        rule_name: &str,
        item_id: &ItemId,
        change: &FieldChange,
        account: Account,
    ) -> Result<(), FailedChange> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let tracker_error = match self.tracker.mutate(item_id, change, account).await {
                Ok(()) => return Ok(()),
                Err(tracker_error) => tracker_error,
            };

            if attempt >= max_attempts || !tracker_error.is_transient() {
                error!(
                    event_name = "engine.apply.item_failed",
                    rule_name,
                    item_id = %item_id,
                    attempts = attempt,
                    error = %tracker_error,
                    payload = %serde_json::to_string(change).unwrap_or_default(),
                    "could not apply change; continuing with the next item"
                );
                return Err(FailedChange {
                    item_id: item_id.clone(),
                    attempts: attempt,
                    error: tracker_error.to_string(),
                    payload: change.clone(),
                });
            }

            warn!(
                event_name = "engine.apply.retry",
                rule_name,
                item_id = %item_id,
                attempt,
                max_attempts,
                error = %tracker_error,
                "change rejected; retrying"
            );
            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
    }
}
