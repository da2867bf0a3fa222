use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::commands::{current_thread_runtime, CommandResult};
use crate::logging;
use crate::plan::Plan;
use autotriage_core::config::{AppConfig, LoadOptions};
use autotriage_core::{LimitMode, Rule, RuleSettings, RunEngine, RunOptions, RunOutcome};
use autotriage_db::{connect_with_config, migrations, SqlChangeLedger, SqlDedupeStore};
use autotriage_tracker::RestTracker;

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(long, help = "JSON plan file produced by the rule scripts")]
    pub plan: PathBuf,
    #[arg(long, help = "Apply changes to the tracker instead of reporting them")]
    pub production: bool,
    #[arg(long, help = "Skip the change ceiling guard")]
    pub no_limit: bool,
    #[arg(short = 'D', long, help = "Run date (YYYY-MM-DD), defaults to today")]
    pub date: Option<NaiveDate>,
    #[arg(long, help = "Merge every rule of the plan and apply them in one pass")]
    pub compose: bool,
}

impl RunArgs {
    pub fn new(plan: impl Into<PathBuf>) -> Self {
        Self { plan: plan.into(), production: false, no_limit: false, date: None, compose: false }
    }

    fn options(&self) -> RunOptions {
        let mut options = RunOptions::new(Utc::now());
        if self.production {
            options = options.production();
        }
        if self.no_limit {
            options.limit_mode = LimitMode::Unlimited;
        }
        if let Some(date) = self.date {
            options.date = date;
        }
        options
    }
}

type Failure = (&'static str, String, u8);

pub fn run(args: &RunArgs) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "run",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    logging::init(&config.logging);

    if args.production && !config.has_tracker_credentials() {
        return CommandResult::failure(
            "run",
            "config_validation",
            "production runs need tracker.api_key (AUTOTRIAGE_TRACKER_API_KEY)",
            2,
        );
    }

    let plan = match Plan::from_path(&args.plan) {
        Ok(plan) => plan,
        Err(error) => return CommandResult::failure("run", "plan", format!("{error:#}"), 7),
    };

    let prepared = config
        .needinfo_policy()
        .map_err(|error| ("configuration", error.to_string(), 2u8))
        .and_then(|policy| {
            RestTracker::from_config(&config.tracker)
                .map(|tracker| (policy, tracker))
                .map_err(|error| ("tracker_config", error.to_string(), 2u8))
        });
    let (needinfo_policy, tracker) = match prepared {
        Ok(prepared) => prepared,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("run", error_class, message, exit_code);
        }
    };

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "run",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let options = args.options();
    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let engine = RunEngine::new(
            Arc::new(tracker),
            Arc::new(SqlChangeLedger::new(pool.clone())),
            Arc::new(SqlDedupeStore::new(pool.clone())),
        )
        .with_needinfo_policy(needinfo_policy)
        .with_applier_config(config.applier_config());

        let executed = execute(&engine, &config, &plan, args.compose, &options).await;
        pool.close().await;
        executed
    });

    match result {
        Ok(executed) => report(&executed, &options),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("run", error_class, message, exit_code)
        }
    }
}

/// A rule that failed while the other rules of the plan kept running.
#[derive(Debug, Serialize)]
struct RuleFailure {
    rule_name: String,
    error_class: &'static str,
    message: String,
}

#[derive(Debug, Default)]
struct Executed {
    outcomes: Vec<RunOutcome>,
    failures: Vec<RuleFailure>,
}

async fn execute(
    engine: &RunEngine,
    config: &AppConfig,
    plan: &Plan,
    compose: bool,
    options: &RunOptions,
) -> Result<Executed, Failure> {
    let mut rules: Vec<(&dyn Rule, RuleSettings)> = Vec::with_capacity(plan.rules().len());
    for rule in plan.rules() {
        let settings = config
            .rule_settings(rule.name())
            .map_err(|error| ("configuration", format!("rules.{}: {error}", rule.name()), 2u8))?;
        rules.push((rule as &dyn Rule, settings));
    }

    if compose {
        let ceiling = plan.compose_change_ceiling().unwrap_or(config.engine.change_ceiling);
        let outcome = engine
            .compose(plan.compose_name(), &rules, &plan.merger(), ceiling, options)
            .await
            .map_err(|error| (error.class(), error.to_string(), 8u8))?;
        return Ok(Executed { outcomes: vec![outcome], failures: Vec::new() });
    }

    let mut executed = Executed::default();
    for (rule, settings) in rules {
        match engine.run(rule, settings, options).await {
            Ok(outcome) => {
                if let RunOutcome::Aborted(signal) = &outcome {
                    warn!(
                        event_name = "cli.run.rule_aborted",
                        rule_name = rule.name(),
                        changes = signal.proposed(),
                        "rule aborted, continuing with the next one"
                    );
                }
                executed.outcomes.push(outcome);
            }
            Err(error) => {
                warn!(
                    event_name = "cli.run.rule_failed",
                    rule_name = rule.name(),
                    error_class = error.class(),
                    error = %error,
                    "rule failed, continuing with the next one"
                );
                executed.failures.push(RuleFailure {
                    rule_name: rule.name().to_string(),
                    error_class: error.class(),
                    message: error.to_string(),
                });
            }
        }
    }
    Ok(executed)
}

fn report(executed: &Executed, options: &RunOptions) -> CommandResult {
    let Executed { outcomes, failures } = executed;
    let details = Some(json!({
        "dry_run": options.dry_run,
        "date": options.date.to_string(),
        "outcomes": outcomes,
        "failures": failures,
    }));

    if !failures.is_empty() {
        let message = failures
            .iter()
            .map(|failure| format!("rule `{}`: {}", failure.rule_name, failure.message))
            .collect::<Vec<_>>()
            .join("; ");
        let error_class = match failures.as_slice() {
            [only] => only.error_class,
            _ => "rules_failed",
        };
        return CommandResult::failure_with_details("run", error_class, message, 8, details);
    }

    let aborted: Vec<String> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            RunOutcome::Aborted(signal) => Some(signal.summary()),
            RunOutcome::Complete(_) => None,
        })
        .collect();
    if !aborted.is_empty() {
        return CommandResult::failure_with_details("run", "aborted", aborted.join("; "), 6, details);
    }

    let (applied, failed, planned) =
        outcomes.iter().fold((0, 0, 0), |(applied, failed, planned), outcome| match outcome {
            RunOutcome::Complete(report) => (
                applied + report.apply.applied.len(),
                failed + report.apply.failed.len(),
                planned + report.apply.planned.len(),
            ),
            RunOutcome::Aborted(_) => (applied, failed, planned),
        });

    info!(
        event_name = "cli.run.completed",
        runs = outcomes.len(),
        applied,
        failed,
        planned,
        dry_run = options.dry_run,
        "run command completed"
    );

    let message = if options.dry_run {
        format!("dry run: {planned} change(s) planned across {} run(s)", outcomes.len())
    } else {
        format!("{applied} change(s) applied, {failed} failed across {} run(s)", outcomes.len())
    };
    CommandResult::success_with_details("run", message, details)
}
