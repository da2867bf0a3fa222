use serde_json::json;

use crate::commands::{current_thread_runtime, CommandResult};
use crate::logging;
use autotriage_core::config::{AppConfig, LoadOptions};
use autotriage_db::{connect_with_config, migrations, ChangeLedgerRepository, SqlChangeLedger};

pub fn run(rule_name: &str, limit: u32) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ledger",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    logging::init(&config.logging);

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "ledger",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let records = SqlChangeLedger::new(pool.clone())
            .list_for_rule(rule_name, limit)
            .await
            .map_err(|error| ("repository", error.to_string(), 8u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(records)
    });

    match result {
        Ok(records) => CommandResult::success_with_details(
            "ledger",
            format!("{} record(s) for rule `{rule_name}`", records.len()),
            Some(json!({ "records": records })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ledger", error_class, message, exit_code)
        }
    }
}
