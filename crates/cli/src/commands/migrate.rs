use crate::commands::{current_thread_runtime, CommandResult};
use crate::logging;
use autotriage_core::config::{AppConfig, LoadOptions};
use autotriage_db::{connect_with_config, migrations};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
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
                "migrate",
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
        let versions = migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        pool.close().await;
        Ok::<Vec<i64>, (&'static str, String, u8)>(versions)
    });

    match result {
        Ok(versions) => CommandResult::success(
            "migrate",
            format!("applied pending migrations (schema versions: {versions:?})"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
