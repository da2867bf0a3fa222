use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use autotriage_cli::commands::{config, ledger, migrate, run};
use serde_json::{json, Value};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("AUTOTRIAGE_DATABASE_URL", "postgres://localhost/autotriage")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn dry_run_reports_planned_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = write_plan(
        dir.path(),
        json!({
            "rules": [{
                "name": "stalled",
                "items": [{"id": "1"}, {"id": "2"}],
                "autofix": {"status": "RESOLVED"}
            }]
        }),
    );

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = run::run(&run::RunArgs::new(&plan));
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["details"]["dry_run"], true);
        let outcome = &payload["details"]["outcomes"][0];
        assert_eq!(outcome["outcome"], "complete");
        let planned = outcome["apply"]["planned"].as_object().expect("planned map");
        assert_eq!(planned.len(), 2);
        assert_eq!(planned["1"]["status"], "RESOLVED");
    });
}

#[test]
fn explicit_date_is_echoed_in_the_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = write_plan(dir.path(), json!({"rules": [{"name": "quiet"}]}));

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let mut args = run::RunArgs::new(&plan);
        args.date = "2024-02-29".parse().ok();
        let result = run::run(&args);
        assert_eq!(result.exit_code, 0, "unexpected output: {}", result.output);
        assert_eq!(parse_payload(&result.output)["details"]["date"], "2024-02-29");
    });
}

#[test]
fn production_run_requires_an_api_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = write_plan(dir.path(), json!({"rules": [{"name": "stalled"}]}));

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let mut args = run::RunArgs::new(&plan);
        args.production = true;
        let result = run::run(&args);
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
    });
}

#[test]
fn production_run_over_the_ceiling_aborts_without_applying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("autotriage.db");
    let db_url = format!("sqlite://{}", db_path.display());
    let plan = write_plan(
        dir.path(),
        json!({
            "rules": [{
                "name": "stalled",
                "items": [{"id": "1"}, {"id": "2"}, {"id": "3"}],
                "autofix": {"status": "RESOLVED"}
            }]
        }),
    );

    with_env(
        &[
            ("AUTOTRIAGE_DATABASE_URL", db_url.as_str()),
            ("AUTOTRIAGE_TRACKER_API_KEY", "test-key"),
            ("AUTOTRIAGE_ENGINE_CHANGE_CEILING", "2"),
        ],
        || {
            let mut args = run::RunArgs::new(&plan);
            args.production = true;
            let result = run::run(&args);
            assert_eq!(result.exit_code, 6, "expected abort exit code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["error_class"], "aborted");
            let outcome = &payload["details"]["outcomes"][0];
            assert_eq!(outcome["outcome"], "aborted");
            assert_eq!(outcome["ceiling"], 2);
            assert_eq!(outcome["items"].as_array().map(Vec::len), Some(3));

            let listed = ledger::run("stalled", 10);
            assert_eq!(listed.exit_code, 0);
            let records = parse_payload(&listed.output)["details"]["records"].clone();
            assert_eq!(records, json!([]), "aborted runs must not reach the ledger");
        },
    );
}

#[test]
fn compose_without_merge_function_fails_before_applying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let comment_fix = |body: &str| json!({"5": {"comment": {"body": body}}});
    let plan = write_plan(
        dir.path(),
        json!({
            "rules": [
                {"name": "rule-a", "items": [{"id": "5"}], "autofix": comment_fix("from a")},
                {"name": "rule-b", "items": [{"id": "5"}], "autofix": comment_fix("from b")}
            ]
        }),
    );

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let mut args = run::RunArgs::new(&plan);
        args.compose = true;
        let result = run::run(&args);
        assert_eq!(result.exit_code, 8, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "configuration");
        assert!(payload["message"].as_str().unwrap_or_default().contains("comment"));
    });
}

#[test]
fn failing_rule_keeps_earlier_outcomes_in_the_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let priority_fix = |bucket: &str, value: &str| {
        json!({"bucket": bucket, "importance": 1, "action": {"item_id": "9", "autofix": {"priority": value}}})
    };
    let plan = write_plan(
        dir.path(),
        json!({
            "rules": [
                {"name": "stalled", "items": [{"id": "1"}], "autofix": {"status": "RESOLVED"}},
                {"name": "conflicted", "candidates": [priority_fix("team-a", "P1"), priority_fix("team-b", "P2")]}
            ]
        }),
    );

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = run::run(&run::RunArgs::new(&plan));
        assert_eq!(result.exit_code, 8, "unexpected output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "invariant_violation");
        let outcomes = payload["details"]["outcomes"].as_array().expect("outcomes");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0]["outcome"], "complete");
        assert_eq!(outcomes[0]["apply"]["planned"]["1"]["status"], "RESOLVED");
        let failures = payload["details"]["failures"].as_array().expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["rule_name"], "conflicted");
    });
}

#[test]
fn invalid_plan_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = dir.path().join("missing.json");

    with_env(&[("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = run::run(&run::RunArgs::new(&plan));
        assert_eq!(result.exit_code, 7);
        assert_eq!(parse_payload(&result.output)["error_class"], "plan");
    });
}

#[test]
fn config_output_redacts_tracker_keys() {
    with_env(
        &[
            ("AUTOTRIAGE_DATABASE_URL", "sqlite::memory:"),
            ("AUTOTRIAGE_TRACKER_API_KEY", "abcd1234efgh5678"),
        ],
        || {
            let output = config::run();
            assert!(output.contains("- tracker.api_key = abcd*** (source: env (AUTOTRIAGE_TRACKER_API_KEY))"));
            assert!(!output.contains("abcd1234efgh5678"));
            assert!(output.contains("- engine.change_ceiling = 300 (source: default)"));
        },
    );
}

fn write_plan(dir: &Path, plan: Value) -> PathBuf {
    let path = dir.join("plan.json");
    fs::write(&path, plan.to_string()).expect("write plan");
    path
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    let keys = [
        "AUTOTRIAGE_DATABASE_URL",
        "AUTOTRIAGE_DATABASE_MAX_CONNECTIONS",
        "AUTOTRIAGE_DATABASE_TIMEOUT_SECS",
        "AUTOTRIAGE_TRACKER_BASE_URL",
        "AUTOTRIAGE_TRACKER_API_KEY",
        "AUTOTRIAGE_TRACKER_SILENT_API_KEY",
        "AUTOTRIAGE_TRACKER_TIMEOUT_SECS",
        "AUTOTRIAGE_ENGINE_MAX_RETRIES",
        "AUTOTRIAGE_ENGINE_RETRY_DELAY_MS",
        "AUTOTRIAGE_ENGINE_CHANGE_CEILING",
        "AUTOTRIAGE_NEEDINFO_SKIPLIST",
        "AUTOTRIAGE_NEEDINFO_MAX_PER_RECIPIENT",
        "AUTOTRIAGE_LOGGING_LEVEL",
        "AUTOTRIAGE_LOGGING_FORMAT",
        "AUTOTRIAGE_LOG_LEVEL",
        "AUTOTRIAGE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
