use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use autotriage_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", Some("AUTOTRIAGE_DATABASE_URL")),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", Some("AUTOTRIAGE_DATABASE_MAX_CONNECTIONS")),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", Some("AUTOTRIAGE_DATABASE_TIMEOUT_SECS")),
    ));

    lines.push(render_line(
        "tracker.base_url",
        &config.tracker.base_url,
        source("tracker.base_url", Some("AUTOTRIAGE_TRACKER_BASE_URL")),
    ));
    lines.push(render_line(
        "tracker.api_key",
        &redact_key(config.tracker.api_key.expose_secret()),
        source("tracker.api_key", Some("AUTOTRIAGE_TRACKER_API_KEY")),
    ));
    let silent_key = match &config.tracker.silent_api_key {
        Some(key) => redact_key(key.expose_secret()),
        None => "<unset>".to_string(),
    };
    lines.push(render_line(
        "tracker.silent_api_key",
        &silent_key,
        source("tracker.silent_api_key", Some("AUTOTRIAGE_TRACKER_SILENT_API_KEY")),
    ));
    lines.push(render_line(
        "tracker.timeout_secs",
        &config.tracker.timeout_secs.to_string(),
        source("tracker.timeout_secs", Some("AUTOTRIAGE_TRACKER_TIMEOUT_SECS")),
    ));

    lines.push(render_line(
        "engine.max_retries",
        &config.engine.max_retries.to_string(),
        source("engine.max_retries", Some("AUTOTRIAGE_ENGINE_MAX_RETRIES")),
    ));
    lines.push(render_line(
        "engine.retry_delay_ms",
        &config.engine.retry_delay_ms.to_string(),
        source("engine.retry_delay_ms", Some("AUTOTRIAGE_ENGINE_RETRY_DELAY_MS")),
    ));
    lines.push(render_line(
        "engine.change_ceiling",
        &config.engine.change_ceiling.to_string(),
        source("engine.change_ceiling", Some("AUTOTRIAGE_ENGINE_CHANGE_CEILING")),
    ));

    lines.push(render_line(
        "needinfo.skiplist",
        &render_list(&config.needinfo.skiplist),
        source("needinfo.skiplist", Some("AUTOTRIAGE_NEEDINFO_SKIPLIST")),
    ));
    lines.push(render_line(
        "needinfo.no_owner_sentinels",
        &render_list(&config.needinfo.no_owner_sentinels),
        source("needinfo.no_owner_sentinels", None),
    ));
    lines.push(render_line(
        "needinfo.max_per_recipient",
        &config.needinfo.max_per_recipient.to_string(),
        source("needinfo.max_per_recipient", Some("AUTOTRIAGE_NEEDINFO_MAX_PER_RECIPIENT")),
    ));

    for (name, rule) in &config.rules {
        let key = format!("rules.{name}");
        let ceiling = rule
            .change_ceiling
            .map(|ceiling| ceiling.to_string())
            .unwrap_or_else(|| format!("{} (engine)", config.engine.change_ceiling));
        let value = format!(
            "max_actions={} max_needinfo={} exclude_no_action_items={} max_days_in_cache={} change_ceiling={ceiling}",
            rule.max_actions, rule.max_needinfo, rule.exclude_no_action_items, rule.max_days_in_cache
        );
        lines.push(render_line(&key, &value, source(&key, None)));
    }

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", Some("AUTOTRIAGE_LOGGING_LEVEL")),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", Some("AUTOTRIAGE_LOGGING_FORMAT")),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["autotriage.toml", "config/autotriage.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn render_list(values: &[String]) -> String {
    if values.is_empty() {
        return "[]".to_string();
    }
    format!("[{}]", values.join(", "))
}

fn redact_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let visible: String = trimmed.chars().take(4).collect();
    if trimmed.chars().count() > 8 {
        return format!("{visible}***");
    }

    "<redacted>".to_string()
}
