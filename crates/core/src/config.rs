use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apply::ApplierConfig;
use crate::dedupe::CacheRetention;
use crate::errors::ConfigurationError;
use crate::quota::{Limit, NeedinfoPolicy, QuotaLimits};
use crate::run::RuleSettings;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub tracker: TrackerConfig,
    pub engine: EngineConfig,
    pub needinfo: NeedinfoConfig,
    pub rules: BTreeMap<String, RuleConfig>,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub base_url: String,
    pub api_key: SecretString,
    /// Account whose edits do not notify watchers.
    pub silent_api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub change_ceiling: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeedinfoConfig {
    pub skiplist: Vec<String>,
    pub no_owner_sentinels: Vec<String>,
    pub max_per_recipient: i64,
}

/// Per-rule knobs; `-1` means unlimited for the quota limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub max_actions: i64,
    pub max_needinfo: i64,
    pub exclude_no_action_items: bool,
    pub max_days_in_cache: i64,
    pub change_ceiling: Option<usize>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            max_actions: -1,
            max_needinfo: -1,
            exclude_no_action_items: false,
            max_days_in_cache: 7,
            change_ceiling: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub tracker_base_url: Option<String>,
    pub tracker_api_key: Option<String>,
    pub change_ceiling: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://autotriage.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            tracker: TrackerConfig {
                base_url: "https://bugzilla.mozilla.org".to_string(),
                api_key: String::new().into(),
                silent_api_key: None,
                timeout_secs: 30,
            },
            engine: EngineConfig { max_retries: 3, retry_delay_ms: 1_000, change_ceiling: 300 },
            needinfo: NeedinfoConfig {
                skiplist: Vec::new(),
                no_owner_sentinels: vec!["nobody@mozilla.org".to_string()],
                max_per_recipient: -1,
            },
            rules: BTreeMap::new(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("autotriage.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Limits for `rule_name`; a rule without a `[rules.<name>]` table runs with the defaults.
    pub fn rule_settings(&self, rule_name: &str) -> Result<RuleSettings, ConfigurationError> {
        let rule = self.rules.get(rule_name).cloned().unwrap_or_default();
        Ok(RuleSettings {
            limits: QuotaLimits::from_config(rule.max_needinfo, rule.max_actions)?,
            exclude_no_action_items: rule.exclude_no_action_items,
            cache_retention: CacheRetention::from_config(rule.max_days_in_cache)?,
            change_ceiling: rule.change_ceiling.unwrap_or(self.engine.change_ceiling),
        })
    }

    pub fn needinfo_policy(&self) -> Result<NeedinfoPolicy, ConfigurationError> {
        Ok(NeedinfoPolicy {
            skiplist: self.needinfo.skiplist.clone(),
            no_owner_sentinels: self.needinfo.no_owner_sentinels.clone(),
            max_per_recipient: Limit::from_config(
                "needinfo.max_per_recipient",
                self.needinfo.max_per_recipient,
            )?,
        })
    }

    pub fn applier_config(&self) -> ApplierConfig {
        ApplierConfig {
            max_retries: self.engine.max_retries,
            retry_delay: Duration::from_millis(self.engine.retry_delay_ms),
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(tracker) = patch.tracker {
            if let Some(base_url) = tracker.base_url {
                self.tracker.base_url = base_url;
            }
            if let Some(api_key) = tracker.api_key {
                self.tracker.api_key = secret_value(api_key);
            }
            if let Some(silent_api_key) = tracker.silent_api_key {
                self.tracker.silent_api_key = Some(secret_value(silent_api_key));
            }
            if let Some(timeout_secs) = tracker.timeout_secs {
                self.tracker.timeout_secs = timeout_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(max_retries) = engine.max_retries {
                self.engine.max_retries = max_retries;
            }
            if let Some(retry_delay_ms) = engine.retry_delay_ms {
                self.engine.retry_delay_ms = retry_delay_ms;
            }
            if let Some(change_ceiling) = engine.change_ceiling {
                self.engine.change_ceiling = change_ceiling;
            }
        }

        if let Some(needinfo) = patch.needinfo {
            if let Some(skiplist) = needinfo.skiplist {
                self.needinfo.skiplist = skiplist;
            }
            if let Some(sentinels) = needinfo.no_owner_sentinels {
                self.needinfo.no_owner_sentinels = sentinels;
            }
            if let Some(max_per_recipient) = needinfo.max_per_recipient {
                self.needinfo.max_per_recipient = max_per_recipient;
            }
        }

        for (name, rule) in patch.rules.unwrap_or_default() {
            let entry = self.rules.entry(name).or_default();
            if let Some(max_actions) = rule.max_actions {
                entry.max_actions = max_actions;
            }
            if let Some(max_needinfo) = rule.max_needinfo {
                entry.max_needinfo = max_needinfo;
            }
            if let Some(exclude) = rule.exclude_no_action_items {
                entry.exclude_no_action_items = exclude;
            }
            if let Some(max_days_in_cache) = rule.max_days_in_cache {
                entry.max_days_in_cache = max_days_in_cache;
            }
            if let Some(change_ceiling) = rule.change_ceiling {
                entry.change_ceiling = Some(change_ceiling);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("AUTOTRIAGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("AUTOTRIAGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("AUTOTRIAGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("AUTOTRIAGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("AUTOTRIAGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AUTOTRIAGE_TRACKER_BASE_URL") {
            self.tracker.base_url = value;
        }
        if let Some(value) = read_env("AUTOTRIAGE_TRACKER_API_KEY") {
            self.tracker.api_key = secret_value(value);
        }
        if let Some(value) = read_env("AUTOTRIAGE_TRACKER_SILENT_API_KEY") {
            self.tracker.silent_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AUTOTRIAGE_TRACKER_TIMEOUT_SECS") {
            self.tracker.timeout_secs = parse_u64("AUTOTRIAGE_TRACKER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AUTOTRIAGE_ENGINE_MAX_RETRIES") {
            self.engine.max_retries = parse_u32("AUTOTRIAGE_ENGINE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("AUTOTRIAGE_ENGINE_RETRY_DELAY_MS") {
            self.engine.retry_delay_ms = parse_u64("AUTOTRIAGE_ENGINE_RETRY_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("AUTOTRIAGE_ENGINE_CHANGE_CEILING") {
            self.engine.change_ceiling = parse_usize("AUTOTRIAGE_ENGINE_CHANGE_CEILING", &value)?;
        }

        if let Some(value) = read_env("AUTOTRIAGE_NEEDINFO_SKIPLIST") {
            self.needinfo.skiplist = split_list(&value);
        }
        if let Some(value) = read_env("AUTOTRIAGE_NEEDINFO_MAX_PER_RECIPIENT") {
            self.needinfo.max_per_recipient =
                parse_i64("AUTOTRIAGE_NEEDINFO_MAX_PER_RECIPIENT", &value)?;
        }

        let log_level =
            read_env("AUTOTRIAGE_LOGGING_LEVEL").or_else(|| read_env("AUTOTRIAGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("AUTOTRIAGE_LOGGING_FORMAT").or_else(|| read_env("AUTOTRIAGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(base_url) = overrides.tracker_base_url {
            self.tracker.base_url = base_url;
        }
        if let Some(api_key) = overrides.tracker_api_key {
            self.tracker.api_key = secret_value(api_key);
        }
        if let Some(change_ceiling) = overrides.change_ceiling {
            self.engine.change_ceiling = change_ceiling;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_tracker(&self.tracker)?;
        validate_engine(&self.engine)?;
        self.needinfo_policy().map_err(|error| ConfigError::Validation(error.to_string()))?;
        for name in self.rules.keys() {
            self.rule_settings(name).map_err(|error| {
                ConfigError::Validation(format!("rules.{name}: {error}"))
            })?;
        }
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Whether mutations can be authenticated. Searches work anonymously.
    pub fn has_tracker_credentials(&self) -> bool {
        !self.tracker.api_key.expose_secret().trim().is_empty()
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("autotriage.toml"), PathBuf::from("config/autotriage.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_tracker(tracker: &TrackerConfig) -> Result<(), ConfigError> {
    let base_url = tracker.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "tracker.base_url must start with http:// or https://".to_string(),
        ));
    }

    if tracker.timeout_secs == 0 || tracker.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "tracker.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    let silent_key_blank = tracker
        .silent_api_key
        .as_ref()
        .is_some_and(|value| value.expose_secret().trim().is_empty());
    if silent_key_blank {
        return Err(ConfigError::Validation(
            "tracker.silent_api_key is set but empty; remove it or provide the silent account key"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_retries == 0 {
        return Err(ConfigError::Validation(
            "engine.max_retries must be at least 1 (it counts the first attempt)".to_string(),
        ));
    }

    if engine.retry_delay_ms > 60_000 {
        return Err(ConfigError::Validation(
            "engine.retry_delay_ms must not exceed 60000".to_string(),
        ));
    }

    if engine.change_ceiling == 0 {
        return Err(ConfigError::Validation(
            "engine.change_ceiling must be greater than zero (use --no-limit to disable the guard)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    tracker: Option<TrackerPatch>,
    engine: Option<EnginePatch>,
    needinfo: Option<NeedinfoPatch>,
    rules: Option<BTreeMap<String, RulePatch>>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackerPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    silent_api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    change_ceiling: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct NeedinfoPatch {
    skiplist: Option<Vec<String>>,
    no_owner_sentinels: Option<Vec<String>>,
    max_per_recipient: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RulePatch {
    max_actions: Option<i64>,
    max_needinfo: Option<i64>,
    exclude_no_action_items: Option<bool>,
    max_days_in_cache: Option<i64>,
    change_ceiling: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
