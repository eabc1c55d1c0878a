use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::{AppConfig, LoadOptions};
use concierge_core::Tier;
use secrecy::ExposeSecret;
use toml::Value;

/// One effective setting and the environment variable that can override it.
struct Setting {
    key: String,
    env_key: Option<String>,
    value: String,
}

impl Setting {
    fn new(key: &str, env_key: &str, value: impl ToString) -> Self {
        Self { key: key.to_string(), env_key: Some(env_key.to_string()), value: value.to_string() }
    }

    fn file_only(key: &str, value: impl ToString) -> Self {
        Self { key: key.to_string(), env_key: None, value: value.to_string() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(&setting, file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }
    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_secret(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let mut settings = vec![
        Setting::new("database.url", "CONCIERGE_DATABASE_URL", &config.database.url),
        Setting::new(
            "database.max_connections",
            "CONCIERGE_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
        ),
        Setting::new(
            "database.timeout_secs",
            "CONCIERGE_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs,
        ),
        Setting::new(
            "llm.provider",
            "CONCIERGE_LLM_PROVIDER",
            format!("{:?}", config.llm.provider),
        ),
        Setting::new("llm.model", "CONCIERGE_LLM_MODEL", &config.llm.model),
        Setting::new(
            "llm.base_url",
            "CONCIERGE_LLM_BASE_URL",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Setting::new("llm.api_key", "CONCIERGE_LLM_API_KEY", api_key),
        Setting::new("llm.timeout_secs", "CONCIERGE_LLM_TIMEOUT_SECS", config.llm.timeout_secs),
        Setting::new("llm.max_retries", "CONCIERGE_LLM_MAX_RETRIES", config.llm.max_retries),
        Setting::new("llm.temperature", "CONCIERGE_LLM_TEMPERATURE", config.llm.temperature),
        Setting::new(
            "server.bind_address",
            "CONCIERGE_SERVER_BIND_ADDRESS",
            &config.server.bind_address,
        ),
        Setting::new("server.port", "CONCIERGE_SERVER_PORT", config.server.port),
        Setting::new(
            "server.graceful_shutdown_secs",
            "CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs,
        ),
        Setting::file_only("server.idle_sweep_secs", config.server.idle_sweep_secs),
        Setting::new(
            "routing.company_name",
            "CONCIERGE_ROUTING_COMPANY_NAME",
            &config.routing.company_name,
        ),
        Setting::new(
            "routing.escalation_threshold",
            "CONCIERGE_ROUTING_ESCALATION_THRESHOLD",
            config.routing.escalation_threshold,
        ),
        Setting::new(
            "routing.sentiment_alpha",
            "CONCIERGE_ROUTING_SENTIMENT_ALPHA",
            config.routing.sentiment_alpha,
        ),
        Setting::new(
            "routing.negative_score_floor",
            "CONCIERGE_ROUTING_NEGATIVE_SCORE_FLOOR",
            config.routing.negative_score_floor,
        ),
        Setting::file_only("routing.negative_streak_limit", config.routing.negative_streak_limit),
        Setting::new("routing.max_turns", "CONCIERGE_ROUTING_MAX_TURNS", config.routing.max_turns),
        Setting::new(
            "routing.turn_timeout_secs",
            "CONCIERGE_ROUTING_TURN_TIMEOUT_SECS",
            config.routing.turn_timeout_secs,
        ),
        Setting::new(
            "routing.inactivity_timeout_secs",
            "CONCIERGE_ROUTING_INACTIVITY_TIMEOUT_SECS",
            config.routing.inactivity_timeout_secs,
        ),
        Setting::file_only("routing.max_message_chars", config.routing.max_message_chars),
        Setting::file_only("routing.min_confidence", config.routing.min_confidence),
        Setting::file_only("routing.priority_queue", &config.routing.priority_queue),
        Setting::file_only("routing.standard_queue", &config.routing.standard_queue),
        Setting::file_only("routing.handoff_keywords", config.routing.handoff_keywords.join(", ")),
        Setting::new(
            "rate_limits.enabled",
            "CONCIERGE_RATE_LIMITS_ENABLED",
            config.rate_limits.enabled,
        ),
    ];

    for tier in Tier::ALL {
        let bucket = config.rate_limits.tiers.for_tier(tier);
        let prefix = format!("CONCIERGE_RATE_LIMITS_{}", tier.as_str().to_ascii_uppercase());
        settings.push(Setting::new(
            &format!("rate_limits.{tier}.capacity"),
            &format!("{prefix}_CAPACITY"),
            bucket.capacity,
        ));
        settings.push(Setting::new(
            &format!("rate_limits.{tier}.refill_per_sec"),
            &format!("{prefix}_REFILL_PER_SEC"),
            bucket.refill_per_sec,
        ));
        let hourly = config.rate_limits.hourly.for_tier(tier);
        settings.push(Setting::new(
            &format!("rate_limits.hourly.{tier}.capacity"),
            &format!("{prefix}_HOURLY_CAPACITY"),
            hourly.capacity,
        ));
        settings.push(Setting::new(
            &format!("rate_limits.hourly.{tier}.refill_per_sec"),
            &format!("{prefix}_HOURLY_REFILL_PER_SEC"),
            hourly.refill_per_sec,
        ));
    }

    settings.push(Setting::new("logging.level", "CONCIERGE_LOGGING_LEVEL", &config.logging.level));
    settings.push(Setting::new(
        "logging.format",
        "CONCIERGE_LOGGING_FORMAT",
        format!("{:?}", config.logging.format),
    ));
    settings
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(setting: &Setting, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = setting.env_key.as_deref() {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if file_doc.is_some_and(|doc| contains_path(doc, &setting.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
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

/// Keeps a short vendor prefix such as `sk-` and hides the rest.
pub(crate) fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}
