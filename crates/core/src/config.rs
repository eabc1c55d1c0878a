use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tier::Tier;
use crate::rate_limit::{BucketConfig, TierLimits};
use crate::sentiment::{SentimentPolicy, DEFAULT_ALPHA};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub rate_limits: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub idle_sweep_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub company_name: String,
    pub sentiment_alpha: f64,
    /// Scores strictly below this extend the negative streak.
    pub negative_score_floor: f64,
    pub escalation_threshold: f64,
    pub negative_streak_limit: u32,
    pub max_turns: u32,
    pub turn_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub max_message_chars: usize,
    pub min_confidence: f64,
    pub priority_queue: String,
    pub standard_queue: String,
    pub handoff_keywords: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Per-minute buckets.
    pub tiers: TierLimits,
    pub hourly: TierLimits,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
    Offline,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub rate_limits_enabled: Option<bool>,
    pub escalation_threshold: Option<f64>,
    pub max_turns: Option<u32>,
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

pub const DEFAULT_HANDOFF_KEYWORDS: &[&str] = &[
    "human",
    "real person",
    "representative",
    "speak to an agent",
    "talk to an agent",
    "live agent",
    "manager",
    "supervisor",
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Offline,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                temperature: 0.7,
                top_p: 0.8,
                top_k: 40,
                max_tokens: 1024,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                idle_sweep_secs: 60,
            },
            routing: RoutingConfig {
                company_name: "ChromaPages".to_string(),
                sentiment_alpha: DEFAULT_ALPHA,
                negative_score_floor: 0.0,
                escalation_threshold: -0.5,
                negative_streak_limit: 2,
                max_turns: 20,
                turn_timeout_secs: 20,
                inactivity_timeout_secs: 30 * 60,
                max_message_chars: 1000,
                min_confidence: 0.4,
                priority_queue: "priority".to_string(),
                standard_queue: "standard".to_string(),
                handoff_keywords: DEFAULT_HANDOFF_KEYWORDS
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
            rate_limits: RateLimitConfig {
                enabled: true,
                tiers: TierLimits::default(),
                hourly: TierLimits::hourly(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl RoutingConfig {
    pub fn sentiment_policy(&self) -> SentimentPolicy {
        SentimentPolicy {
            alpha: self.sentiment_alpha,
            negative_score_floor: self.negative_score_floor,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "offline" => Ok(Self::Offline),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama|offline)"
            ))),
        }
    }
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
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

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(top_p) = llm.top_p {
                self.llm.top_p = top_p;
            }
            if let Some(top_k) = llm.top_k {
                self.llm.top_k = top_k;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(idle_sweep_secs) = server.idle_sweep_secs {
                self.server.idle_sweep_secs = idle_sweep_secs;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(company_name) = routing.company_name {
                self.routing.company_name = company_name;
            }
            if let Some(sentiment_alpha) = routing.sentiment_alpha {
                self.routing.sentiment_alpha = sentiment_alpha;
            }
            if let Some(negative_score_floor) = routing.negative_score_floor {
                self.routing.negative_score_floor = negative_score_floor;
            }
            if let Some(escalation_threshold) = routing.escalation_threshold {
                self.routing.escalation_threshold = escalation_threshold;
            }
            if let Some(negative_streak_limit) = routing.negative_streak_limit {
                self.routing.negative_streak_limit = negative_streak_limit;
            }
            if let Some(max_turns) = routing.max_turns {
                self.routing.max_turns = max_turns;
            }
            if let Some(turn_timeout_secs) = routing.turn_timeout_secs {
                self.routing.turn_timeout_secs = turn_timeout_secs;
            }
            if let Some(inactivity_timeout_secs) = routing.inactivity_timeout_secs {
                self.routing.inactivity_timeout_secs = inactivity_timeout_secs;
            }
            if let Some(max_message_chars) = routing.max_message_chars {
                self.routing.max_message_chars = max_message_chars;
            }
            if let Some(min_confidence) = routing.min_confidence {
                self.routing.min_confidence = min_confidence;
            }
            if let Some(priority_queue) = routing.priority_queue {
                self.routing.priority_queue = priority_queue;
            }
            if let Some(standard_queue) = routing.standard_queue {
                self.routing.standard_queue = standard_queue;
            }
            if let Some(handoff_keywords) = routing.handoff_keywords {
                self.routing.handoff_keywords = handoff_keywords;
            }
        }

        if let Some(rate_limits) = patch.rate_limits {
            if let Some(enabled) = rate_limits.enabled {
                self.rate_limits.enabled = enabled;
            }
            apply_bucket_patch(&mut self.rate_limits.tiers.free, rate_limits.free);
            apply_bucket_patch(&mut self.rate_limits.tiers.pro, rate_limits.pro);
            apply_bucket_patch(&mut self.rate_limits.tiers.enterprise, rate_limits.enterprise);
            if let Some(hourly) = rate_limits.hourly {
                apply_bucket_patch(&mut self.rate_limits.hourly.free, hourly.free);
                apply_bucket_patch(&mut self.rate_limits.hourly.pro, hourly.pro);
                apply_bucket_patch(&mut self.rate_limits.hourly.enterprise, hourly.enterprise);
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
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_value("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_value("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_value("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_value("CONCIERGE_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TEMPERATURE") {
            self.llm.temperature = parse_value("CONCIERGE_LLM_TEMPERATURE", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_PORT") {
            self.server.port = parse_value("CONCIERGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_value("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_ROUTING_COMPANY_NAME") {
            self.routing.company_name = value;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_ESCALATION_THRESHOLD") {
            self.routing.escalation_threshold =
                parse_value("CONCIERGE_ROUTING_ESCALATION_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_SENTIMENT_ALPHA") {
            self.routing.sentiment_alpha =
                parse_value("CONCIERGE_ROUTING_SENTIMENT_ALPHA", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_NEGATIVE_SCORE_FLOOR") {
            self.routing.negative_score_floor =
                parse_value("CONCIERGE_ROUTING_NEGATIVE_SCORE_FLOOR", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_MAX_TURNS") {
            self.routing.max_turns = parse_value("CONCIERGE_ROUTING_MAX_TURNS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_TURN_TIMEOUT_SECS") {
            self.routing.turn_timeout_secs =
                parse_value("CONCIERGE_ROUTING_TURN_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTING_INACTIVITY_TIMEOUT_SECS") {
            self.routing.inactivity_timeout_secs =
                parse_value("CONCIERGE_ROUTING_INACTIVITY_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_RATE_LIMITS_ENABLED") {
            self.rate_limits.enabled = parse_value("CONCIERGE_RATE_LIMITS_ENABLED", &value)?;
        }
        for tier in Tier::ALL {
            let prefix = format!("CONCIERGE_RATE_LIMITS_{}", tier.as_str().to_ascii_uppercase());
            let bucket = tier_bucket_mut(&mut self.rate_limits.tiers, tier);
            apply_bucket_env(bucket, &prefix)?;
            let bucket = tier_bucket_mut(&mut self.rate_limits.hourly, tier);
            apply_bucket_env(bucket, &format!("{prefix}_HOURLY"))?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.rate_limits_enabled {
            self.rate_limits.enabled = enabled;
        }
        if let Some(threshold) = overrides.escalation_threshold {
            self.routing.escalation_threshold = threshold;
        }
        if let Some(max_turns) = overrides.max_turns {
            self.routing.max_turns = max_turns;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_routing(&self.routing)?;
        validate_rate_limits(&self.rate_limits)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn apply_bucket_patch(bucket: &mut BucketConfig, patch: Option<BucketPatch>) {
    let Some(patch) = patch else {
        return;
    };
    if let Some(capacity) = patch.capacity {
        bucket.capacity = capacity;
    }
    if let Some(refill_per_sec) = patch.refill_per_sec {
        bucket.refill_per_sec = refill_per_sec;
    }
}

fn apply_bucket_env(bucket: &mut BucketConfig, prefix: &str) -> Result<(), ConfigError> {
    let capacity_key = format!("{prefix}_CAPACITY");
    if let Some(value) = read_env(&capacity_key) {
        bucket.capacity = parse_value(&capacity_key, &value)?;
    }
    let refill_key = format!("{prefix}_REFILL_PER_SEC");
    if let Some(value) = read_env(&refill_key) {
        bucket.refill_per_sec = parse_value(&refill_key, &value)?;
    }
    Ok(())
}

fn tier_bucket_mut(limits: &mut TierLimits, tier: Tier) -> &mut BucketConfig {
    match tier {
        Tier::Free => &mut limits.free,
        Tier::Pro => &mut limits.pro,
        Tier::Enterprise => &mut limits.enterprise,
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation("llm.temperature must be in range 0..=1".to_string()));
    }
    if !(0.0..=1.0).contains(&llm.top_p) {
        return Err(ConfigError::Validation("llm.top_p must be in range 0..=1".to_string()));
    }
    if llm.top_k == 0 || llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.top_k and llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
        LlmProvider::Offline => {}
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.idle_sweep_secs == 0 {
        return Err(ConfigError::Validation(
            "server.idle_sweep_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    if routing.company_name.trim().is_empty() {
        return Err(ConfigError::Validation("routing.company_name must not be empty".to_string()));
    }
    if !(routing.sentiment_alpha > 0.0 && routing.sentiment_alpha <= 1.0) {
        return Err(ConfigError::Validation(
            "routing.sentiment_alpha must be in range (0, 1]".to_string(),
        ));
    }
    if !(-1.0..=1.0).contains(&routing.negative_score_floor) {
        return Err(ConfigError::Validation(
            "routing.negative_score_floor must be in range -1..=1".to_string(),
        ));
    }
    if !(-1.0..=1.0).contains(&routing.escalation_threshold) {
        return Err(ConfigError::Validation(
            "routing.escalation_threshold must be in range -1..=1".to_string(),
        ));
    }
    if routing.max_turns == 0 {
        return Err(ConfigError::Validation(
            "routing.max_turns must be greater than zero".to_string(),
        ));
    }
    if routing.turn_timeout_secs == 0 || routing.turn_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "routing.turn_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if routing.inactivity_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "routing.inactivity_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if routing.max_message_chars == 0 {
        return Err(ConfigError::Validation(
            "routing.max_message_chars must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&routing.min_confidence) {
        return Err(ConfigError::Validation(
            "routing.min_confidence must be in range 0..=1".to_string(),
        ));
    }
    if routing.priority_queue.trim().is_empty() || routing.standard_queue.trim().is_empty() {
        return Err(ConfigError::Validation("routing queue names must not be empty".to_string()));
    }
    Ok(())
}

fn validate_rate_limits(rate_limits: &RateLimitConfig) -> Result<(), ConfigError> {
    for tier in Tier::ALL {
        validate_bucket(rate_limits.tiers.for_tier(tier), &format!("rate_limits.{tier}"))?;
        validate_bucket(
            rate_limits.hourly.for_tier(tier),
            &format!("rate_limits.hourly.{tier}"),
        )?;
    }
    Ok(())
}

fn validate_bucket(bucket: BucketConfig, path: &str) -> Result<(), ConfigError> {
    if bucket.capacity == 0 {
        return Err(ConfigError::Validation(format!("{path}.capacity must be greater than zero")));
    }
    if !(bucket.refill_per_sec.is_finite() && bucket.refill_per_sec > 0.0) {
        return Err(ConfigError::Validation(format!(
            "{path}.refill_per_sec must be a positive number"
        )));
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

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    routing: Option<RoutingPatch>,
    rate_limits: Option<RateLimitPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    idle_sweep_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    company_name: Option<String>,
    sentiment_alpha: Option<f64>,
    negative_score_floor: Option<f64>,
    escalation_threshold: Option<f64>,
    negative_streak_limit: Option<u32>,
    max_turns: Option<u32>,
    turn_timeout_secs: Option<u64>,
    inactivity_timeout_secs: Option<u64>,
    max_message_chars: Option<usize>,
    min_confidence: Option<f64>,
    priority_queue: Option<String>,
    standard_queue: Option<String>,
    handoff_keywords: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    enabled: Option<bool>,
    free: Option<BucketPatch>,
    pro: Option<BucketPatch>,
    enterprise: Option<BucketPatch>,
    hourly: Option<HourlyPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct HourlyPatch {
    free: Option<BucketPatch>,
    pro: Option<BucketPatch>,
    enterprise: Option<BucketPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct BucketPatch {
    capacity: Option<u32>,
    refill_per_sec: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
