use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use teloxide::types::ChatId;

use crate::bot::recipe_ai::RetryPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Environment variables could not be deserialized.
    Env(envy::Error),
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(source) => write!(f, "failed to read environment: {}", source),
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Env(source) => Some(source),
            Self::Validation(_) => None,
        }
    }
}

/// Raw environment, field names map to upper-case variable names.
#[derive(Deserialize)]
struct EnvFile {
    #[serde(default)]
    bot_token: String,
    #[serde(default)]
    bot_username: String,
    #[serde(default = "default_base_url")]
    recipe_ai_base_url: String,
    /// Seconds, fractions allowed.
    #[serde(default = "default_timeout_secs")]
    recipe_ai_timeout: f64,
    #[serde(default = "default_retries")]
    recipe_ai_retries: u32,
    #[serde(default = "default_backoff_ms")]
    recipe_ai_backoff_ms: u64,
    #[serde(default = "default_db_path")]
    db_path: String,
    #[serde(default = "default_log_dir")]
    log_dir: String,
    log_chat_id: Option<i64>,
    #[serde(default = "default_retention_hours")]
    event_retention_hours: u64,
}

/// Upper bounds for the numeric settings.
const MAX_TIMEOUT_SECS: f64 = 3600.0;
const MAX_RETRIES: u32 = 10;
const MAX_BACKOFF_MS: u64 = 60_000;
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout_secs() -> f64 {
    20.0
}

fn default_retries() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_db_path() -> String {
    "db.sqlite3".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_retention_hours() -> u64 {
    48
}

pub struct Config {
    pub bot_token: String,
    /// Bot handle without the leading `@`.
    pub bot_username: String,
    /// Base address of the Recipe AI service, no trailing slash.
    pub recipe_ai_base_url: String,
    pub retry: RetryPolicy,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /// Chat that receives WARN/ERROR log lines.
    pub log_chat_id: Option<ChatId>,
    /// How long processed event keys are kept for redelivery detection.
    pub event_retention: Duration,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file: EnvFile = envy::from_iter(vars).map_err(ConfigError::Env)?;

        let bot_token = file.bot_token.trim().to_string();
        if bot_token.is_empty() {
            return Err(ConfigError::Validation("BOT_TOKEN is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "BOT_TOKEN appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }

        let bot_username = file.bot_username.trim().trim_start_matches('@').to_string();
        if bot_username.is_empty() {
            return Err(ConfigError::Validation("BOT_USERNAME is required".into()));
        }

        let recipe_ai_base_url = file.recipe_ai_base_url.trim().trim_end_matches('/').to_string();
        if !recipe_ai_base_url.starts_with("http://") && !recipe_ai_base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "RECIPE_AI_BASE_URL must be an http(s) URL, got '{recipe_ai_base_url}'"
            )));
        }

        if !file.recipe_ai_timeout.is_finite() || file.recipe_ai_timeout <= 0.0 {
            return Err(ConfigError::Validation("RECIPE_AI_TIMEOUT must be a positive number of seconds".into()));
        }
        if file.recipe_ai_timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Validation(format!(
                "RECIPE_AI_TIMEOUT must be at most {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        let timeout = Duration::try_from_secs_f64(file.recipe_ai_timeout)
            .map_err(|e| ConfigError::Validation(format!("RECIPE_AI_TIMEOUT: {e}")))?;

        if file.recipe_ai_retries > MAX_RETRIES {
            return Err(ConfigError::Validation(format!("RECIPE_AI_RETRIES must be at most {MAX_RETRIES}")));
        }
        if file.recipe_ai_backoff_ms > MAX_BACKOFF_MS {
            return Err(ConfigError::Validation(format!("RECIPE_AI_BACKOFF_MS must be at most {MAX_BACKOFF_MS}")));
        }
        if file.event_retention_hours > MAX_RETENTION_HOURS {
            return Err(ConfigError::Validation(format!(
                "EVENT_RETENTION_HOURS must be at most {MAX_RETENTION_HOURS}"
            )));
        }

        if file.db_path.trim().is_empty() {
            return Err(ConfigError::Validation("DB_PATH must not be empty".into()));
        }

        Ok(Self {
            bot_token,
            bot_username,
            recipe_ai_base_url,
            retry: RetryPolicy {
                timeout,
                max_retries: file.recipe_ai_retries,
                backoff: Duration::from_millis(file.recipe_ai_backoff_ms),
            },
            db_path: PathBuf::from(file.db_path),
            log_dir: PathBuf::from(file.log_dir),
            log_chat_id: file.log_chat_id.map(ChatId),
            event_retention: Duration::from_secs(file.event_retention_hours * 3600),
        })
    }
}
