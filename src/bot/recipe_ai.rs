//! Recipe AI HTTP client with a bounded timeout and explicit retry policy.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest message forwarded to the service.
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// How much of an error body is kept.
const ERROR_BODY_CHARS: usize = 300;

/// Deadline used when the retry budget does not fit an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// Suggestions appended to an answer.
const MAX_SUGGESTIONS: usize = 5;

/// Timeout and retry parameters for one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after a timeout or connection failure.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Upper bound on the latency of one logical call, backoff included.
    pub fn budget(&self) -> Duration {
        self.timeout.saturating_mul(self.max_retries.saturating_add(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_retries: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Taste level forwarded with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    #[default]
    Normal,
    High,
}

impl Level {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Level::Low),
            "normal" => Some(Level::Normal),
            "high" => Some(Level::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Normal => "normal",
            Level::High => "high",
        }
    }
}

/// Body of `POST {base}/chat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub user_id: String,
    pub spiciness: Level,
    pub saltiness: Level,
}

impl ChatRequest {
    fn validate(&self) -> Result<(), ExternalError> {
        if self.message.trim().is_empty() {
            return Err(ExternalError::Validation("message is empty".into()));
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ExternalError::Validation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(ExternalError::Validation("user_id is empty".into()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    markdown_message: Option<String>,
    message: Option<String>,
    #[serde(default)]
    suggestions: Option<Vec<serde_json::Value>>,
}

/// A decoded answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub answer: String,
    pub suggestions: Vec<String>,
}

impl ChatReply {
    /// Text sent back to the user.
    pub fn render(&self) -> String {
        if self.suggestions.is_empty() {
            return self.answer.clone();
        }
        format!("{}\n\nSuggestions:\n- {}", self.answer, self.suggestions.join("\n- "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalError {
    /// Request rejected locally, nothing was sent.
    Validation(String),
    Timeout,
    Connection(String),
    Service { status: u16, body: String },
    Malformed(String),
}

impl ExternalError {
    fn is_retryable(&self) -> bool {
        matches!(self, ExternalError::Timeout | ExternalError::Connection(_))
    }
}

impl fmt::Display for ExternalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalError::Validation(e) => write!(f, "invalid request: {e}"),
            ExternalError::Timeout => write!(f, "request timed out"),
            ExternalError::Connection(e) => write!(f, "connection error: {e}"),
            ExternalError::Service { status, body } => write!(f, "service error {status}: {body}"),
            ExternalError::Malformed(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl std::error::Error for ExternalError {}

/// The external service as seen by the dispatcher.
pub trait RecipeAi: Send + Sync {
    fn chat(&self, request: &ChatRequest) -> impl Future<Output = Result<ChatReply, ExternalError>> + Send;
}

pub struct RecipeAiClient {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl RecipeAiClient {
    pub fn new(base_url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy,
        }
    }

    async fn attempt(&self, request: &ChatRequest) -> Result<ChatReply, ExternalError> {
        let url = format!("{}/chat", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_lowercase().contains("application/json"));
        let body = response.text().await.map_err(classify)?;

        debug!("Recipe AI response status: {status}");

        if !status.is_success() {
            return Err(ExternalError::Service {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        decode(&body, is_json)
    }
}

impl RecipeAi for RecipeAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, ExternalError> {
        request.validate()?;

        let now = Instant::now();
        let deadline = now.checked_add(self.policy.budget()).unwrap_or(now + FAR_FUTURE);
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExternalError::Timeout);
            }

            let result = match tokio::time::timeout(self.policy.timeout.min(remaining), self.attempt(request)).await {
                Ok(result) => result,
                Err(_) => Err(ExternalError::Timeout),
            };

            match result {
                Ok(reply) => {
                    if attempt > 0 {
                        info!("Recipe AI succeeded after {} retr{}", attempt, if attempt == 1 { "y" } else { "ies" });
                    }
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!("Recipe AI attempt {attempt} failed: {e}, retrying");
                    let pause = self
                        .policy
                        .backoff
                        .saturating_mul(attempt)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify(e: reqwest::Error) -> ExternalError {
    if e.is_timeout() {
        ExternalError::Timeout
    } else {
        ExternalError::Connection(e.to_string())
    }
}

fn decode(body: &str, is_json: bool) -> Result<ChatReply, ExternalError> {
    if !is_json {
        if body.trim().is_empty() {
            return Err(ExternalError::Malformed("empty body".into()));
        }
        return Ok(ChatReply { answer: body.to_string(), suggestions: vec![] });
    }

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ExternalError::Malformed(format!("invalid JSON: {e}")))?;
    let keys = match value.as_object() {
        Some(map) => map.keys().take(20).cloned().collect::<Vec<_>>().join(", "),
        None => "non-object".to_string(),
    };
    let parsed: ChatResponse = serde_json::from_value(value)
        .map_err(|e| ExternalError::Malformed(format!("unexpected shape: {e}")))?;

    let answer = parsed
        .markdown_message
        .filter(|s| !s.trim().is_empty())
        .or(parsed.message.filter(|s| !s.trim().is_empty()))
        .ok_or_else(|| ExternalError::Malformed(format!("no answer field, keys={keys}")))?;

    let suggestions = parsed
        .suggestions
        .unwrap_or_default()
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .collect();

    Ok(ChatReply { answer, suggestions })
}
