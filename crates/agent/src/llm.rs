//! Text generation collaborator.
//!
//! Every provider returns plain text. Transient failures (`RateLimited`, `Unavailable`)
//! are retried with capped exponential backoff; `Blocked` and `InvalidResponse` are not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concierge_core::config::{LlmConfig, LlmProvider};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { temperature: 0.7, top_p: 0.8, top_k: 40, max_tokens: 1024 }
    }
}

impl From<&LlmConfig> for GenerationParams {
    fn from(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_tokens: config.max_tokens,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation provider rate limited the request")]
    RateLimited,
    #[error("generation provider unavailable: {0}")]
    Unavailable(String),
    #[error("generation blocked by provider safety filters: {0}")]
    Blocked(String),
    #[error("generation provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unavailable(_))
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError>;
}

pub fn build_client(config: &LlmConfig) -> Arc<dyn LlmClient> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiClient::new(
            config.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            config.api_key.clone().unwrap_or_else(|| SecretString::from(String::new())),
            config.model.clone(),
            timeout,
            config.max_retries,
        )),
        LlmProvider::Ollama => Arc::new(OllamaClient::new(
            config.base_url.clone().unwrap_or_else(|| "http://localhost:11434".to_string()),
            config.model.clone(),
            timeout,
            config.max_retries,
        )),
        LlmProvider::Offline => Arc::new(OfflineLlmClient),
    }
}

fn http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|error| {
        warn!(event_name = "llm.http_client_fallback", error = %error, "using default http client");
        Client::new()
    })
}

/// Delay before retry number `attempt` (1-based): base · 2^(attempt-1), capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

async fn with_retries<F, Fut>(
    provider: &'static str,
    max_retries: u32,
    mut call: F,
) -> Result<String, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, GenerationError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(text) => return Ok(text),
            Err(error) if error.is_transient() && attempt < max_retries => {
                attempt += 1;
                let delay = backoff_delay(attempt);
                warn!(
                    event_name = "llm.retry_scheduled",
                    provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient generation failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited,
        status if status.is_server_error() => {
            GenerationError::Unavailable(format!("provider returned {status}"))
        }
        status => {
            let lowered = body.to_ascii_lowercase();
            if lowered.contains("content_filter") || lowered.contains("safety") {
                GenerationError::Blocked(format!("provider returned {status}"))
            } else if lowered.contains("quota") {
                GenerationError::RateLimited
            } else {
                GenerationError::InvalidResponse(format!("provider returned {status}"))
            }
        }
    }
}

fn transport_error(error: reqwest::Error) -> GenerationError {
    GenerationError::Unavailable(error.to_string())
}

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            max_retries,
        }
    }

    async fn generate_once(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": params.temperature,
                "top_p": params.top_p,
                "max_tokens": params.max_tokens,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|error| GenerationError::InvalidResponse(error.to_string()))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::InvalidResponse("no choices returned".to_string()))?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GenerationError::Blocked("content_filter".to_string()));
        }
        non_empty(choice.message.content.unwrap_or_default())
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        with_retries(self.name(), self.max_retries, || self.generate_once(prompt, params)).await
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_retries,
        }
    }

    async fn generate_once(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": params.temperature,
                    "top_p": params.top_p,
                    "top_k": params.top_k,
                    "num_predict": params.max_tokens,
                },
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let generated: OllamaGenerate = response
            .json()
            .await
            .map_err(|error| GenerationError::InvalidResponse(error.to_string()))?;
        non_empty(generated.response)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        with_retries(self.name(), self.max_retries, || self.generate_once(prompt, params)).await
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerate {
    response: String,
}

fn non_empty(text: String) -> Result<String, GenerationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(GenerationError::InvalidResponse("empty completion".to_string()))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Deterministic, network-free generation. Echoes the last `Customer:` line of the prompt
/// into a fixed acknowledgement.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineLlmClient;

#[async_trait]
impl LlmClient for OfflineLlmClient {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let question = prompt
            .lines()
            .rev()
            .find_map(|line| line.trim().strip_prefix("Customer:"))
            .map(str::trim)
            .filter(|line| !line.is_empty());

        let reply = match question {
            Some(question) => format!(
                "Thanks for reaching out about \"{question}\". Here is what I can share right now, \
                 and I am happy to go further if you need more detail."
            ),
            None => "Thanks for reaching out. How can I help you today?".to_string(),
        };
        debug!(event_name = "llm.offline_generated", chars = reply.len(), "offline reply");
        Ok(reply)
    }
}
