//! Language-model boundary.
//!
//! Agents talk to the model through the [`LanguageModel`] trait: one
//! system message, one user message, one text completion back. The
//! production implementation, [`ChatCompletionsModel`], speaks the
//! OpenAI-compatible `/chat/completions` protocol, which Groq (the default
//! provider) and OpenAI both serve.
//!
//! Every call made by an agent goes through [`complete_with_timeout`]; on
//! expiry the in-flight request is dropped and [`QaError::Timeout`] is
//! returned.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{QaError, Result};

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A chat model that turns a prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// Run `model.complete` with a hard deadline.
pub async fn complete_with_timeout(
    model: &dyn LanguageModel,
    request: &ChatRequest,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, model.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(QaError::Timeout(timeout)),
    }
}

// ============ Wire types ============

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============ Chat completions client ============

/// Client for OpenAI-compatible chat-completion APIs.
///
/// Retry strategy matches the embedding providers: HTTP 429 and 5xx are
/// retried with exponential backoff (1s, 2s, 4s, ...), other 4xx fail
/// immediately.
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_retries: u32,
    timeout: Duration,
}

impl ChatCompletionsModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            QaError::Llm(format!(
                "{} environment variable not set",
                config.api_key_env
            ))
        })?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QaError::Llm(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.resolved_base_url()),
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
            timeout,
        })
    }
}

impl std::fmt::Debug for ChatCompletionsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsModel")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, ?delay, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() => return Err(QaError::Timeout(self.timeout)),
                Err(e) => {
                    last_err = Some(QaError::Llm(format!("HTTP request failed: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: CompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| QaError::Llm(format!("invalid completion response: {}", e)))?;
                return parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| QaError::Llm("completion response has no content".to_string()));
            }

            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            let err = QaError::Llm(format!("API error {}: {}", status, message));

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| QaError::Llm("chat completion failed after retries".into())))
    }
}

/// Create the [`LanguageModel`] selected by configuration.
pub fn create_model(config: &LlmConfig) -> Result<Box<dyn LanguageModel>> {
    match config.provider.as_str() {
        "groq" | "openai" => Ok(Box::new(ChatCompletionsModel::new(config)?)),
        "disabled" => Err(QaError::Llm(
            "LLM provider is disabled; set [llm] provider in the config".to_string(),
        )),
        other => Err(QaError::Llm(format!("unknown llm provider: {}", other))),
    }
}
