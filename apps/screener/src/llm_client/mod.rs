//! Model access for the pipeline stages.
//!
//! Summarization and resume extraction reach the Messages API only through [`LlmClient`];
//! embeddings go through [`embeddings::EmbeddingClient`]. Each call is a single attempt.
//! Retrying is the stage worker's job, so errors are classified here and not retried.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::failure::StageFailure;

pub mod embeddings;
pub mod prompts;

use prompts::JSON_ONLY_SYSTEM;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Anthropic's "overloaded" status.
const STATUS_OVERLOADED: u16 = 529;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("Model output is not the expected JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Model returned no text content")]
    EmptyContent,

    #[error("Model output was cut off at {max_tokens} tokens")]
    Truncated { max_tokens: u32 },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl LlmError {
    /// Whether the same request could succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => !(e.is_builder() || e.is_decode()),
            LlmError::RateLimited { .. } => true,
            LlmError::Api { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == STATUS_OVERLOADED
                    || *status >= 500
            }
            LlmError::Parse(_) | LlmError::EmptyContent | LlmError::Truncated { .. } => false,
        }
    }
}

impl From<LlmError> for StageFailure {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { retry_after } => {
                StageFailure::transient(e.to_string()).with_retry_after(retry_after)
            }
            e if e.is_transient() => StageFailure::transient(e.to_string()),
            e => StageFailure::permanent(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Turn<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct Completion {
    content: Vec<Block>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl Completion {
    /// All text blocks, joined.
    fn into_text(self) -> Result<String, LlmError> {
        if self.stop_reason.as_deref() == Some("max_tokens") {
            return Err(LlmError::Truncated {
                max_tokens: MAX_TOKENS,
            });
        }
        let text: String = self
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        if text.trim().is_empty() {
            Err(LlmError::EmptyContent)
        } else {
            Ok(text)
        }
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Messages API client shared by the summarizer and the resume parser.
#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    settings: LlmSettings,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, settings })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    /// One request, one user turn. Returns the concatenated text of the reply.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let body = MessagesRequest {
            model: &self.settings.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: [Turn {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(&self.settings.api_url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            warn!("{} rate limited the request", self.settings.model);
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorEnvelope>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            warn!("Messages API returned {status}: {message}");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: Completion = response.json().await?;
        debug!(
            "{} used {} input / {} output tokens",
            self.settings.model, completion.usage.input_tokens, completion.usage.output_tokens
        );
        completion.into_text()
    }

    /// Like [`LlmClient::complete`], with the reply parsed as `T`. The JSON-only instruction
    /// is appended to `system`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<T, LlmError> {
        let system = format!("{system}\n\n{JSON_ONLY_SYSTEM}");
        let text = self.complete(&system, prompt).await?;
        Ok(serde_json::from_str(json_body(&text))?)
    }
}

/// The JSON value inside a model reply: fences are dropped, and prose around a single
/// object or array is cut away.
fn json_body(text: &str) -> &str {
    let text = text.trim();
    let unfenced = match text.strip_prefix("```") {
        Some(rest) => {
            // Skip the info string ("json") on the opening fence line.
            let rest = rest.split_once('\n').map_or("", |(_, body)| body);
            rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
        }
        None => text,
    };

    let open = unfenced.find(['{', '[']);
    let close = unfenced.rfind(['}', ']']);
    match (open, close) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}
