//! Embedding endpoint client (Ollama-compatible `/api/embeddings`).

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm_client::{retry_after, LlmError};

const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(url: String, model: String) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
            url,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            warn!("Embedding endpoint rate limited the request");
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: EmbeddingResponse = response.json().await?;
        debug!("Embedded {} chars into {} dims", text.len(), body.embedding.len());
        Ok(body.embedding)
    }
}
