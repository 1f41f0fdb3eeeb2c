//! Text generation backends for patient replies.
//!
//! The HTTP client speaks the Ollama `/api/generate` contract. Callers
//! always have a template fallback, so every error here is recoverable.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generation is disabled")]
    Disabled,

    #[error("Cannot reach generation service at {0}")]
    Connection(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generation service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("Malformed generation response: {0}")]
    ResponseParsing(String),

    #[error("Generation returned no text")]
    Empty,

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, prompt: &str, system: &str) -> Result<String, GenerationError>;
}

/// Client for an Ollama-compatible endpoint.
pub struct HttpGenerationClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpGenerationClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::HttpClient(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, prompt: &str, system: &str) -> Result<String, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerationError::Connection(self.base_url.clone())
                } else if e.is_timeout() {
                    GenerationError::HttpClient("request timed out".into())
                } else {
                    GenerationError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::ResponseParsing(e.to_string()))?;

        let text = parsed.response.trim();
        if text.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text.to_string())
    }
}

/// Used when no generation endpoint is configured. Every reply takes the
/// template path.
pub struct DisabledGenerationClient;

#[async_trait]
impl GenerationClient for DisabledGenerationClient {
    async fn generate(&self, _prompt: &str, _system: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Disabled)
    }
}

/// Scripted client for tests.
#[cfg(test)]
pub enum MockGenerationClient {
    Reply(String),
    Fail,
    Slow(Duration, String),
}

#[cfg(test)]
#[async_trait]
impl GenerationClient for MockGenerationClient {
    async fn generate(&self, _prompt: &str, _system: &str) -> Result<String, GenerationError> {
        match self {
            Self::Reply(text) => Ok(text.clone()),
            Self::Fail => Err(GenerationError::Service {
                status: 503,
                body: "unavailable".into(),
            }),
            Self::Slow(delay, text) => {
                tokio::time::sleep(*delay).await;
                Ok(text.clone())
            }
        }
    }
}
