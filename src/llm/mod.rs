pub mod anthropic;
pub mod client;
pub mod openai;
pub mod vertex;

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::error::AppError;
use crate::retry::Retryable;

pub use client::{LlmClient, ModelFailure, RawModelResponse};

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub facet: String,
    /// Ask the provider for a JSON-only response where it supports it.
    pub json_output: bool,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
    pub provider: String,
}

/// Failures at the model invocation boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call timed out: {0}")]
    Timeout(String),

    #[error("model rate limited: {0}")]
    RateLimited(String),

    #[error("model authentication failed: {0}")]
    Auth(String),

    #[error("model server error: {0}")]
    Server(String),

    #[error("malformed model request: {0}")]
    MalformedRequest(String),
}

impl ModelError {
    pub fn code(&self) -> &'static str {
        match self {
            ModelError::Timeout(_) => "timeout",
            ModelError::RateLimited(_) => "rate-limited",
            ModelError::Auth(_) => "auth-error",
            ModelError::Server(_) => "server-error",
            ModelError::MalformedRequest(_) => "malformed-request",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::Timeout(_) | ModelError::RateLimited(_) | ModelError::Server(_)
        )
    }

    /// Maps a non-success HTTP status from a provider API.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = format!("HTTP {status}: {}", detail.into());
        match status {
            408 | 504 => ModelError::Timeout(detail),
            429 => ModelError::RateLimited(detail),
            401 | 403 => ModelError::Auth(detail),
            500..=599 => ModelError::Server(detail),
            _ => ModelError::MalformedRequest(detail),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ModelError::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            ModelError::Server(format!("unreadable response body: {err}"))
        } else if err.is_builder() {
            ModelError::MalformedRequest(err.to_string())
        } else {
            ModelError::Server(err.to_string())
        }
    }

    /// Classifies an opaque SDK error by its message.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        let detail = message.to_string();
        if msg.contains("rate limit") || msg.contains("429") || msg.contains("quota") {
            ModelError::RateLimited(detail)
        } else if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline")
        {
            ModelError::Timeout(detail)
        } else if msg.contains("401")
            || msg.contains("403")
            || msg.contains("auth")
            || msg.contains("api key")
            || msg.contains("permission")
        {
            ModelError::Auth(detail)
        } else if msg.contains("400")
            || msg.contains("404")
            || msg.contains("422")
            || msg.contains("invalid")
        {
            ModelError::MalformedRequest(detail)
        } else {
            // 5xx, connection resets, DNS failures and anything unrecognised
            ModelError::Server(detail)
        }
    }
}

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ModelError>;
    fn name(&self) -> &str;
    fn server_address(&self) -> &str {
        "unknown"
    }
}

fn required<'a>(value: &'a Option<String>, var: &str) -> Result<&'a str, AppError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::Configuration(format!("{var} must be set")))
}

/// Builds a provider by name from injected configuration.
pub fn build_provider(name: &str, config: &Config) -> Result<Arc<dyn Provider>, AppError> {
    let provider: Arc<dyn Provider> = match name {
        "vertex" => Arc::new(vertex::VertexProvider::new(
            required(&config.gcp_project_id, "GOOGLE_CLOUD_PROJECT_ID")?,
            &config.gcp_location,
            required(&config.gcp_access_token, "GOOGLE_CLOUD_ACCESS_TOKEN")?,
        )),
        "anthropic" => Arc::new(anthropic::AnthropicProvider::new(required(
            &config.anthropic_api_key,
            "ANTHROPIC_API_KEY",
        )?)),
        "google" => Arc::new(openai::OpenAIProvider::new_google(required(
            &config.google_api_key,
            "GOOGLE_API_KEY",
        )?)),
        "ollama" => Arc::new(openai::OpenAIProvider::new_ollama(&config.ollama_base_url)),
        "openai" => Arc::new(openai::OpenAIProvider::new(required(
            &config.openai_api_key,
            "OPENAI_API_KEY",
        )?)),
        other => {
            return Err(AppError::Configuration(format!(
                "unknown LLM provider {other:?}"
            )));
        }
    };
    Ok(provider)
}
