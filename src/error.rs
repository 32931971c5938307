use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use opentelemetry::trace::TraceContextExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::delivery::DeliveryError;
use crate::llm::ModelError;
use crate::pipeline::prompts::Facet;
use crate::pipeline::validate::ValidationError;

/// Failure classes a pipeline run can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientModel,
    FatalModel,
    Validation,
    TransientDelivery,
    FatalDelivery,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    Configuration,
    Generation,
    Validation,
    Delivery,
}

/// One recorded failure inside a [`PipelineResult`](crate::pipeline::PipelineResult).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet: Option<Facet>,
    pub kind: ErrorKind,
    /// Machine-readable tag such as `rate-limited` or `invalid-recipient`.
    pub code: String,
    pub message: String,
    pub attempts: u32,
}

impl ErrorRecord {
    pub fn model(facet: Facet, error: &ModelError, attempts: u32) -> Self {
        let kind = if error.is_transient() {
            ErrorKind::TransientModel
        } else {
            ErrorKind::FatalModel
        };
        Self {
            stage: Stage::Generation,
            facet: Some(facet),
            kind,
            code: error.code().to_string(),
            message: error.to_string(),
            attempts,
        }
    }

    pub fn validation(facet: Facet, error: &ValidationError) -> Self {
        Self {
            stage: Stage::Validation,
            facet: Some(facet),
            kind: ErrorKind::Validation,
            code: error.code().to_string(),
            message: error.to_string(),
            attempts: 0,
        }
    }

    pub fn delivery(error: &DeliveryError, attempts: u32) -> Self {
        let kind = if error.is_transient() {
            ErrorKind::TransientDelivery
        } else {
            ErrorKind::FatalDelivery
        };
        Self {
            stage: Stage::Delivery,
            facet: None,
            kind,
            code: error.code().to_string(),
            message: error.to_string(),
            attempts,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Configuration,
            facet: None,
            kind: ErrorKind::Configuration,
            code: "missing-configuration".to_string(),
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Request,
            facet: None,
            kind: ErrorKind::Validation,
            code: "invalid-request".to_string(),
            message: message.into(),
            attempts: 0,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.facet {
            Some(facet) => write!(f, "{} ({facet}): {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A model or delivery failure that left nothing to return.
    #[error("Upstream error: {0}")]
    Upstream(ErrorRecord),
}

impl From<ErrorRecord> for AppError {
    fn from(record: ErrorRecord) -> Self {
        match record.stage {
            Stage::Request => AppError::Validation(record.message),
            Stage::Configuration => AppError::Configuration(record.message),
            _ => AppError::Upstream(record),
        }
    }
}

fn get_trace_id() -> Option<String> {
    let span = Span::current();
    let context = span.context();
    let span_ref = context.span();
    let span_context = span_ref.span_context();

    if span_context.is_valid() {
        Some(span_context.trace_id().to_string())
    } else {
        None
    }
}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Configuration(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service not configured".to_string(),
                )
            }
            AppError::Upstream(record) => {
                tracing::error!(error = %record, stage = ?record.stage, "Upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    format!("Upstream failure: {}", record.code),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();

        let body = if let Some(trace_id) = get_trace_id() {
            json!({
                "error": error_message,
                "status": status.as_u16(),
                "trace_id": trace_id,
            })
        } else {
            json!({
                "error": error_message,
                "status": status.as_u16(),
            })
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
