pub mod dispatcher;
pub mod sendgrid;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Retryable;

pub use dispatcher::Dispatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Failures at the email delivery boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("sender identity not verified: {0}")]
    UnverifiedSender(String),

    #[error("email provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("email provider rejected the message: {0}")]
    Rejected(String),

    #[error("email provider rate limited: {0}")]
    RateLimited(String),

    #[error("email provider server error: {0}")]
    Server(String),

    #[error("email delivery timed out: {0}")]
    Timeout(String),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::InvalidRecipient(_) => "invalid-recipient",
            DeliveryError::UnverifiedSender(_) => "unverified-sender",
            DeliveryError::Unauthorized(_) => "auth-error",
            DeliveryError::Rejected(_) => "rejected",
            DeliveryError::RateLimited(_) => "rate-limited",
            DeliveryError::Server(_) => "server-error",
            DeliveryError::Timeout(_) => "timeout",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::RateLimited(_) | DeliveryError::Server(_) | DeliveryError::Timeout(_)
        )
    }
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// What happened to one delivery request. Terminal once returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Whether any call reached the email provider.
    pub attempted: bool,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    /// Machine tag such as `invalid-recipient`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub attempts: u32,
}

#[async_trait::async_trait]
pub trait EmailProvider: Send + Sync {
    /// Sends one message. `Ok` carries the provider's message id when it
    /// returns one.
    async fn send(&self, message: &EmailMessage) -> Result<Option<String>, DeliveryError>;
    fn name(&self) -> &str;
}
