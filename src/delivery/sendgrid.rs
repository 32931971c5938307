//! SendGrid v3 Mail Send adapter.

use serde::{Deserialize, Serialize};

use super::{DeliveryError, EmailMessage, EmailProvider};

const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";

pub struct SendGridProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl SendGridProvider {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct SendGridErrors {
    #[serde(default)]
    errors: Vec<SendGridError>,
}

#[derive(Deserialize)]
struct SendGridError {
    #[serde(default)]
    message: String,
    field: Option<String>,
}

fn map_error_status(status: u16, body: &str) -> DeliveryError {
    let errors = serde_json::from_str::<SendGridErrors>(body)
        .map(|e| e.errors)
        .unwrap_or_default();
    let detail = if errors.is_empty() {
        format!("HTTP {status}: {body}")
    } else {
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        format!("HTTP {status}: {}", messages.join("; "))
    };

    let mentions_sender = errors.iter().any(|e| {
        e.field.as_deref() == Some("from")
            || e.field.as_deref().is_some_and(|f| f.starts_with("from."))
            || e.message.to_lowercase().contains("sender identity")
    });
    let mentions_recipient = errors.iter().any(|e| {
        e.field
            .as_deref()
            .is_some_and(|f| f.starts_with("personalizations") && f.contains(".to"))
    });

    match status {
        401 => DeliveryError::Unauthorized(detail),
        403 => DeliveryError::UnverifiedSender(detail),
        400 if mentions_sender => DeliveryError::UnverifiedSender(detail),
        400 if mentions_recipient => DeliveryError::InvalidRecipient(detail),
        408 | 504 => DeliveryError::Timeout(detail),
        429 => DeliveryError::RateLimited(detail),
        500..=599 => DeliveryError::Server(detail),
        _ => DeliveryError::Rejected(detail),
    }
}

fn from_reqwest(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout(err.to_string())
    } else if err.is_builder() {
        DeliveryError::Rejected(err.to_string())
    } else {
        DeliveryError::Server(err.to_string())
    }
}

#[async_trait::async_trait]
impl EmailProvider for SendGridProvider {
    async fn send(&self, message: &EmailMessage) -> Result<Option<String>, DeliveryError> {
        let body = MailSendRequest {
            personalizations: vec![Personalization {
                to: vec![Address { email: &message.to }],
            }],
            from: Address {
                email: &message.from,
            },
            subject: &message.subject,
            content: vec![Content {
                content_type: "text/html",
                value: &message.html_body,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Ok(message_id);
        }

        let error_body = response.text().await.unwrap_or_default();
        Err(map_error_status(status.as_u16(), &error_body))
    }

    fn name(&self) -> &str {
        "sendgrid"
    }
}
