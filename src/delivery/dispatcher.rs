use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use validator::ValidateEmail;

use super::{DeliveryError, DeliveryOutcome, EmailMessage, EmailProvider};
use crate::pipeline::render::Report;
use crate::retry::RetryPolicy;
use crate::telemetry::metrics::DELIVERY_ATTEMPTS;

/// Sends rendered reports through an [`EmailProvider`]. Never fails: every
/// problem ends up in the returned [`DeliveryOutcome`].
pub struct Dispatcher {
    provider: Arc<dyn EmailProvider>,
    from: String,
    retry: RetryPolicy,
    timeout: Duration,
}

pub fn is_valid_address(address: &str) -> bool {
    let candidate = address.trim().to_string();
    !candidate.is_empty() && candidate.validate_email()
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn EmailProvider>, from: impl Into<String>) -> Self {
        Self {
            provider,
            from: from.into(),
            retry: RetryPolicy::delivery_default(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn deliver(&self, report: &Report, recipient: &str) -> DeliveryOutcome {
        self.dispatch(report, recipient).await.0
    }

    /// Like [`deliver`](Self::deliver), also handing back the final error so the
    /// caller can classify it.
    #[tracing::instrument(
        name = "pipeline_stage deliver",
        skip(self, report),
        fields(
            pipeline.stage = "deliver",
            email.provider = %self.provider.name(),
            delivery.attempts,
            delivery.succeeded,
        )
    )]
    pub(crate) async fn dispatch(
        &self,
        report: &Report,
        recipient: &str,
    ) -> (DeliveryOutcome, Option<DeliveryError>) {
        let span = tracing::Span::current();

        if !is_valid_address(recipient) {
            let error =
                DeliveryError::InvalidRecipient(format!("{recipient:?} is not an email address"));
            tracing::warn!(error = %error, "Recipient rejected before sending");
            span.record("delivery.attempts", 0);
            span.record("delivery.succeeded", false);
            let outcome = DeliveryOutcome {
                attempted: false,
                succeeded: false,
                provider_message_id: None,
                failure_reason: Some(error.code().to_string()),
                attempts: 0,
            };
            return (outcome, Some(error));
        }

        let message = EmailMessage {
            from: self.from.clone(),
            to: recipient.trim().to_string(),
            subject: report.subject.clone(),
            html_body: report.html_body.clone(),
        };

        let outcome = self
            .retry
            .run(|| async {
                match tokio::time::timeout(self.timeout, self.provider.send(&message)).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout(format!(
                        "no response within {}s",
                        self.timeout.as_secs_f64()
                    ))),
                }
            })
            .await;

        let provider_kv = KeyValue::new("email.provider", self.provider.name().to_string());
        span.record("delivery.attempts", outcome.attempts);

        match outcome.result {
            Ok(message_id) => {
                DELIVERY_ATTEMPTS.add(
                    u64::from(outcome.attempts),
                    &[provider_kv, KeyValue::new("delivery.outcome", "sent")],
                );
                span.record("delivery.succeeded", true);
                tracing::info!(
                    attempts = outcome.attempts,
                    message_id = message_id.as_deref().unwrap_or(""),
                    "Report delivered"
                );
                (
                    DeliveryOutcome {
                        attempted: true,
                        succeeded: true,
                        provider_message_id: message_id,
                        failure_reason: None,
                        attempts: outcome.attempts,
                    },
                    None,
                )
            }
            Err(error) => {
                DELIVERY_ATTEMPTS.add(
                    u64::from(outcome.attempts),
                    &[provider_kv, KeyValue::new("delivery.outcome", error.code())],
                );
                span.record("delivery.succeeded", false);
                tracing::warn!(
                    attempts = outcome.attempts,
                    code = error.code(),
                    error = %error,
                    "Report delivery failed"
                );
                (
                    DeliveryOutcome {
                        attempted: true,
                        succeeded: false,
                        provider_message_id: None,
                        failure_reason: Some(error.code().to_string()),
                        attempts: outcome.attempts,
                    },
                    Some(error),
                )
            }
        }
    }
}
