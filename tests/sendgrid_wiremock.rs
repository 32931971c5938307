//! SendGrid adapter and dispatcher against a mocked Mail Send API.

use std::sync::Arc;
use std::time::Duration;

use market_report_agent::delivery::sendgrid::SendGridProvider;
use market_report_agent::delivery::{DeliveryError, Dispatcher, EmailMessage, EmailProvider};
use market_report_agent::pipeline::Report;
use market_report_agent::retry::RetryPolicy;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

fn message() -> EmailMessage {
    EmailMessage {
        from: "reports@example.com".to_string(),
        to: "team@example.com".to_string(),
        subject: "Digital Market Intelligence (Detailed) - March 04, 2026".to_string(),
        html_body: "<h2>Executive Summary</h2>".to_string(),
    }
}

fn report() -> Report {
    let message = message();
    Report {
        html_body: message.html_body,
        subject: message.subject,
        sections: vec!["Executive Summary".to_string()],
    }
}

fn dispatcher(server: &MockServer) -> Dispatcher {
    let provider = SendGridProvider::new("SG.test-key").with_base_url(server.uri());
    Dispatcher::new(Arc::new(provider), "reports@example.com")
        .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
}

#[tokio::test]
async fn accepted_message_returns_message_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .and(header("authorization", "Bearer SG.test-key"))
        .and(body_partial_json(serde_json::json!({
            "personalizations": [{"to": [{"email": "team@example.com"}]}],
            "from": {"email": "reports@example.com"},
            "content": [{"type": "text/html"}]
        })))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "sg-abc123"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = SendGridProvider::new("SG.test-key").with_base_url(server.uri());
    let id = provider.send(&message()).await.unwrap();

    assert_eq!(id.as_deref(), Some("sg-abc123"));
}

#[tokio::test]
async fn bad_recipient_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "errors": [{
                "message": "Does not contain a valid address.",
                "field": "personalizations.0.to.0.email"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server).deliver(&report(), "team@example.com").await;

    assert!(outcome.attempted);
    assert!(!outcome.succeeded);
    assert_eq!(outcome.failure_reason.as_deref(), Some("invalid-recipient"));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn unverified_sender_maps_from_forbidden() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "errors": [{
                "message": "The from address does not match a verified Sender Identity.",
                "field": "from"
            }]
        })))
        .mount(&server)
        .await;

    let provider = SendGridProvider::new("SG.test-key").with_base_url(server.uri());
    let err = provider.send(&message()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::UnverifiedSender(_)));
}

#[tokio::test]
async fn server_errors_are_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server).deliver(&report(), "team@example.com").await;

    assert!(!outcome.succeeded);
    assert_eq!(outcome.failure_reason.as_deref(), Some("server-error"));
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test]
async fn rate_limit_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v3/mail/send"))
        .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "sg-retry"))
        .mount(&server)
        .await;

    let outcome = dispatcher(&server).deliver(&report(), "team@example.com").await;

    assert!(outcome.succeeded);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.provider_message_id.as_deref(), Some("sg-retry"));
}

#[tokio::test]
async fn malformed_recipient_never_reaches_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server).deliver(&report(), "not an address").await;

    assert!(!outcome.attempted);
    assert_eq!(outcome.failure_reason.as_deref(), Some("invalid-recipient"));
}
