//! Webhook channel against a mock HTTP server.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use chrono::Utc;
use notify_core::{Notification, NotificationType};
use notify_delivery::{
    channels::{WebhookChannel, WebhookConfig},
    DeliveryError, ErrorCategory, NotificationChannel,
};
use wiremock::{
    matchers::{body_string, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn webhook(url: &str) -> Notification {
    let payload = serde_json::json!({ "url": url, "body": r#"{"event":"order.paid"}"# });
    Notification::new(
        NotificationType::Webhook,
        "hooks@example.com",
        "client-1",
        payload.to_string(),
        "wh-1",
        Utc::now(),
    )
}

fn channel(timeout: Duration) -> WebhookChannel {
    WebhookChannel::new(WebhookConfig { timeout, ..WebhookConfig::default() }).unwrap()
}

#[tokio::test]
async fn posts_body_as_json_and_accepts_2xx() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(body_string(r#"{"event":"order.paid"}"#))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let result = channel(Duration::from_secs(5))
        .send(&webhook(&format!("{}/hook", server.uri())))
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn non_2xx_is_http_status_failure_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let error = channel(Duration::from_secs(5))
        .send(&webhook(&format!("{}/hook", server.uri())))
        .await
        .unwrap_err();

    match &error {
        DeliveryError::HttpStatus { status_code, body } => {
            assert_eq!(*status_code, 503);
            assert_eq!(body, "maintenance");
        },
        other => panic!("expected HttpStatus, got {other:?}"),
    }
    assert!(error.is_delivery_failure());
    assert_eq!(error.category(), ErrorCategory::Delivery);
}

#[tokio::test]
async fn long_error_body_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(5000)))
        .mount(&server)
        .await;

    let error = channel(Duration::from_secs(5))
        .send(&webhook(&format!("{}/hook", server.uri())))
        .await
        .unwrap_err();

    let DeliveryError::HttpStatus { body, .. } = error else {
        panic!("expected HttpStatus");
    };
    assert_eq!(body.len(), 1024);
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let error = channel(Duration::from_millis(100))
        .send(&webhook(&format!("{}/hook", server.uri())))
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::Timeout { timeout_ms: 100 }));
}

#[tokio::test]
async fn refused_connection_is_network_failure() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let error = channel(Duration::from_secs(2))
        .send(&webhook(&format!("http://127.0.0.1:{port}/hook")))
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::Network { .. }));
}

#[tokio::test]
async fn malformed_payload_fails_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut notification = webhook(&server.uri());
    notification.payload = r#"{"body":"{}"}"#.to_string();

    let error = channel(Duration::from_secs(5)).send(&notification).await.unwrap_err();

    assert!(matches!(error, DeliveryError::InvalidPayload { .. }));
}
