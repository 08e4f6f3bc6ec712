//! Integration tests for the HTTP dispatcher against a mock endpoint.

use std::{sync::Arc, time::Duration};

use hooky_core::{AttemptOutcome, Clock, RealClock, Task};
use hooky_scheduler::{ClientConfig, Dispatcher, HttpDispatcher};
use hooky_testing::TaskBuilder;
use wiremock::{
    matchers::{body_string, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn dispatcher(config: ClientConfig) -> HttpDispatcher {
    HttpDispatcher::new(config, Arc::new(RealClock::new())).expect("client should build")
}

fn task_for(server: &MockServer, builder: TaskBuilder) -> Task {
    builder.url(format!("{}/hook", server.uri())).build(RealClock::new().now_utc())
}

#[tokio::test]
async fn delivers_task_with_identity_headers() {
    let server = MockServer::start().await;
    let task = task_for(&server, TaskBuilder::new().header("X-Custom", "yes"));

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("X-Hooky-Task-Id", task.id.to_string().as_str()))
        .and(header("X-Hooky-Attempt", "1"))
        .and(header("X-Custom", "yes"))
        .and(header("Content-Type", "application/json"))
        .and(body_string(r#"{"event":"test"}"#))
        .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
        .expect(1)
        .mount(&server)
        .await;

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::Success);
    assert_eq!(attempt.status_code, Some(200));
    assert_eq!(attempt.response_excerpt.as_deref(), Some("accepted"));
    assert_eq!(attempt.task_id, task.id);
    assert_eq!(attempt.sequence, 1);
    assert!(attempt.error_message.is_none());
    assert!(attempt.duration_ms >= 0);
}

#[tokio::test]
async fn attempt_header_tracks_attempt_number() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(header("X-Hooky-Attempt", "3"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let task = task_for(&server, TaskBuilder::new().method("PUT").attempt_count(2));

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::Success);
    assert_eq!(attempt.sequence, 3);
    assert!(attempt.response_excerpt.is_none());
}

#[tokio::test]
async fn task_headers_cannot_override_managed_headers() {
    let server = MockServer::start().await;
    Mock::given(header("X-Hooky-Attempt", "1"))
        .and(header("User-Agent", concat!("hooky/", env!("CARGO_PKG_VERSION"))))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let task = task_for(
        &server,
        TaskBuilder::new().header("x-hooky-attempt", "99").header("User-Agent", "spoofed"),
    );

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn non_success_status_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    let task = task_for(&server, TaskBuilder::new());

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::RetryableFailure);
    assert_eq!(attempt.status_code, Some(500));
    assert_eq!(attempt.response_excerpt.as_deref(), Some("boom"));
}

#[tokio::test]
async fn client_errors_are_retryable_too() {
    let server = MockServer::start().await;
    Mock::given(path("/hook")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
    let task = task_for(&server, TaskBuilder::new());

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::RetryableFailure);
    assert_eq!(attempt.status_code, Some(404));
}

#[tokio::test]
async fn response_excerpt_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a".repeat(5_000)))
        .mount(&server)
        .await;
    let task = task_for(&server, TaskBuilder::new());
    let config = ClientConfig { response_excerpt_bytes: 16, ..ClientConfig::default() };

    let attempt = dispatcher(config).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::Success);
    assert_eq!(attempt.response_excerpt.as_deref(), Some("a".repeat(16).as_str()));
}

#[tokio::test]
async fn slow_endpoint_times_out_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    let task = task_for(&server, TaskBuilder::new());
    let config = ClientConfig { timeout: Duration::from_millis(100), ..ClientConfig::default() };

    let attempt = dispatcher(config).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::RetryableFailure);
    assert_eq!(attempt.status_code, None);
    assert!(attempt.error_message.is_some());
    assert!(attempt.duration_ms < 2_000);
}

#[tokio::test]
async fn unreachable_endpoint_is_retryable() {
    let task = TaskBuilder::new().url("http://127.0.0.1:1/hook").build(RealClock::new().now_utc());

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::RetryableFailure);
    assert_eq!(attempt.status_code, None);
    assert!(attempt.error_message.is_some());
}

#[tokio::test]
async fn malformed_request_is_terminal() {
    let server = MockServer::start().await;
    let task = task_for(&server, TaskBuilder::new().header("bad header", "x"));

    let attempt = dispatcher(ClientConfig::default()).deliver(&task).await;

    assert_eq!(attempt.outcome, AttemptOutcome::TerminalFailure);
    assert!(attempt.error_message.is_some_and(|message| message.contains("header")));
    assert!(server.received_requests().await.is_some_and(|requests| requests.is_empty()));
}
