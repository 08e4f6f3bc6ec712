//! HTTP dispatcher for task deliveries.
//!
//! Issues exactly one request per call and turns whatever happened into an
//! `Attempt`. Retries, backoff and store writes belong to the execution loop.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use hooky_core::{Attempt, AttemptId, AttemptOutcome, Clock, Task};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, Url,
};
use tracing::{info_span, Instrument};

use crate::error::{DispatchError, SchedulerError};

/// Header carrying the task identifier on every delivery.
pub const TASK_ID_HEADER: &str = "X-Hooky-Task-Id";

/// Header carrying the 1-based attempt number within the current occurrence.
pub const ATTEMPT_HEADER: &str = "X-Hooky-Attempt";

/// Performs one delivery for a claimed task snapshot.
///
/// Implementations never touch the task store and never retry internally.
pub trait Dispatcher: Send + Sync + 'static {
    /// Delivers `task` once and reports the attempt.
    fn deliver<'a>(&'a self, task: &'a Task) -> Pin<Box<dyn Future<Output = Attempt> + Send + 'a>>;
}

/// What came back from an endpoint that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Leading bytes of the body, lossily decoded.
    pub excerpt: String,
    /// Error hit while reading the body, if any.
    pub body_error: Option<String>,
}

impl DispatchResponse {
    /// Returns true for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Builds the attempt record for one delivery.
///
/// A 2xx status is a success and any other status is retryable, whatever
/// the body looked like. Errors are retryable unless the request could not
/// be built at all.
pub fn build_attempt(
    task: &Task,
    started_at: DateTime<Utc>,
    elapsed: Duration,
    result: Result<DispatchResponse, DispatchError>,
) -> Attempt {
    let duration = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
    let (outcome, status_code, error_message, response_excerpt) = match result {
        Ok(response) => {
            let outcome = if response.is_success() {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::RetryableFailure
            };
            let excerpt = (!response.excerpt.is_empty()).then_some(response.excerpt);
            (outcome, Some(i32::from(response.status_code)), response.body_error, excerpt)
        },
        Err(err) => {
            let outcome = if err.is_retryable() {
                AttemptOutcome::RetryableFailure
            } else {
                AttemptOutcome::TerminalFailure
            };
            (outcome, None, Some(err.to_string()), None)
        },
    };

    Attempt {
        id: AttemptId::new(),
        task_id: task.id,
        sequence: task.next_sequence(),
        owner: task.reserved_by,
        started_at,
        duration_ms: duration.num_milliseconds(),
        outcome,
        status_code,
        error_message,
        response_excerpt,
        created_at: started_at + duration,
    }
}

/// Configuration for the HTTP dispatcher.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-call timeout covering connect, send and body read.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Bytes of response body kept on the attempt.
    pub response_excerpt_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("hooky/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            response_excerpt_bytes: 1024,
        }
    }
}

/// Dispatcher backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl HttpDispatcher {
    /// Creates a dispatcher with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig, clock: Arc<dyn Clock>) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| SchedulerError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config, clock })
    }

    async fn send(&self, task: &Task) -> Result<DispatchResponse, DispatchError> {
        let method = Method::from_bytes(task.method.as_bytes())
            .map_err(|_| DispatchError::invalid_request(format!("invalid method: {}", task.method)))?;
        let url = Url::parse(&task.url)
            .map_err(|e| DispatchError::invalid_request(format!("invalid url {}: {e}", task.url)))?;
        let headers = build_headers(task)?;

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(task.payload.clone())
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        let status_code = response.status().as_u16();
        tracing::debug!(status = status_code, "received response");

        let (excerpt, body_error) = read_excerpt(response, self.config.response_excerpt_bytes).await;
        if let Some(error) = &body_error {
            tracing::warn!(error = %error, "failed to read response body");
        }

        Ok(DispatchResponse { status_code, excerpt, body_error })
    }

    fn classify_transport_error(&self, err: &reqwest::Error) -> DispatchError {
        if err.is_timeout() {
            DispatchError::Timeout {
                timeout_ms: u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if err.is_builder() {
            DispatchError::invalid_request(err.to_string())
        } else if err.is_connect() {
            DispatchError::network(format!("connection failed: {err}"))
        } else {
            DispatchError::network(err.to_string())
        }
    }
}

impl Dispatcher for HttpDispatcher {
    fn deliver<'a>(&'a self, task: &'a Task) -> Pin<Box<dyn Future<Output = Attempt> + Send + 'a>> {
        let span = info_span!(
            "webhook_delivery",
            task_id = %task.id,
            url = %task.url,
            attempt = task.next_attempt()
        );

        Box::pin(
            async move {
                let started_at = self.clock.now_utc();
                let start = self.clock.now();

                let result = self.send(task).await;
                let elapsed = self.clock.now().saturating_duration_since(start);

                match &result {
                    Ok(response) if response.is_success() => {
                        tracing::info!(
                            status_code = response.status_code,
                            duration_ms = elapsed.as_millis(),
                            "webhook delivered"
                        );
                    },
                    Ok(response) => {
                        tracing::warn!(
                            status_code = response.status_code,
                            duration_ms = elapsed.as_millis(),
                            "endpoint returned non-success status"
                        );
                    },
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            duration_ms = elapsed.as_millis(),
                            "delivery failed"
                        );
                    },
                }

                build_attempt(task, started_at, elapsed, result)
            }
            .instrument(span),
        )
    }
}

fn build_headers(task: &Task) -> Result<HeaderMap, DispatchError> {
    let mut headers = HeaderMap::new();

    for (key, value) in task.headers() {
        if is_managed_header(key) {
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| DispatchError::invalid_request(format!("invalid header name: {key}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| DispatchError::invalid_request(format!("invalid value for header {key}")))?;
        headers.append(name, value);
    }

    let task_id = HeaderValue::from_str(&task.id.to_string())
        .map_err(|e| DispatchError::invalid_request(e.to_string()))?;
    headers.insert(TASK_ID_HEADER, task_id);
    headers.insert(ATTEMPT_HEADER, HeaderValue::from(task.next_attempt()));

    Ok(headers)
}

/// Reads at most `limit` bytes of the body, then stops.
async fn read_excerpt(mut response: reqwest::Response, limit: usize) -> (String, Option<String>) {
    let mut buf = BytesMut::with_capacity(limit.min(8 * 1024));

    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            },
            Ok(None) => break,
            Err(e) => return (String::from_utf8_lossy(&buf).into_owned(), Some(e.to_string())),
        }
    }

    (String::from_utf8_lossy(&buf).into_owned(), None)
}

/// Headers the dispatcher owns or that must not be forwarded hop-to-hop.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-hooky-task-id"
            | "x-hooky-attempt"
    )
}

#[cfg(test)]
mod tests {
    use hooky_core::{NewTask, OwnerId};

    use super::*;

    fn claimed_task() -> Task {
        let mut task =
            Task::pending(NewTask::new("https://example.com/hook"), Utc::now()).expect("valid task");
        task.reserved_by = Some(OwnerId::new());
        task.attempt_count = 2;
        task.last_sequence = 2;
        task
    }

    #[test]
    fn attempt_records_sequence_owner_and_duration() {
        let task = claimed_task();
        let started_at = Utc::now();
        let response =
            DispatchResponse { status_code: 204, excerpt: String::new(), body_error: None };

        let attempt = build_attempt(&task, started_at, Duration::from_millis(1_500), Ok(response));

        assert_eq!(attempt.sequence, 3);
        assert_eq!(attempt.owner, task.reserved_by);
        assert_eq!(attempt.outcome, AttemptOutcome::Success);
        assert_eq!(attempt.duration_ms, 1_500);
        assert_eq!(attempt.created_at, started_at + chrono::Duration::milliseconds(1_500));
        assert!(attempt.response_excerpt.is_none());
    }

    #[test]
    fn non_success_status_is_retryable_regardless_of_body() {
        let response = DispatchResponse {
            status_code: 500,
            excerpt: "partial".into(),
            body_error: Some("connection reset".into()),
        };

        let attempt = build_attempt(&claimed_task(), Utc::now(), Duration::ZERO, Ok(response));

        assert_eq!(attempt.outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(attempt.status_code, Some(500));
        assert_eq!(attempt.response_excerpt.as_deref(), Some("partial"));
        assert_eq!(attempt.error_message.as_deref(), Some("connection reset"));
    }

    #[test]
    fn request_construction_errors_are_terminal() {
        let err = DispatchError::invalid_request("invalid method: P OST");

        let attempt = build_attempt(&claimed_task(), Utc::now(), Duration::ZERO, Err(err));

        assert_eq!(attempt.outcome, AttemptOutcome::TerminalFailure);
        assert!(attempt.status_code.is_none());
    }

    #[test]
    fn invalid_header_is_rejected() {
        let mut task = claimed_task();
        task.headers.0.insert("bad header".into(), "value".into());

        assert!(matches!(build_headers(&task), Err(DispatchError::InvalidRequest { .. })));
    }

    #[test]
    fn managed_headers_are_not_forwarded() {
        let mut task = claimed_task();
        task.headers.0.insert("Host".into(), "evil.example".into());
        task.headers.0.insert("X-Hooky-Attempt".into(), "99".into());
        task.headers.0.insert("X-Custom".into(), "kept".into());

        let headers = build_headers(&task).expect("valid headers");

        assert!(headers.get("host").is_none());
        assert_eq!(headers.get(ATTEMPT_HEADER).and_then(|v| v.to_str().ok()), Some("3"));
        assert_eq!(headers.get("x-custom").and_then(|v| v.to_str().ok()), Some("kept"));
        assert_eq!(
            headers.get(TASK_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some(task.id.to_string().as_str())
        );
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("TRANSFER-ENCODING"));
        assert!(!is_managed_header("Authorization"));
        assert!(!is_managed_header("X-Custom-Header"));
    }
}
