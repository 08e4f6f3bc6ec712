//! Core domain models and strongly-typed identifiers.
//!
//! Defines scheduled webhook tasks, their delivery attempts, and newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and the lease-state helpers used by the reservation protocol.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
pub use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Implements the boilerplate shared by all UUID-backed identifiers.
macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

/// Strongly-typed task identifier.
///
/// Assigned at creation and immutable for the life of the task. Also the
/// secondary sort key when several tasks are equally due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

uuid_id!(TaskId);

/// Strongly-typed attempt identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub Uuid);

uuid_id!(AttemptId);

/// Identity of a scheduler process holding leases.
///
/// Every running scheduler picks a fresh owner ID at construction. A lease is
/// only honoured for the owner recorded in `reserved_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

uuid_id!(OwnerId);

/// Task lifecycle status.
///
/// ```text
/// Pending -> Reserved -> Finished
///    ^          |     -> Failed
///    └──────────┘ (retry, recurrence, release, lease expiry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `run_at` to pass and a worker to claim it.
    Pending,

    /// Claimed by exactly one owner until `reserved_until`.
    Reserved,

    /// Delivered successfully. Terminal for one-shot tasks.
    Finished,

    /// Gave up after exhausting attempts or hitting a terminal error.
    Failed,
}

impl TaskStatus {
    /// Returns the database representation of this status.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states no scheduler will move the task out of.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for TaskStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TaskStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "reserved" => Ok(Self::Reserved),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid task status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for TaskStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Retry delay policy stored alongside a task.
///
/// Evaluated by the scheduler after a retryable failure to pick the next
/// `run_at`. Parameters are milliseconds so the JSON form stays compact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Constant {
        /// Delay in milliseconds.
        delay_ms: u64,
    },

    /// `min * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure, in milliseconds.
        min_ms: u64,
        /// Upper bound for any delay, in milliseconds.
        max_ms: u64,
        /// Growth factor between consecutive attempts.
        factor: f64,
    },
}

impl BackoffPolicy {
    /// Checks that the policy produces strictly positive, non-decreasing
    /// delays.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the offending parameter.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Constant { delay_ms } if *delay_ms == 0 => {
                Err(CoreError::InvalidInput("constant backoff delay must be positive".into()))
            },
            Self::Exponential { min_ms, .. } if *min_ms == 0 => {
                Err(CoreError::InvalidInput("exponential backoff min must be positive".into()))
            },
            Self::Exponential { min_ms, max_ms, .. } if max_ms < min_ms => Err(
                CoreError::InvalidInput("exponential backoff max must be >= min".into()),
            ),
            Self::Exponential { factor, .. } if !factor.is_finite() || *factor < 1.0 => Err(
                CoreError::InvalidInput("exponential backoff factor must be >= 1.0".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Durable record describing one (possibly recurring) webhook delivery.
///
/// The task store owns this state; schedulers only ever hold snapshots
/// returned by `reserve` for the duration of one execution.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,

    /// Destination URL.
    pub url: String,

    /// HTTP method used for delivery.
    pub method: String,

    /// Request headers sent with every attempt.
    pub headers: Json<HashMap<String, String>>,

    /// Raw request body.
    pub payload: Vec<u8>,

    /// Next time this task is due.
    pub run_at: DateTime<Utc>,

    /// Recurrence period in milliseconds. `None` for one-shot tasks.
    pub interval_ms: Option<i64>,

    /// Attempts allowed per occurrence. Zero means unlimited.
    pub max_attempts: i32,

    /// Retry policy. `None` falls back to the scheduler default.
    pub backoff: Option<Json<BackoffPolicy>>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Owner of the live lease. Only set while `Reserved`.
    pub reserved_by: Option<OwnerId>,

    /// Lease expiry. Only set while `Reserved`.
    pub reserved_until: Option<DateTime<Utc>>,

    /// Attempts made for the current occurrence. Reset on re-arm.
    pub attempt_count: i32,

    /// Sequence number of the latest attempt across all occurrences. Never
    /// reset, so attempt history stays strictly ordered.
    pub last_sequence: i32,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task row last changed.
    pub updated_at: DateTime<Utc>,

    /// When the last attempt completed.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the task reached `Finished` or `Failed`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Materialises a new pending task from an administrative request.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the request fails validation.
    pub fn pending(new: NewTask, now: DateTime<Utc>) -> Result<Self> {
        new.validate()?;

        Ok(Self {
            id: TaskId::new(),
            url: new.url,
            method: new.method.to_ascii_uppercase(),
            headers: Json(new.headers),
            payload: new.payload,
            run_at: new.run_at.unwrap_or(now),
            interval_ms: new.interval_ms,
            max_attempts: new.max_attempts,
            backoff: new.backoff.map(Json),
            status: TaskStatus::Pending,
            reserved_by: None,
            reserved_until: None,
            attempt_count: 0,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            finished_at: None,
        })
    }

    /// Request headers as a regular map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Recurrence period, if this task repeats.
    pub fn interval(&self) -> Option<chrono::Duration> {
        self.interval_ms.filter(|ms| *ms > 0).map(chrono::Duration::milliseconds)
    }

    /// Stored retry policy, if any.
    pub fn backoff_policy(&self) -> Option<&BackoffPolicy> {
        self.backoff.as_ref().map(|json| &json.0)
    }

    /// Sequence number the next attempt will carry.
    pub fn next_sequence(&self) -> i32 {
        self.last_sequence.saturating_add(1)
    }

    /// 1-based number of the next attempt within the current occurrence.
    pub fn next_attempt(&self) -> i32 {
        self.attempt_count.saturating_add(1)
    }

    /// Returns true if one more failed attempt exhausts the task.
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts > 0 && self.next_attempt() >= self.max_attempts
    }

    /// Returns true if `reserve` may claim this task at `now`.
    ///
    /// Pending tasks are claimable once due; reserved tasks become claimable
    /// again once their lease has lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending => self.run_at <= now,
            TaskStatus::Reserved => self.reserved_until.is_some_and(|until| until < now),
            TaskStatus::Finished | TaskStatus::Failed => false,
        }
    }

    /// Returns true if `owner` currently holds the lease.
    pub fn is_reserved_by(&self, owner: OwnerId) -> bool {
        self.status == TaskStatus::Reserved && self.reserved_by == Some(owner)
    }
}

/// Administrative request to create a task.
///
/// Tasks are always created `Pending`; only the reservation protocol moves a
/// task to `Reserved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Destination URL (http or https).
    pub url: String,

    /// HTTP method. Defaults to `POST`.
    #[serde(default = "default_method")]
    pub method: String,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body.
    #[serde(default)]
    pub payload: Vec<u8>,

    /// First due time. Defaults to creation time.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,

    /// Recurrence period in milliseconds.
    #[serde(default)]
    pub interval_ms: Option<i64>,

    /// Attempts allowed per occurrence. Zero means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Retry policy override.
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_max_attempts() -> i32 {
    10
}

impl NewTask {
    /// Creates a request with defaults for everything but the URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: HashMap::new(),
            payload: Vec::new(),
            run_at: None,
            interval_ms: None,
            max_attempts: default_max_attempts(),
            backoff: None,
        }
    }

    /// Validates the request before it is persisted.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for unsupported URLs, empty or
    /// malformed methods, negative attempt limits, non-positive intervals,
    /// and invalid backoff parameters.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::InvalidInput(format!("unsupported url: {url}")));
        }

        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(CoreError::InvalidInput(format!("invalid method: {}", self.method)));
        }

        if self.max_attempts < 0 {
            return Err(CoreError::InvalidInput("max_attempts must not be negative".into()));
        }

        if let Some(interval_ms) = self.interval_ms {
            if interval_ms <= 0 {
                return Err(CoreError::InvalidInput("interval must be positive".into()));
            }
        }

        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }

        Ok(())
    }
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Endpoint answered with a 2xx status.
    Success,

    /// Non-2xx status, timeout or transport failure. Eligible for retry.
    RetryableFailure,

    /// Request could not be built. Never retried.
    TerminalFailure,
}

impl AttemptOutcome {
    /// Returns the database representation of this outcome.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::TerminalFailure => "terminal_failure",
        }
    }

    /// Returns true for a successful delivery.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for AttemptOutcome {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptOutcome {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "success" => Ok(Self::Success),
            "retryable_failure" => Ok(Self::RetryableFailure),
            "terminal_failure" => Ok(Self::TerminalFailure),
            _ => Err(format!("invalid attempt outcome: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptOutcome {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Immutable record of one delivery try.
///
/// Attempts are append-only. The store assigns sequence numbers from the
/// task's `last_sequence` counter as each attempt is written, so they
/// increase strictly per task across retries and recurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attempt {
    /// Unique identifier for this attempt.
    pub id: AttemptId,

    /// Task this attempt belongs to.
    pub task_id: TaskId,

    /// 1-based position in the task's whole history.
    pub sequence: i32,

    /// Scheduler that made the attempt.
    pub owner: Option<OwnerId>,

    /// When the request was issued.
    pub started_at: DateTime<Utc>,

    /// Wall time spent on the request.
    pub duration_ms: i64,

    /// Classified outcome.
    pub outcome: AttemptOutcome,

    /// HTTP status, when a response arrived.
    pub status_code: Option<i32>,

    /// Transport or request-construction error.
    pub error_message: Option<String>,

    /// Leading bytes of the response body.
    pub response_excerpt: Option<String>,

    /// When the attempt was recorded. Retention compares against this.
    pub created_at: DateTime<Utc>,
}

/// Outcome written back to a reserved task by its lease owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// One-shot task delivered. Moves to `Finished`.
    Finished,

    /// Recurring task delivered. Back to `Pending` at the next occurrence
    /// with the per-occurrence attempt counter reset.
    Rearm {
        /// Next occurrence.
        run_at: DateTime<Utc>,
    },

    /// Retryable failure. Back to `Pending` after the backoff delay.
    Retry {
        /// When the next attempt becomes due.
        run_at: DateTime<Utc>,
    },

    /// Attempts exhausted or terminal error. Moves to `Failed`.
    Failed,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn task_at(now: DateTime<Utc>) -> Task {
        Task::pending(NewTask::new("https://example.com/hook"), now).expect("valid task")
    }

    #[test]
    fn new_task_defaults_to_pending_post() {
        let now = Utc::now();
        let task = task_at(now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.method, "POST");
        assert_eq!(task.run_at, now);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.next_sequence(), 1);
        assert!(task.reserved_by.is_none());
        assert!(task.reserved_until.is_none());
    }

    #[test]
    fn validation_rejects_malformed_requests() {
        assert!(NewTask::new("ftp://example.com").validate().is_err());

        let mut bad_method = NewTask::new("https://example.com");
        bad_method.method = "PO ST".into();
        assert!(bad_method.validate().is_err());

        let mut bad_interval = NewTask::new("https://example.com");
        bad_interval.interval_ms = Some(0);
        assert!(bad_interval.validate().is_err());

        let mut bad_attempts = NewTask::new("https://example.com");
        bad_attempts.max_attempts = -1;
        assert!(bad_attempts.validate().is_err());
    }

    #[test]
    fn backoff_validation_requires_positive_growing_delays() {
        assert!(BackoffPolicy::Constant { delay_ms: 0 }.validate().is_err());
        assert!(BackoffPolicy::Constant { delay_ms: 5 }.validate().is_ok());
        assert!(BackoffPolicy::Exponential { min_ms: 10, max_ms: 5, factor: 2.0 }
            .validate()
            .is_err());
        assert!(BackoffPolicy::Exponential { min_ms: 10, max_ms: 50, factor: 0.5 }
            .validate()
            .is_err());
        assert!(BackoffPolicy::Exponential { min_ms: 10, max_ms: 50, factor: 2.0 }
            .validate()
            .is_ok());
    }

    #[test]
    fn claimability_follows_due_time_and_lease_expiry() {
        let now = Utc::now();
        let mut task = task_at(now + Duration::seconds(5));
        assert!(!task.is_claimable(now));
        assert!(task.is_claimable(now + Duration::seconds(5)));

        task.status = TaskStatus::Reserved;
        task.reserved_by = Some(OwnerId::new());
        task.reserved_until = Some(now + Duration::seconds(30));
        assert!(!task.is_claimable(now + Duration::seconds(30)));
        assert!(task.is_claimable(now + Duration::seconds(31)));

        task.status = TaskStatus::Failed;
        assert!(!task.is_claimable(now + Duration::days(1)));
    }

    #[test]
    fn last_attempt_respects_unlimited_retries() {
        let mut task = task_at(Utc::now());
        task.max_attempts = 3;
        task.attempt_count = 1;
        assert!(!task.is_last_attempt());
        task.attempt_count = 2;
        assert!(task.is_last_attempt());

        task.max_attempts = 0;
        task.attempt_count = 1_000;
        assert!(!task.is_last_attempt());
    }

    #[test]
    fn sequence_outlives_occurrence_counter() {
        let mut task = task_at(Utc::now());
        task.interval_ms = Some(60_000);
        task.last_sequence = 4;
        task.attempt_count = 0;

        assert_eq!(task.next_attempt(), 1);
        assert_eq!(task.next_sequence(), 5);
    }

    #[test]
    fn backoff_policy_serializes_with_kind_tag() {
        let policy = BackoffPolicy::Exponential { min_ms: 1_000, max_ms: 60_000, factor: 2.0 };
        let json = serde_json::to_value(&policy).expect("serializable");
        assert_eq!(json["kind"], "exponential");
        assert_eq!(json["min_ms"], 1_000);
    }
}
