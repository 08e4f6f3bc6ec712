//! Task builders with sensible defaults for test setup.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hooky_core::{models::Json, BackoffPolicy, NewTask, OwnerId, Task, TaskStatus};

/// Builder for test tasks.
///
/// Defaults to a one-shot POST to `http://localhost/hook`, due immediately,
/// with three attempts and a zero constant backoff so retries are due again
/// without moving the clock.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    new: NewTask,
    backoff: Option<BackoffPolicy>,
    reserved: Option<(OwnerId, DateTime<Utc>)>,
    attempt_count: i32,
}

impl TaskBuilder {
    /// Creates a builder with test defaults.
    pub fn new() -> Self {
        let mut new = NewTask::new("http://localhost/hook");
        new.max_attempts = 3;
        new.payload = br#"{"event":"test"}"#.to_vec();
        new.headers = HashMap::from([("Content-Type".to_string(), "application/json".to_string())]);

        Self {
            new,
            backoff: Some(BackoffPolicy::Constant { delay_ms: 0 }),
            reserved: None,
            attempt_count: 0,
        }
    }

    /// Sets the destination URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.new.url = url.into();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.new.method = method.into();
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.new.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.new.payload = payload.into();
        self
    }

    /// Sets when the task is first due.
    #[must_use]
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.new.run_at = Some(run_at);
        self
    }

    /// Makes the task recurring.
    #[must_use]
    pub fn every(mut self, interval: chrono::Duration) -> Self {
        self.new.interval_ms = Some(interval.num_milliseconds());
        self
    }

    /// Sets the attempt limit. Zero means unlimited.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.new.max_attempts = max_attempts;
        self
    }

    /// Sets the retry policy, or `None` to fall back to the scheduler
    /// default. Unlike task creation, a zero delay is allowed.
    #[must_use]
    pub fn backoff(mut self, backoff: Option<BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Starts the task out as already attempted `count` times in its current
    /// occurrence, with that many attempts in its history.
    #[must_use]
    pub fn attempt_count(mut self, count: i32) -> Self {
        self.attempt_count = count;
        self
    }

    /// Starts the task out Reserved by `owner` until `until`.
    #[must_use]
    pub fn reserved_by(mut self, owner: OwnerId, until: DateTime<Utc>) -> Self {
        self.reserved = Some((owner, until));
        self
    }

    /// Returns the creation request without building a task. A zero-delay
    /// backoff is dropped since task creation would reject it.
    pub fn into_new_task(self) -> NewTask {
        let mut new = self.new;
        new.backoff = self.backoff.filter(|policy| policy.validate().is_ok());
        new
    }

    /// Builds the task as if created at `now`.
    ///
    /// # Panics
    ///
    /// Panics if the configured fields do not validate.
    pub fn build(self, now: DateTime<Utc>) -> Task {
        let mut task = Task::pending(self.new, now).expect("test task should be valid");
        task.backoff = self.backoff.map(Json);
        task.attempt_count = self.attempt_count;
        task.last_sequence = self.attempt_count;
        if let Some((owner, until)) = self.reserved {
            task.status = TaskStatus::Reserved;
            task.reserved_by = Some(owner);
            task.reserved_until = Some(until);
        }
        task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_due_pending_task() {
        let now = Utc::now();
        let task = TaskBuilder::new().build(now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.run_at, now);
        assert_eq!(task.method, "POST");
        assert!(task.is_claimable(now));
    }

    #[test]
    fn reserved_tasks_carry_their_lease() {
        let now = Utc::now();
        let owner = OwnerId::new();
        let until = now + chrono::Duration::seconds(30);

        let task = TaskBuilder::new().reserved_by(owner, until).build(now);

        assert!(task.is_reserved_by(owner));
        assert!(!task.is_claimable(now));
        assert!(task.is_claimable(until + chrono::Duration::milliseconds(1)));
    }
}
