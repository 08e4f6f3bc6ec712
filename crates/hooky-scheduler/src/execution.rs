//! Execution workers: deliver claimed tasks and write the outcome back.
//!
//! Each claim is handled strictly in order: dispatch, append the attempt,
//! then `complete`. A `complete` rejected because the lease moved to another
//! owner is an expected race and is only logged at debug level. A claim whose
//! outcome cannot be written is handed back to Pending.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hooky_core::{AttemptOutcome, Completion, Task};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{backoff::Backoff, client::Dispatcher, error::Result, scheduler::Shared};

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The completion was written.
    Completed(Completion),
    /// Another owner holds the lease now; the attempt was still recorded.
    LeaseLost,
}

/// Picks the state transition for a task whose attempt ended with `outcome`.
///
/// Recurring tasks re-arm at exactly one interval after their previous
/// `run_at`. Retries are scheduled `backoff(attempt)` after `now`, where
/// `attempt` is the number of the attempt that just failed.
pub fn decide(
    task: &Task,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
    default_backoff: &dyn Backoff,
) -> Completion {
    match outcome {
        AttemptOutcome::Success => match task.interval() {
            Some(interval) => Completion::Rearm { run_at: task.run_at + interval },
            None => Completion::Finished,
        },
        AttemptOutcome::TerminalFailure => Completion::Failed,
        AttemptOutcome::RetryableFailure if task.is_last_attempt() => Completion::Failed,
        AttemptOutcome::RetryableFailure => {
            let attempt = u32::try_from(task.next_attempt()).unwrap_or(u32::MAX);
            let delay = match task.backoff_policy() {
                Some(policy) => policy.delay(attempt),
                None => default_backoff.delay(attempt),
            };
            let run_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            Completion::Retry { run_at }
        },
    }
}

/// Runs one claimed task through dispatch, attempt recording and completion.
///
/// # Errors
///
/// Returns a store error if the attempt or the completion could not be
/// written. The task has then been handed back to Pending (or parked for the
/// heartbeat to release) and will be delivered again.
pub(crate) async fn execute(
    shared: &Shared,
    dispatcher: &dyn Dispatcher,
    task: Task,
) -> Result<Execution> {
    let task_id = task.id;
    let result = record(shared, dispatcher, task).await;
    if result.is_err() {
        shared.abandon(task_id).await;
    }
    result
}

async fn record(shared: &Shared, dispatcher: &dyn Dispatcher, task: Task) -> Result<Execution> {
    shared.stats.write().await.in_flight += 1;
    let attempt = dispatcher.deliver(&task).await;
    shared.stats.write().await.in_flight -= 1;

    let outcome = attempt.outcome;
    let sequence = shared.store.append_attempt(attempt).await?;

    let now = shared.clock.now_utc();
    let completion = decide(&task, outcome, now, shared.config.default_backoff.as_ref());
    let applied = shared.store.complete(task.id, shared.owner, completion).await?;

    let mut stats = shared.stats.write().await;
    if !applied {
        stats.lease_lost += 1;
        debug!(task_id = %task.id, owner = %shared.owner, "lease lost before completion");
        return Ok(Execution::LeaseLost);
    }

    match completion {
        Completion::Finished | Completion::Rearm { .. } => stats.delivered += 1,
        Completion::Retry { .. } => stats.retried += 1,
        Completion::Failed => stats.failed += 1,
    }
    debug!(
        task_id = %task.id,
        attempt = sequence,
        outcome = %outcome,
        ?completion,
        "task completed"
    );

    Ok(Execution::Completed(completion))
}

/// One of the M workers draining the handoff queue.
pub(crate) struct ExecutionWorker {
    id: usize,
    shared: Arc<Shared>,
    dispatcher: Arc<dyn Dispatcher>,
    queue: Arc<Mutex<mpsc::Receiver<Task>>>,
    cancellation_token: CancellationToken,
}

impl ExecutionWorker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        dispatcher: Arc<dyn Dispatcher>,
        queue: Arc<Mutex<mpsc::Receiver<Task>>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, shared, dispatcher, queue, cancellation_token }
    }

    /// Pulls tasks until cancelled or the queue closes.
    ///
    /// A delivery already in progress when cancellation arrives runs to
    /// completion; tasks still queued are left for the scheduler to release.
    pub(crate) async fn run(self) -> Result<()> {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    () = self.cancellation_token.cancelled() => None,
                    task = queue.recv() => task,
                }
            };

            let Some(task) = next else {
                break;
            };

            let task_id = task.id;
            if let Err(error) = execute(&self.shared, self.dispatcher.as_ref(), task).await {
                warn!(
                    worker_id = self.id,
                    task_id = %task_id,
                    error = %error,
                    "failed to record task outcome, task handed back"
                );
            }
        }

        info!(worker_id = self.id, "execution worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hooky_core::{models::Json, BackoffPolicy, NewTask};

    use super::*;
    use crate::backoff::FnBackoff;

    fn task(max_attempts: i32, attempt_count: i32) -> Task {
        let mut new = NewTask::new("https://example.com/hook");
        new.max_attempts = max_attempts;
        let mut task = Task::pending(new, Utc::now()).expect("valid task");
        task.attempt_count = attempt_count;
        task
    }

    fn seconds(attempt: u32) -> Duration {
        Duration::from_secs(u64::from(attempt))
    }

    #[test]
    fn success_finishes_one_shot_tasks() {
        let backoff = FnBackoff::new(seconds);
        assert_eq!(
            decide(&task(3, 0), AttemptOutcome::Success, Utc::now(), &backoff),
            Completion::Finished
        );
    }

    #[test]
    fn success_rearms_from_previous_run_at() {
        let backoff = FnBackoff::new(seconds);
        let mut recurring = task(3, 1);
        recurring.interval_ms = Some(60_000);
        let now = recurring.run_at + chrono::Duration::seconds(7);

        let completion = decide(&recurring, AttemptOutcome::Success, now, &backoff);

        assert_eq!(
            completion,
            Completion::Rearm { run_at: recurring.run_at + chrono::Duration::seconds(60) }
        );
    }

    #[test]
    fn retry_uses_default_backoff_for_attempt_number() {
        let backoff = FnBackoff::new(seconds);
        let now = Utc::now();

        let completion = decide(&task(5, 1), AttemptOutcome::RetryableFailure, now, &backoff);

        assert_eq!(completion, Completion::Retry { run_at: now + chrono::Duration::seconds(2) });
    }

    #[test]
    fn task_backoff_overrides_default() {
        let backoff = FnBackoff::new(seconds);
        let mut custom = task(5, 0);
        custom.backoff = Some(Json(BackoffPolicy::Constant { delay_ms: 250 }));
        let now = Utc::now();

        let completion = decide(&custom, AttemptOutcome::RetryableFailure, now, &backoff);

        assert_eq!(
            completion,
            Completion::Retry { run_at: now + chrono::Duration::milliseconds(250) }
        );
    }

    #[test]
    fn exhausted_or_terminal_failures_fail_the_task() {
        let backoff = FnBackoff::new(seconds);
        let now = Utc::now();

        let exhausted = decide(&task(3, 2), AttemptOutcome::RetryableFailure, now, &backoff);
        let single = decide(&task(1, 0), AttemptOutcome::RetryableFailure, now, &backoff);
        let terminal = decide(&task(0, 0), AttemptOutcome::TerminalFailure, now, &backoff);

        assert_eq!(exhausted, Completion::Failed);
        assert_eq!(single, Completion::Failed);
        assert_eq!(terminal, Completion::Failed);
    }

    #[test]
    fn unlimited_attempts_keep_retrying() {
        let backoff = FnBackoff::new(seconds);
        let completion =
            decide(&task(0, 10_000), AttemptOutcome::RetryableFailure, Utc::now(), &backoff);

        assert!(matches!(completion, Completion::Retry { .. }));
    }
}
