//! Scripted dispatcher for driving the scheduler without a network.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use hooky_core::{Attempt, Clock, Task, TaskId};
use hooky_scheduler::{client::build_attempt, DispatchError, DispatchResponse, Dispatcher};

type Hook = Arc<dyn Fn(Task) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One scripted delivery result.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The endpoint answered with this status.
    Status(u16),
    /// The request failed without a response.
    Error(DispatchError),
}

impl Reply {
    /// Transport failure that should be retried.
    pub fn network_error() -> Self {
        Self::Error(DispatchError::network("connection refused"))
    }

    /// Request that can never succeed.
    pub fn invalid_request() -> Self {
        Self::Error(DispatchError::invalid_request("unsupported url"))
    }
}

/// Dispatcher that replays a script of replies.
///
/// Replies are consumed in order; once the script runs out every delivery
/// gets the fallback reply (200 unless changed). Attempts are built with the
/// same classification as the HTTP dispatcher.
pub struct StubDispatcher {
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Reply>,
    delay: Mutex<Duration>,
    delivered: Mutex<Vec<TaskId>>,
    hook: Mutex<Option<Hook>>,
}

impl std::fmt::Debug for StubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubDispatcher").field("calls", &self.calls()).finish_non_exhaustive()
    }
}

impl StubDispatcher {
    /// Creates a dispatcher answering 200 to everything.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Reply::Status(200)),
            delay: Mutex::new(Duration::ZERO),
            delivered: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        }
    }

    /// Queues replies for the next deliveries.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        lock(&self.script).extend(replies);
    }

    /// Sets the reply used once the script is exhausted.
    pub fn respond_with(&self, reply: Reply) {
        *lock(&self.fallback) = reply;
    }

    /// Makes every delivery take `delay` of real time.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Runs `hook` inside every delivery, before the reply is produced.
    pub fn on_deliver<F, Fut>(&self, hook: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |task| Box::pin(hook(task)));
        *lock(&self.hook) = Some(hook);
    }

    /// Number of deliveries so far.
    pub fn calls(&self) -> usize {
        lock(&self.delivered).len()
    }

    /// Task IDs in delivery order.
    pub fn delivered(&self) -> Vec<TaskId> {
        lock(&self.delivered).clone()
    }

    fn next_reply(&self) -> Reply {
        let scripted = lock(&self.script).pop_front();
        scripted.unwrap_or_else(|| lock(&self.fallback).clone())
    }
}

impl Dispatcher for StubDispatcher {
    fn deliver<'a>(&'a self, task: &'a Task) -> Pin<Box<dyn Future<Output = Attempt> + Send + 'a>> {
        Box::pin(async move {
            let started_at = self.clock.now_utc();
            let started = self.clock.now();
            lock(&self.delivered).push(task.id);

            let hook = lock(&self.hook).clone();
            if let Some(hook) = hook {
                hook(task.clone()).await;
            }

            let delay = *lock(&self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = match self.next_reply() {
                Reply::Status(status_code) => {
                    Ok(DispatchResponse { status_code, excerpt: String::new(), body_error: None })
                },
                Reply::Error(error) => Err(error),
            };
            tracing::debug!(task_id = %task.id, ?result, "stub delivery");

            build_attempt(task, started_at, self.clock.now().duration_since(started), result)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use hooky_core::{AttemptOutcome, TestClock};

    use super::*;
    use crate::TaskBuilder;

    #[tokio::test]
    async fn replays_script_then_falls_back() {
        let clock = Arc::new(TestClock::new());
        let dispatcher = StubDispatcher::new(clock.clone());
        dispatcher.script([Reply::Status(500), Reply::network_error()]);
        let task = TaskBuilder::new().build(clock.now_utc());

        let first = dispatcher.deliver(&task).await;
        let second = dispatcher.deliver(&task).await;
        let third = dispatcher.deliver(&task).await;

        assert_eq!(first.outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(first.status_code, Some(500));
        assert_eq!(second.outcome, AttemptOutcome::RetryableFailure);
        assert_eq!(second.status_code, None);
        assert_eq!(third.outcome, AttemptOutcome::Success);
        assert_eq!(dispatcher.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_requests_are_terminal() {
        let clock = Arc::new(TestClock::new());
        let dispatcher = StubDispatcher::new(clock.clone());
        dispatcher.respond_with(Reply::invalid_request());
        let task = TaskBuilder::new().build(clock.now_utc());

        let attempt = dispatcher.deliver(&task).await;

        assert_eq!(attempt.outcome, AttemptOutcome::TerminalFailure);
        assert_eq!(attempt.sequence, 1);
        assert_eq!(dispatcher.delivered(), vec![task.id]);
    }
}
