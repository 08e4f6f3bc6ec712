//! Test infrastructure for the hooky scheduler.
//!
//! Provides task builders, a scripted dispatcher, and `TestEnv`, which wires
//! an in-memory store and a manually driven clock into a scheduler. Tests
//! drive it deterministically through `Scheduler::run_once` and
//! `TestClock::advance`.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hooky_core::{Attempt, Clock, Task, TaskId};
use hooky_scheduler::{storage::mock::MockTaskStore, Scheduler, SchedulerConfig};

pub mod dispatcher;
pub mod fixtures;

pub use dispatcher::{Reply, StubDispatcher};
pub use fixtures::TaskBuilder;
pub use hooky_core::TestClock;
pub use hooky_scheduler::storage::mock::Operation;

/// In-memory scheduler environment.
///
/// Clones of the clock, store and dispatcher are shared with every scheduler
/// built from this environment, so a test can inspect and steer them while
/// the scheduler runs.
pub struct TestEnv {
    /// Manually driven clock.
    pub clock: TestClock,
    /// In-memory task store.
    pub store: MockTaskStore,
    /// Scripted dispatcher, answering 200 by default.
    pub dispatcher: Arc<StubDispatcher>,
}

impl TestEnv {
    /// Creates an empty environment.
    pub fn new() -> Self {
        let clock = TestClock::new();
        let store = MockTaskStore::new(Arc::new(clock.clone()));
        let dispatcher = Arc::new(StubDispatcher::new(Arc::new(clock.clone())));
        Self { clock, store, dispatcher }
    }

    /// Scheduler config suited to deterministic tests: a single worker of
    /// each kind and short periods.
    pub fn config() -> SchedulerConfig {
        SchedulerConfig {
            reservation_workers: 1,
            execution_workers: 1,
            batch_size: 10,
            handoff_capacity: 10,
            poll_interval: Duration::from_millis(10),
            lease_duration: Duration::from_secs(30),
            touch_interval: Duration::from_secs(5),
            attempt_retention: Duration::from_secs(3600),
            retention_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            ..SchedulerConfig::default()
        }
    }

    /// Builds a scheduler over this environment with `TestEnv::config`.
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler rejects the configuration.
    pub fn scheduler(&self) -> Result<Scheduler> {
        self.scheduler_with(Self::config())
    }

    /// Builds a scheduler over this environment with a custom config.
    ///
    /// # Errors
    ///
    /// Returns error if the scheduler rejects the configuration.
    pub fn scheduler_with(&self, config: SchedulerConfig) -> Result<Scheduler> {
        Scheduler::new(
            Arc::new(self.store.clone()),
            self.dispatcher.clone(),
            config,
            Arc::new(self.clock.clone()),
        )
        .context("failed to build scheduler")
    }

    /// Builds a task as of the current test time and stores it.
    pub async fn insert(&self, builder: TaskBuilder) -> Task {
        let task = builder.build(self.clock.now_utc());
        self.store.insert_task(task.clone()).await;
        task
    }

    /// Current state of a stored task.
    ///
    /// # Errors
    ///
    /// Returns error if the task does not exist.
    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .tasks()
            .await
            .into_iter()
            .find(|task| task.id == task_id)
            .with_context(|| format!("task {task_id} not found"))
    }

    /// Attempts recorded for a task, in recording order.
    pub async fn attempts(&self, task_id: TaskId) -> Vec<Attempt> {
        self.store.attempts().await.into_iter().filter(|a| a.task_id == task_id).collect()
    }

    /// Moves test time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
