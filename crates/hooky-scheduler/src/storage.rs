//! Task store abstraction used by the scheduler loops.
//!
//! The scheduler only talks to the store through `TaskStore`, so the same
//! loops run against PostgreSQL in production and against the in-memory
//! `mock::MockTaskStore` in tests. Every method is a single atomic step from
//! the caller's point of view; lease ownership is enforced here, not by
//! in-process locking.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hooky_core::{
    error::Result, storage::Storage, Attempt, Clock, Completion, CoreError, NewTask, OwnerId,
    Task, TaskId,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the scheduler.
pub trait TaskStore: Send + Sync + 'static {
    /// Atomically claims up to `limit` due tasks for `owner`.
    ///
    /// Each returned task is Reserved by `owner` until `now + lease`. Tasks
    /// whose previous lease expired are reclaimed as well. Results are
    /// ordered by `run_at`, then ID. On error no claim may be assumed.
    fn reserve(&self, limit: usize, owner: OwnerId, lease: Duration) -> StoreFuture<'_, Vec<Task>>;

    /// Extends every lease held by `owner` to `now + lease`, returning how
    /// many tasks were extended.
    fn touch(&self, owner: OwnerId, lease: Duration) -> StoreFuture<'_, u64>;

    /// Writes `completion` if `owner` still holds the lease on `task_id`.
    ///
    /// Returns false, leaving the task untouched, when the lease was lost.
    fn complete(
        &self,
        task_id: TaskId,
        owner: OwnerId,
        completion: Completion,
    ) -> StoreFuture<'_, bool>;

    /// Returns a claimed task to Pending without consuming an attempt.
    fn release(&self, task_id: TaskId, owner: OwnerId) -> StoreFuture<'_, bool>;

    /// Persists an attempt record and returns the sequence number the store
    /// assigned to it.
    ///
    /// Sequence numbers come from a per-task counter that never resets, so
    /// a task's history is strictly increasing across retries, recurrences
    /// and stolen leases. The `sequence` carried by `attempt` is ignored.
    fn append_attempt(&self, attempt: Attempt) -> StoreFuture<'_, i32>;

    /// Deletes attempts created before `older_than`, skipping the history of
    /// tasks that are currently Reserved.
    fn purge_attempts(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Looks up one task.
    fn find_task(&self, task_id: TaskId) -> StoreFuture<'_, Option<Task>>;

    /// Returns a task's attempt history, lowest sequence first.
    fn find_attempts(&self, task_id: TaskId) -> StoreFuture<'_, Vec<Attempt>>;

    /// Creates a Pending task.
    fn create_task(&self, new: NewTask) -> StoreFuture<'_, Task>;

    /// Deletes a task and its attempts. Returns false if it did not exist.
    fn delete_task(&self, task_id: TaskId) -> StoreFuture<'_, bool>;
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .map(|lease| now + lease)
        .map_err(|_| CoreError::InvalidInput(format!("lease duration out of range: {lease:?}")))
}

/// Production store backed by the PostgreSQL repositories.
pub struct PostgresTaskStore {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresTaskStore {
    /// Creates a store adapter over `storage`, reading time from `clock`.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl TaskStore for PostgresTaskStore {
    fn reserve(&self, limit: usize, owner: OwnerId, lease: Duration) -> StoreFuture<'_, Vec<Task>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let until = lease_until(now, lease)?;
            self.storage.tasks.reserve(owner, limit, now, until).await
        })
    }

    fn touch(&self, owner: OwnerId, lease: Duration) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let until = lease_until(now, lease)?;
            self.storage.tasks.touch(owner, now, until).await
        })
    }

    fn complete(
        &self,
        task_id: TaskId,
        owner: OwnerId,
        completion: Completion,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage.tasks.complete(task_id, owner, completion, now).await
        })
    }

    fn release(&self, task_id: TaskId, owner: OwnerId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            self.storage.tasks.release(task_id, owner, now).await
        })
    }

    fn append_attempt(&self, attempt: Attempt) -> StoreFuture<'_, i32> {
        Box::pin(async move { self.storage.attempts.create(&attempt).await })
    }

    fn purge_attempts(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.storage.attempts.purge_older_than(older_than).await })
    }

    fn find_task(&self, task_id: TaskId) -> StoreFuture<'_, Option<Task>> {
        Box::pin(async move { self.storage.tasks.find_by_id(task_id).await })
    }

    fn find_attempts(&self, task_id: TaskId) -> StoreFuture<'_, Vec<Attempt>> {
        Box::pin(async move { self.storage.attempts.find_by_task(task_id).await })
    }

    fn create_task(&self, new: NewTask) -> StoreFuture<'_, Task> {
        Box::pin(async move {
            let task = Task::pending(new, self.clock.now_utc())?;
            self.storage.tasks.create(&task).await?;
            Ok(task)
        })
    }

    fn delete_task(&self, task_id: TaskId) -> StoreFuture<'_, bool> {
        Box::pin(async move { self.storage.tasks.delete(task_id).await })
    }
}

pub mod mock {
    //! In-memory task store for tests.
    //!
    //! Mirrors the PostgreSQL semantics exactly. One mutex guards all state,
    //! which makes every operation atomic just like the conditional SQL
    //! statements it stands in for.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use hooky_core::{
        error::Result, Attempt, Clock, Completion, CoreError, NewTask, OwnerId, Task, TaskId,
        TaskStatus,
    };
    use tokio::sync::Mutex;

    use super::{lease_until, StoreFuture, TaskStore};

    /// Store operation that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operation {
        /// `reserve`
        Reserve,
        /// `touch`
        Touch,
        /// `complete`
        Complete,
        /// `release`
        Release,
        /// `append_attempt`
        AppendAttempt,
        /// `purge_attempts`
        Purge,
    }

    #[derive(Default)]
    struct State {
        tasks: HashMap<TaskId, Task>,
        attempts: Vec<Attempt>,
        injected: HashMap<Operation, String>,
    }

    impl State {
        fn take_error(&mut self, operation: Operation) -> Result<()> {
            match self.injected.remove(&operation) {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    /// In-memory store sharing semantics with the PostgreSQL store.
    #[derive(Clone)]
    pub struct MockTaskStore {
        state: Arc<Mutex<State>>,
        clock: Arc<dyn Clock>,
    }

    impl MockTaskStore {
        /// Creates an empty store reading time from `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(Mutex::new(State::default())), clock }
        }

        /// Inserts or replaces a task as-is, bypassing validation.
        pub async fn insert_task(&self, task: Task) {
            self.state.lock().await.tasks.insert(task.id, task);
        }

        /// Inserts an attempt as-is.
        pub async fn insert_attempt(&self, attempt: Attempt) {
            self.state.lock().await.attempts.push(attempt);
        }

        /// Makes the next call of `operation` fail with a database error.
        pub async fn inject_error(&self, operation: Operation, message: impl Into<String>) {
            self.state.lock().await.injected.insert(operation, message.into());
        }

        /// Snapshot of all tasks.
        pub async fn tasks(&self) -> Vec<Task> {
            self.state.lock().await.tasks.values().cloned().collect()
        }

        /// Snapshot of every recorded attempt.
        pub async fn attempts(&self) -> Vec<Attempt> {
            self.state.lock().await.attempts.clone()
        }
    }

    impl TaskStore for MockTaskStore {
        fn reserve(
            &self,
            limit: usize,
            owner: OwnerId,
            lease: Duration,
        ) -> StoreFuture<'_, Vec<Task>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::Reserve)?;

                let now = self.clock.now_utc();
                let until = lease_until(now, lease)?;

                let mut due: Vec<(DateTime<Utc>, TaskId)> = state
                    .tasks
                    .values()
                    .filter(|task| task.is_claimable(now))
                    .map(|task| (task.run_at, task.id))
                    .collect();
                due.sort();
                due.truncate(limit);

                let mut claimed = Vec::with_capacity(due.len());
                for (_, id) in due {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.status = TaskStatus::Reserved;
                        task.reserved_by = Some(owner);
                        task.reserved_until = Some(until);
                        task.updated_at = now;
                        claimed.push(task.clone());
                    }
                }

                Ok(claimed)
            })
        }

        fn touch(&self, owner: OwnerId, lease: Duration) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::Touch)?;

                let now = self.clock.now_utc();
                let until = lease_until(now, lease)?;
                let mut touched = 0;
                for task in state.tasks.values_mut().filter(|task| task.is_reserved_by(owner)) {
                    task.reserved_until = Some(until);
                    task.updated_at = now;
                    touched += 1;
                }

                Ok(touched)
            })
        }

        fn complete(
            &self,
            task_id: TaskId,
            owner: OwnerId,
            completion: Completion,
        ) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::Complete)?;

                let now = self.clock.now_utc();
                let Some(task) =
                    state.tasks.get_mut(&task_id).filter(|task| task.is_reserved_by(owner))
                else {
                    return Ok(false);
                };

                task.reserved_by = None;
                task.reserved_until = None;
                task.last_attempt_at = Some(now);
                task.updated_at = now;
                match completion {
                    Completion::Finished => {
                        task.status = TaskStatus::Finished;
                        task.attempt_count += 1;
                        task.finished_at = Some(now);
                    },
                    Completion::Rearm { run_at } => {
                        task.status = TaskStatus::Pending;
                        task.run_at = run_at;
                        task.attempt_count = 0;
                    },
                    Completion::Retry { run_at } => {
                        task.status = TaskStatus::Pending;
                        task.run_at = run_at;
                        task.attempt_count += 1;
                    },
                    Completion::Failed => {
                        task.status = TaskStatus::Failed;
                        task.attempt_count += 1;
                        task.finished_at = Some(now);
                    },
                }

                Ok(true)
            })
        }

        fn release(&self, task_id: TaskId, owner: OwnerId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::Release)?;

                let now = self.clock.now_utc();
                let Some(task) =
                    state.tasks.get_mut(&task_id).filter(|task| task.is_reserved_by(owner))
                else {
                    return Ok(false);
                };

                task.status = TaskStatus::Pending;
                task.reserved_by = None;
                task.reserved_until = None;
                task.updated_at = now;

                Ok(true)
            })
        }

        fn append_attempt(&self, mut attempt: Attempt) -> StoreFuture<'_, i32> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::AppendAttempt)?;
                let Some(task) = state.tasks.get_mut(&attempt.task_id) else {
                    return Err(CoreError::NotFound(format!("task {}", attempt.task_id)));
                };
                task.last_sequence += 1;
                let sequence = task.last_sequence;
                attempt.sequence = sequence;
                state.attempts.push(attempt);
                Ok(sequence)
            })
        }

        fn purge_attempts(&self, older_than: DateTime<Utc>) -> StoreFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.take_error(Operation::Purge)?;

                let State { tasks, attempts, .. } = &mut *state;
                let before = attempts.len();
                attempts.retain(|attempt| {
                    let reserved = tasks
                        .get(&attempt.task_id)
                        .is_some_and(|task| task.status == TaskStatus::Reserved);
                    attempt.created_at >= older_than || reserved
                });

                Ok((before - attempts.len()) as u64)
            })
        }

        fn find_task(&self, task_id: TaskId) -> StoreFuture<'_, Option<Task>> {
            Box::pin(async move { Ok(self.state.lock().await.tasks.get(&task_id).cloned()) })
        }

        fn find_attempts(&self, task_id: TaskId) -> StoreFuture<'_, Vec<Attempt>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                let mut attempts: Vec<Attempt> = state
                    .attempts
                    .iter()
                    .filter(|attempt| attempt.task_id == task_id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|attempt| attempt.sequence);
                Ok(attempts)
            })
        }

        fn create_task(&self, new: NewTask) -> StoreFuture<'_, Task> {
            Box::pin(async move {
                let task = Task::pending(new, self.clock.now_utc())?;
                self.state.lock().await.tasks.insert(task.id, task.clone());
                Ok(task)
            })
        }

        fn delete_task(&self, task_id: TaskId) -> StoreFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                let existed = state.tasks.remove(&task_id).is_some();
                state.attempts.retain(|attempt| attempt.task_id != task_id);
                Ok(existed)
            })
        }
    }
}
