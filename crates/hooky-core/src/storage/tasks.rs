//! Repository for task rows and the lease protocol.
//!
//! Every state transition is one conditional statement. `reserve` claims with
//! `FOR UPDATE SKIP LOCKED` so concurrent schedulers never block on each
//! other, and `complete`/`release` only apply while the caller still owns the
//! lease.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Completion, OwnerId, Task, TaskId, TaskStatus},
};

const TASK_COLUMNS: &str = "id, url, method, headers, payload, run_at, interval_ms, max_attempts, \
                            backoff, status, reserved_by, reserved_until, attempt_count, \
                            last_sequence, created_at, updated_at, last_attempt_at, finished_at";

/// Repository for task database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new task.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or constraints are violated.
    pub async fn create(&self, task: &Task) -> Result<TaskId> {
        self.create_impl(&*self.pool, task).await
    }

    /// Inserts a task within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task: &Task,
    ) -> Result<TaskId> {
        self.create_impl(&mut **tx, task).await
    }

    async fn create_impl<'e, E>(&self, executor: E, task: &Task) -> Result<TaskId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO tasks (
                id, url, method, headers, payload, run_at, interval_ms, max_attempts,
                backoff, status, reserved_by, reserved_until, attempt_count,
                last_sequence, created_at, updated_at, last_attempt_at, finished_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            RETURNING id
            ",
        )
        .bind(task.id)
        .bind(&task.url)
        .bind(&task.method)
        .bind(&task.headers)
        .bind(&task.payload)
        .bind(task.run_at)
        .bind(task.interval_ms)
        .bind(task.max_attempts)
        .bind(&task.backoff)
        .bind(task.status)
        .bind(task.reserved_by)
        .bind(task.reserved_until)
        .bind(task.attempt_count)
        .bind(task.last_sequence)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.last_attempt_at)
        .bind(task.finished_at)
        .fetch_one(executor)
        .await?;

        Ok(TaskId(id))
    }

    /// Finds a task by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(task)
    }

    /// Lists tasks currently leased by `owner`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_reserved_by(&self, owner: OwnerId) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'reserved' AND reserved_by = $1
             ORDER BY run_at ASC, id ASC"
        ))
        .bind(owner)
        .fetch_all(&*self.pool)
        .await?;

        Ok(tasks)
    }

    /// Counts tasks in a given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }

    /// Deletes a task and, by cascade, its attempts.
    ///
    /// Returns false if no such task existed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically claims up to `limit` due tasks for `owner`.
    ///
    /// Claims Pending tasks with `run_at <= now` and Reserved tasks whose
    /// lease lapsed before `now`. Rows locked by a concurrent claimer are
    /// skipped rather than waited on, so two callers never receive the same
    /// task. The result is ordered by `run_at`, then `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails. No task is claimed in that case.
    pub async fn reserve(
        &self,
        owner: OwnerId,
        limit: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tasks = sqlx::query_as::<_, Task>(&format!(
            r"
            UPDATE tasks
            SET status = 'reserved', reserved_by = $1, reserved_until = $2, updated_at = $3
            WHERE id IN (
                SELECT id FROM tasks
                WHERE (status = 'pending' AND run_at <= $3)
                   OR (status = 'reserved' AND reserved_until < $3)
                ORDER BY run_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            AND (status = 'pending' OR reserved_until < $3)
            RETURNING {TASK_COLUMNS}
            "
        ))
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        tasks.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.id.cmp(&b.id)));

        Ok(tasks)
    }

    /// Extends every lease held by `owner` to `lease_until`.
    ///
    /// Tasks reclaimed by another owner are not matched, so a lost lease
    /// simply contributes zero to the returned count.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn touch(
        &self,
        owner: OwnerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET reserved_until = $2, updated_at = $3
            WHERE status = 'reserved' AND reserved_by = $1
            ",
        )
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Writes the outcome of an execution back to a task.
    ///
    /// Only applies while `owner` still holds the lease. Returns false when
    /// the lease was lost, in which case the row is untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(
        &self,
        id: TaskId,
        owner: OwnerId,
        completion: Completion,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match completion {
            Completion::Finished => sqlx::query(
                r"
                UPDATE tasks
                SET status = 'finished', reserved_by = NULL, reserved_until = NULL,
                    attempt_count = attempt_count + 1,
                    last_attempt_at = $3, finished_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'reserved' AND reserved_by = $2
                ",
            )
            .bind(id)
            .bind(owner)
            .bind(now),
            Completion::Rearm { run_at } => sqlx::query(
                r"
                UPDATE tasks
                SET status = 'pending', reserved_by = NULL, reserved_until = NULL,
                    run_at = $4, attempt_count = 0,
                    last_attempt_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'reserved' AND reserved_by = $2
                ",
            )
            .bind(id)
            .bind(owner)
            .bind(now)
            .bind(run_at),
            Completion::Retry { run_at } => sqlx::query(
                r"
                UPDATE tasks
                SET status = 'pending', reserved_by = NULL, reserved_until = NULL,
                    run_at = $4, attempt_count = attempt_count + 1,
                    last_attempt_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'reserved' AND reserved_by = $2
                ",
            )
            .bind(id)
            .bind(owner)
            .bind(now)
            .bind(run_at),
            Completion::Failed => sqlx::query(
                r"
                UPDATE tasks
                SET status = 'failed', reserved_by = NULL, reserved_until = NULL,
                    attempt_count = attempt_count + 1,
                    last_attempt_at = $3, finished_at = $3, updated_at = $3
                WHERE id = $1 AND status = 'reserved' AND reserved_by = $2
                ",
            )
            .bind(id)
            .bind(owner)
            .bind(now),
        };

        let result = query.execute(&*self.pool).await?;

        Ok(result.rows_affected() == 1)
    }

    /// Hands a claimed task back to Pending without consuming an attempt.
    ///
    /// Returns false when `owner` no longer holds the lease.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, id: TaskId, owner: OwnerId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending', reserved_by = NULL, reserved_until = NULL, updated_at = $3
            WHERE id = $1 AND status = 'reserved' AND reserved_by = $2
            ",
        )
        .bind(id)
        .bind(owner)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = PgPool::connect_lazy("postgresql://localhost/hooky").expect("valid url");
        let repo = Repository::new(Arc::new(pool));
        assert_eq!(Arc::strong_count(&repo.pool()), 2);
    }

    #[tokio::test]
    async fn zero_limit_reserves_nothing_without_touching_the_database() {
        let pool = PgPool::connect_lazy("postgresql://localhost/hooky").expect("valid url");
        let repo = Repository::new(Arc::new(pool));
        let now = Utc::now();

        let tasks = repo.reserve(OwnerId::new(), 0, now, now).await.expect("no query issued");
        assert!(tasks.is_empty());
    }
}
