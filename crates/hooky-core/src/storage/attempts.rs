//! Repository for attempt history.
//!
//! Attempts are append-only audit records. They are written even when the
//! corresponding `complete` loses its lease, and only ever removed by
//! retention or by deleting the owning task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{Attempt, TaskId},
};

/// Repository for attempt database operations.
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

    /// Records a new attempt.
    ///
    /// The sequence number is assigned here by bumping the task's
    /// `last_sequence` in the same statement, so concurrent writers for one
    /// task (a stolen lease) still get distinct, increasing numbers. The
    /// `sequence` carried by `attempt` is ignored. Returns the assigned
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist, or another
    /// error if the insert fails.
    pub async fn create(&self, attempt: &Attempt) -> Result<i32> {
        self.create_impl(&*self.pool, attempt).await
    }

    /// Records an attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &Attempt,
    ) -> Result<i32> {
        self.create_impl(&mut **tx, attempt).await
    }

    async fn create_impl<'e, E>(&self, executor: E, attempt: &Attempt) -> Result<i32>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sequence = sqlx::query_scalar(
            r"
            WITH next AS (
                UPDATE tasks SET last_sequence = last_sequence + 1
                WHERE id = $2
                RETURNING last_sequence
            )
            INSERT INTO attempts (
                id, task_id, sequence, owner, started_at, duration_ms,
                outcome, status_code, error_message, response_excerpt, created_at
            )
            SELECT $1, $2, next.last_sequence, $3, $4, $5, $6, $7, $8, $9, $10
            FROM next
            RETURNING sequence
            ",
        )
        .bind(attempt.id)
        .bind(attempt.task_id)
        .bind(attempt.owner)
        .bind(attempt.started_at)
        .bind(attempt.duration_ms)
        .bind(attempt.outcome)
        .bind(attempt.status_code)
        .bind(&attempt.error_message)
        .bind(&attempt.response_excerpt)
        .bind(attempt.created_at)
        .fetch_one(executor)
        .await?;

        Ok(sequence)
    }

    /// Finds all attempts for a task, oldest sequence first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Attempt>> {
        let attempts = sqlx::query_as::<_, Attempt>(
            r"
            SELECT id, task_id, sequence, owner, started_at, duration_ms,
                   outcome, status_code, error_message, response_excerpt, created_at
            FROM attempts
            WHERE task_id = $1
            ORDER BY sequence ASC
            ",
        )
        .bind(task_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Counts attempts recorded for a task.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_task(&self, task_id: TaskId) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }

    /// Deletes attempts created strictly before `cutoff`.
    ///
    /// History of a task that is currently Reserved is left alone so a purge
    /// never races an in-flight attempt write. Returns the number of rows
    /// removed; a repeat call with the same cutoff returns zero.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM attempts a
            WHERE a.created_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM tasks t
                  WHERE t.id = a.task_id AND t.status = 'reserved'
              )
            ",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = PgPool::connect_lazy("postgresql://localhost/hooky").expect("valid url");
        let repo = Repository::new(Arc::new(pool));
        let _pool = repo.pool();
    }
}
