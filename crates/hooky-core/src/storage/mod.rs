//! Database access layer for tasks and their attempt history.
//!
//! All SQL lives in these repositories. The reservation protocol depends on
//! every lease transition being a single conditional statement, so callers
//! must not issue ad-hoc queries against these tables.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempts;
pub mod tasks;

use crate::error::Result;

const SCHEMA: &[(&str, &str)] = &[
    (
        "tasks table",
        r"
        CREATE TABLE IF NOT EXISTS tasks (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            payload BYTEA NOT NULL DEFAULT ''::bytea,
            run_at TIMESTAMPTZ NOT NULL,
            interval_ms BIGINT CHECK (interval_ms IS NULL OR interval_ms > 0),
            max_attempts INTEGER NOT NULL DEFAULT 10 CHECK (max_attempts >= 0),
            backoff JSONB,
            status TEXT NOT NULL CHECK (status IN ('pending', 'reserved', 'finished', 'failed')),
            reserved_by UUID,
            reserved_until TIMESTAMPTZ,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_sequence INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            last_attempt_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            CHECK ((status = 'reserved') = (reserved_by IS NOT NULL AND reserved_until IS NOT NULL))
        )
        ",
    ),
    (
        "attempts table",
        r"
        CREATE TABLE IF NOT EXISTS attempts (
            id UUID PRIMARY KEY,
            task_id UUID NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            owner UUID,
            started_at TIMESTAMPTZ NOT NULL,
            duration_ms BIGINT NOT NULL,
            outcome TEXT NOT NULL,
            status_code INTEGER,
            error_message TEXT,
            response_excerpt TEXT,
            created_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "due tasks index",
        r"
        CREATE INDEX IF NOT EXISTS idx_tasks_due
        ON tasks(run_at, id)
        WHERE status = 'pending'
        ",
    ),
    (
        "lease expiry index",
        r"
        CREATE INDEX IF NOT EXISTS idx_tasks_lease
        ON tasks(reserved_until)
        WHERE status = 'reserved'
        ",
    ),
    (
        "lease owner index",
        r"
        CREATE INDEX IF NOT EXISTS idx_tasks_owner
        ON tasks(reserved_by)
        WHERE status = 'reserved'
        ",
    ),
    (
        "attempt history index",
        r"
        CREATE INDEX IF NOT EXISTS idx_attempts_task
        ON attempts(task_id, sequence)
        ",
    ),
    (
        "attempt retention index",
        r"
        CREATE INDEX IF NOT EXISTS idx_attempts_created
        ON attempts(created_at)
        ",
    ),
];

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for task rows and the lease protocol.
    pub tasks: Arc<tasks::Repository>,

    /// Repository for attempt history.
    pub attempts: Arc<attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            tasks: Arc::new(tasks::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool)),
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.tasks.pool()
    }

    /// Creates tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let pool = self.pool();
        for (name, statement) in SCHEMA {
            tracing::debug!(object = name, "ensuring schema object");
            sqlx::query(statement).execute(&*pool).await?;
        }

        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_lazily() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/hooky").expect("valid url");
        let _storage = Storage::new(pool);
    }

    #[test]
    fn schema_creates_tables_before_indexes() {
        let first_index = SCHEMA.iter().position(|(_, sql)| sql.contains("CREATE INDEX"));
        let last_table = SCHEMA.iter().rposition(|(_, sql)| sql.contains("CREATE TABLE"));
        assert!(last_table < first_index);
    }
}
