//! Postgres-backed job store.
//!
//! ## Atomicity
//!
//! Every read-modify-write runs in a transaction that takes a row lock
//! (`SELECT ... FOR UPDATE`) on the entity being changed. `reconcile_job` locks
//! the job row first and only then counts task statuses, so two reconciles of
//! the same job serialize and the later one always sees every task update that
//! committed before it started.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | StoreError |
//! |-----------------------|------------|
//! | `23505` (unique violation) | `AlreadyExists` |
//! | `23503` (foreign key violation) | `NotFound` (owning job) |
//! | anything else | `Storage` |
//!
//! ## Sync bridge
//!
//! `JobStore` is synchronous. The trait impl drives the async methods on the
//! runtime handle captured at construction, so it must be called from a
//! blocking context (a plain thread or `tokio::task::spawn_blocking`), never
//! from inside an async task.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use jobmesh_core::{Job, JobId, JobStatus, Task, TaskCounts, TaskId, TaskStatus};

use super::{JobFilter, JobStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    status          TEXT NOT NULL,
    total_tasks     INTEGER NOT NULL CHECK (total_tasks > 0),
    completed_tasks INTEGER NOT NULL DEFAULT 0,
    failed_tasks    INTEGER NOT NULL DEFAULT 0,
    parameters      JSONB NOT NULL DEFAULT '{}'::jsonb,
    error_message   TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS tasks (
    id                      TEXT PRIMARY KEY,
    job_id                  UUID NOT NULL REFERENCES jobs (id),
    status                  TEXT NOT NULL,
    task_index              INTEGER NOT NULL CHECK (task_index >= 0),
    retry_count             INTEGER NOT NULL DEFAULT 0,
    max_retries             INTEGER NOT NULL,
    parameters              JSONB NOT NULL DEFAULT '{}'::jsonb,
    result                  JSONB,
    error_message           TEXT,
    created_at              TIMESTAMPTZ NOT NULL,
    updated_at              TIMESTAMPTZ NOT NULL,
    started_at              TIMESTAMPTZ,
    completed_at            TIMESTAMPTZ,
    processing_time_seconds DOUBLE PRECISION,
    UNIQUE (job_id, task_index)
);

CREATE INDEX IF NOT EXISTS tasks_status_idx ON tasks (status, updated_at);
"#;

const JOB_COLUMNS: &str = "id, job_type, status, total_tasks, completed_tasks, failed_tasks, \
     parameters, error_message, created_at, updated_at, started_at, completed_at";

const TASK_COLUMNS: &str = "id, job_id, status, task_index, retry_count, max_retries, \
     parameters, result, error_message, created_at, updated_at, started_at, completed_at, \
     processing_time_seconds";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool. `runtime` drives the sync `JobStore` impl.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Connect and create the schema if missing.
    ///
    /// Must be awaited inside a tokio runtime; that runtime backs the sync API.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool, Handle::current());
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, status, total_tasks, completed_tasks, failed_tasks,
                parameters, error_message, created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(job.total_tasks as i32)
        .bind(job.completed_tasks as i32)
        .bind(job.failed_tasks as i32)
        .bind(&job.parameters)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))
        .map_err(|e| e.for_entity("job", job.id.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, tasks), fields(task_count = tasks.len()), err)]
    pub async fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    id, job_id, status, task_index, retry_count, max_retries,
                    parameters, result, error_message, created_at, updated_at,
                    started_at, completed_at, processing_time_seconds
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(task.id.as_str())
            .bind(task.job_id.as_uuid())
            .bind(task.status.as_str())
            .bind(task.task_index as i32)
            .bind(task.retry_count as i32)
            .bind(task.max_retries as i32)
            .bind(&task.parameters)
            .bind(&task.result)
            .bind(&task.error_message)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.processing_time.map(|d| d.as_secs_f64()))
            .execute(&mut *tx)
            .await
            .map_err(|e| match map_sqlx_error("insert_task", e) {
                StoreError::NotFound { .. } => StoreError::job_not_found(task.job_id),
                other => other.for_entity("task", task.id.to_string()),
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE job_id = $1 ORDER BY task_index ASC"
        ))
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_tasks", e))?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), fields(job_count = tracing::field::Empty), err)]
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        let span = Span::current();
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE ($1::text IS NULL OR id::text ILIKE $1 OR job_type ILIKE $1)
            "#,
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR id::text ILIKE $1 OR job_type ILIKE $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(&pattern)
        .bind(filter.limit as i64)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        span.record("job_count", jobs.len());
        Ok((jobs, total.max(0) as usize))
    }

    #[instrument(skip(self), fields(status = %status), err)]
    pub async fn tasks_with_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("tasks_with_status", e))?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, f), fields(job_id = %id), err)]
    pub async fn update_job(
        &self,
        id: JobId,
        f: &mut (dyn FnMut(&mut Job) -> bool + '_),
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let original = lock_job(&mut tx, id).await?;
        let mut job = original.clone();
        if f(&mut job) {
            write_job(&mut tx, &job).await?;
        } else {
            job = original;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self, f), fields(task_id = %id), err)]
    pub async fn update_task(
        &self,
        id: &TaskId,
        f: &mut (dyn FnMut(&mut Task) -> bool + '_),
    ) -> Result<Task, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_task", e))?
        .ok_or_else(|| StoreError::task_not_found(id))?;

        let original = task_from_row(&row)?;
        let mut task = original.clone();
        if f(&mut task) {
            write_task(&mut tx, &task).await?;
        } else {
            task = original;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(task)
    }

    #[instrument(skip(self, f), fields(job_id = %id), err)]
    pub async fn reconcile_job(
        &self,
        id: JobId,
        f: &mut (dyn FnMut(&mut Job, TaskCounts) -> bool + '_),
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let original = lock_job(&mut tx, id).await?;
        let mut job = original.clone();

        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed
            FROM tasks
            WHERE job_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_tasks", e))?;

        let counts = TaskCounts {
            completed: count_column(&counts, "completed")?,
            failed: count_column(&counts, "failed")?,
        };

        if f(&mut job, counts) {
            write_job(&mut tx, &job).await?;
        } else {
            job = original;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn delete_job(&self, id: JobId) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let tasks = sqlx::query("DELETE FROM tasks WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_tasks", e))?
            .rows_affected();

        let jobs = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?
            .rows_affected();

        if jobs == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::job_not_found(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(tasks as usize)
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: JobId) -> Result<Job, StoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or(StoreError::job_not_found(id))?;
    job_from_row(&row)
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2,
            completed_tasks = $3,
            failed_tasks = $4,
            error_message = $5,
            updated_at = $6,
            started_at = $7,
            completed_at = $8
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.completed_tasks as i32)
    .bind(job.failed_tasks as i32)
    .bind(&job.error_message)
    .bind(job.updated_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;
    Ok(())
}

async fn write_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = $2,
            retry_count = $3,
            result = $4,
            error_message = $5,
            updated_at = $6,
            started_at = $7,
            completed_at = $8,
            processing_time_seconds = $9
        WHERE id = $1
        "#,
    )
    .bind(task.id.as_str())
    .bind(task.status.as_str())
    .bind(task.retry_count as i32)
    .bind(&task.result)
    .bind(&task.error_message)
    .bind(task.updated_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.processing_time.map(|d| d.as_secs_f64()))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_task", e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists {
                    entity: "row",
                    id: msg,
                },
                Some("23503") => StoreError::NotFound {
                    entity: "row",
                    id: msg,
                },
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

impl StoreError {
    /// Attach the entity identity to a constraint error raised by the database.
    fn for_entity(self, entity: &'static str, id: String) -> Self {
        match self {
            StoreError::AlreadyExists { .. } => StoreError::AlreadyExists { entity, id },
            StoreError::NotFound { .. } => StoreError::NotFound { entity, id },
            other => other,
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn non_negative(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    let v: i32 = row.try_get(column)?;
    u32::try_from(v).map_err(decode_err)
}

fn count_column(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let v: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("count_tasks", e))?;
    Ok(u32::try_from(v).unwrap_or(u32::MAX))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let decode = || -> Result<Job, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: JobId::from_uuid(row.try_get("id")?),
            job_type: row.try_get("job_type")?,
            status: status.parse::<JobStatus>().map_err(decode_err)?,
            total_tasks: non_negative(row, "total_tasks")?,
            completed_tasks: non_negative(row, "completed_tasks")?,
            failed_tasks: non_negative(row, "failed_tasks")?,
            parameters: row.try_get::<JsonValue, _>("parameters")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    };
    decode().map_err(|e| StoreError::Storage(format!("failed to decode job row: {e}")))
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let decode = || -> Result<Task, sqlx::Error> {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let processing: Option<f64> = row.try_get("processing_time_seconds")?;
        Ok(Task {
            id: id.parse::<TaskId>().map_err(decode_err)?,
            job_id: JobId::from_uuid(row.try_get("job_id")?),
            status: status.parse::<TaskStatus>().map_err(decode_err)?,
            task_index: non_negative(row, "task_index")?,
            retry_count: non_negative(row, "retry_count")?,
            max_retries: non_negative(row, "max_retries")?,
            parameters: row.try_get::<JsonValue, _>("parameters")?,
            result: row.try_get::<Option<JsonValue>, _>("result")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            processing_time: processing.and_then(|s| Duration::try_from_secs_f64(s).ok()),
        })
    };
    decode().map_err(|e| StoreError::Storage(format!("failed to decode task row: {e}")))
}

impl JobStore for PostgresJobStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.runtime.block_on(self.insert_job(job))
    }

    fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        self.runtime.block_on(self.insert_tasks(tasks))
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.runtime.block_on(self.get_job(id))
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.runtime.block_on(self.get_task(id))
    }

    fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        self.runtime.block_on(self.list_tasks(job_id))
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        self.runtime.block_on(self.list_jobs(filter))
    }

    fn tasks_with_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.runtime.block_on(self.tasks_with_status(status, limit))
    }

    fn update_job(&self, id: JobId, f: &mut dyn FnMut(&mut Job) -> bool) -> Result<Job, StoreError> {
        self.runtime.block_on(self.update_job(id, f))
    }

    fn update_task(&self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> bool) -> Result<Task, StoreError> {
        self.runtime.block_on(self.update_task(id, f))
    }

    fn reconcile_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job, TaskCounts) -> bool,
    ) -> Result<Job, StoreError> {
        self.runtime.block_on(self.reconcile_job(id, f))
    }

    fn delete_job(&self, id: JobId) -> Result<usize, StoreError> {
        self.runtime.block_on(self.delete_job(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("compute"), "compute");
    }

    #[test]
    fn constraint_errors_take_entity_identity() {
        let err = StoreError::AlreadyExists {
            entity: "row",
            id: "database error".into(),
        }
        .for_entity("task", "j-task-0".into());
        assert_eq!(
            err,
            StoreError::AlreadyExists {
                entity: "task",
                id: "j-task-0".into()
            }
        );

        let storage = StoreError::Storage("down".into()).for_entity("task", "x".into());
        assert_eq!(storage, StoreError::Storage("down".into()));
    }

    #[test]
    fn non_database_errors_map_to_storage() {
        assert!(matches!(
            map_sqlx_error("get_job", sqlx::Error::PoolClosed),
            StoreError::Storage(_)
        ));
        assert!(matches!(
            map_sqlx_error("get_job", sqlx::Error::RowNotFound),
            StoreError::Storage(_)
        ));
    }
}
