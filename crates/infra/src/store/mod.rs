//! Durable store for jobs and tasks.
//!
//! Every mutating method is an atomic read-modify-write keyed by entity id:
//! the closure passed to `update_*`/`reconcile_job` sees the current record
//! and its changes are persisted before any other writer can observe the
//! entity. Two workers racing to report the same task therefore cannot lose an
//! update.

use std::sync::Arc;

use jobmesh_core::{Job, JobId, Task, TaskCounts, TaskId, TaskStatus};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.to_string(),
        }
    }

    pub fn task_not_found(id: &TaskId) -> Self {
        Self::NotFound {
            entity: "task",
            id: id.to_string(),
        }
    }
}

/// Filter + window for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Case-insensitive substring over job id or job_type
    pub search: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

/// Job/task persistence.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Persist tasks of an existing job, all or nothing.
    fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError>;

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Tasks of a job ordered by `task_index`.
    fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError>;

    /// Jobs ordered by creation time (newest first) plus the total match count.
    fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError>;

    /// Up to `limit` tasks currently in `status`, least recently updated first.
    fn tasks_with_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Atomically read-modify-write a job. `f` returns whether to persist.
    fn update_job(&self, id: JobId, f: &mut dyn FnMut(&mut Job) -> bool) -> Result<Job, StoreError>;

    /// Atomically read-modify-write a task. `f` returns whether to persist.
    fn update_task(&self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> bool) -> Result<Task, StoreError>;

    /// Count the job's terminal tasks and update the job in one transaction.
    fn reconcile_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job, TaskCounts) -> bool,
    ) -> Result<Job, StoreError>;

    /// Remove a job and all of its tasks in one transaction.
    ///
    /// Returns the number of tasks removed.
    fn delete_job(&self, id: JobId) -> Result<usize, StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert_job(job)
    }

    fn insert_tasks(&self, tasks: &[Task]) -> Result<(), StoreError> {
        (**self).insert_tasks(tasks)
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_job(id)
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get_task(id)
    }

    fn list_tasks(&self, job_id: JobId) -> Result<Vec<Task>, StoreError> {
        (**self).list_tasks(job_id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        (**self).list_jobs(filter)
    }

    fn tasks_with_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
        (**self).tasks_with_status(status, limit)
    }

    fn update_job(&self, id: JobId, f: &mut dyn FnMut(&mut Job) -> bool) -> Result<Job, StoreError> {
        (**self).update_job(id, f)
    }

    fn update_task(&self, id: &TaskId, f: &mut dyn FnMut(&mut Task) -> bool) -> Result<Task, StoreError> {
        (**self).update_task(id, f)
    }

    fn reconcile_job(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut Job, TaskCounts) -> bool,
    ) -> Result<Job, StoreError> {
        (**self).reconcile_job(id, f)
    }

    fn delete_job(&self, id: JobId) -> Result<usize, StoreError> {
        (**self).delete_job(id)
    }
}
