//! Orchestration service: the single entry point for job creation, queries,
//! and the task lifecycle reports coming from workers.
//!
//! The service holds no state of its own beyond configuration. Every mutation
//! is delegated to an atomic store operation, so any number of API handlers
//! and embedded workers can share one instance across threads.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use jobmesh_core::{
    CompleteOutcome, CompletionReport, DomainError, FailOutcome, Job, JobId, Task, TaskId,
    TaskStatus,
};

use crate::config::OrchestratorConfig;
use crate::queue::{QueueError, WorkQueue};
use crate::reconciler::StatusReconciler;
use crate::store::{JobFilter, JobStore, StoreError};

/// Largest accepted `page_size` for job listings.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Service error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl From<DomainError> for ServiceError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::Validation(msg) => ServiceError::Validation(msg),
            DomainError::InvalidId(msg) => ServiceError::Validation(format!("invalid identifier: {msg}")),
            DomainError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
            StoreError::AlreadyExists { entity, id } => {
                ServiceError::Conflict(format!("{entity} already exists: {id}"))
            }
            other => ServiceError::Store(other),
        }
    }
}

/// Paging + search parameters for [`OrchestrationService::list_jobs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListJobsQuery {
    /// 1-based
    pub page: u32,
    pub page_size: u32,
    pub search: Option<String>,
}

impl Default for ListJobsQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            search: None,
        }
    }
}

/// One page of jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: usize,
}

/// Orchestration service over a job store and a work queue.
#[derive(Debug, Clone)]
pub struct OrchestrationService<S, Q> {
    store: S,
    queue: Q,
    config: OrchestratorConfig,
    reconciler: StatusReconciler,
}

impl<S, Q> OrchestrationService<S, Q>
where
    S: JobStore,
    Q: WorkQueue,
{
    pub fn new(store: S, queue: Q, config: OrchestratorConfig) -> Self {
        let reconciler = StatusReconciler::new(config.completion_policy);
        Self {
            store,
            queue,
            config,
            reconciler,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create a job, materialize its tasks and publish one message per task.
    ///
    /// Publishing is best-effort: a failed publish is logged and the task stays
    /// ENQUEUED in the store, recoverable with [`Self::republish_job`].
    pub fn create_job(
        &self,
        job_type: &str,
        num_tasks: u32,
        parameters: JsonValue,
    ) -> ServiceResult<Job> {
        let now = Utc::now();
        let job = Job::create(job_type, num_tasks, parameters, self.config.max_tasks, now)?;
        self.store.insert_job(&job)?;

        let tasks = job.build_tasks(self.config.max_task_retries, now);
        if let Err(e) = self.store.insert_tasks(&tasks) {
            // Don't leave a PENDING job without tasks behind.
            if let Err(cleanup) = self.store.delete_job(job.id) {
                warn!(job_id = %job.id, error = %cleanup, "failed to remove job after task insert failure");
            }
            return Err(e.into());
        }

        let job = self.store.update_job(job.id, &mut |j| j.mark_enqueued(Utc::now()))?;

        let published = self.publish_all(tasks.iter());
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            total_tasks = job.total_tasks,
            published,
            "job created"
        );
        Ok(job)
    }

    fn publish_all<'a>(&self, tasks: impl Iterator<Item = &'a Task>) -> usize {
        let mut published = 0;
        for task in tasks {
            match self.queue.publish(&task.to_message()) {
                Ok(message_id) => {
                    published += 1;
                    debug!(task_id = %task.id, message_id = %message_id, "task published");
                }
                Err(e) => {
                    error!(task_id = %task.id, job_id = %task.job_id, error = %e, "failed to publish task");
                }
            }
        }
        published
    }

    pub fn get_job(&self, id: JobId) -> ServiceResult<Job> {
        self.store
            .get_job(id)?
            .ok_or_else(|| DomainError::job_not_found(id).into())
    }

    pub fn list_jobs(&self, query: &ListJobsQuery) -> ServiceResult<JobPage> {
        if query.page < 1 {
            return Err(ServiceError::Validation("page must be at least 1".to_string()));
        }
        if query.page_size < 1 || query.page_size > MAX_PAGE_SIZE {
            return Err(ServiceError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                query.page_size
            )));
        }

        let page_size = query.page_size as usize;
        let filter = JobFilter {
            search: query.search.clone(),
            offset: (query.page as usize - 1).saturating_mul(page_size),
            limit: page_size,
        };
        let (jobs, total) = self.store.list_jobs(&filter)?;

        Ok(JobPage {
            jobs,
            total,
            page: query.page,
            page_size: query.page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    pub fn get_task(&self, id: &TaskId) -> ServiceResult<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| DomainError::task_not_found(id).into())
    }

    /// Tasks of a job ordered by index.
    pub fn list_job_tasks(&self, job_id: JobId) -> ServiceResult<Vec<Task>> {
        self.get_job(job_id)?;
        Ok(self.store.list_tasks(job_id)?)
    }

    /// Remove a job and every task it owns. Returns the number of tasks removed.
    pub fn delete_job(&self, id: JobId) -> ServiceResult<usize> {
        let removed = self.store.delete_job(id)?;
        info!(job_id = %id, tasks_removed = removed, "job deleted");
        Ok(removed)
    }

    /// Publish a fresh message for every PENDING/ENQUEUED task of a job.
    ///
    /// Duplicates with messages still in the queue are harmless since every
    /// task transition is idempotent.
    pub fn republish_job(&self, id: JobId) -> ServiceResult<usize> {
        let tasks = self.list_job_tasks(id)?;

        let mut published = 0;
        for task in tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Enqueued))
        {
            self.queue.publish(&task.to_message())?;
            published += 1;
        }

        info!(job_id = %id, published, "job republished");
        Ok(published)
    }

    /// Worker picked the task up. Idempotent; also starts the owning job.
    pub fn mark_running(&self, task_id: &TaskId) -> ServiceResult<Task> {
        let mut started = false;
        let task = self.store.update_task(task_id, &mut |t| {
            started = t.mark_running(Utc::now());
            started
        })?;

        if started {
            debug!(task_id = %task.id, "task running");
            self.store
                .update_job(task.job_id, &mut |j| j.mark_started(Utc::now()))?;
        }
        Ok(task)
    }

    /// Apply a successful completion report.
    ///
    /// A duplicate report (redelivery after a crash between report and delete)
    /// returns the stored task unchanged and does not reconcile.
    pub fn mark_complete(&self, task_id: &TaskId, report: &CompletionReport) -> ServiceResult<Task> {
        let result = report.result.clone();
        let processing_time = report.processing_time();

        let mut outcome = CompleteOutcome::AlreadyCompleted;
        let task = self.store.update_task(task_id, &mut |t| {
            outcome = t.mark_completed(result.clone(), processing_time, Utc::now());
            outcome.changed()
        })?;

        match outcome {
            CompleteOutcome::Completed => {
                info!(
                    task_id = %task.id,
                    job_id = %task.job_id,
                    processing_time_secs = task.processing_time.map(|d| d.as_secs_f64()),
                    "task completed"
                );
                self.reconciler.reconcile(&self.store, task.job_id)?;
            }
            CompleteOutcome::AlreadyCompleted => {
                debug!(task_id = %task.id, "duplicate completion report ignored");
            }
            CompleteOutcome::AlreadyFailed => {
                warn!(task_id = %task.id, "completion report for terminally failed task ignored");
            }
        }
        Ok(task)
    }

    /// Apply a failure report, advancing the retry counter.
    pub fn mark_failed(&self, task_id: &TaskId, error_message: &str) -> ServiceResult<Task> {
        let mut outcome = FailOutcome::AlreadyTerminal;
        let task = self.store.update_task(task_id, &mut |t| {
            outcome = t.mark_failed(error_message, Utc::now());
            outcome.changed()
        })?;

        match outcome {
            FailOutcome::Retrying { retry_count } => {
                warn!(
                    task_id = %task.id,
                    retry_count,
                    max_retries = task.max_retries,
                    error = %error_message,
                    "task failed, will retry"
                );
            }
            FailOutcome::Exhausted => {
                error!(
                    task_id = %task.id,
                    job_id = %task.job_id,
                    retry_count = task.retry_count,
                    error = %error_message,
                    "task failed permanently"
                );
                self.reconciler.reconcile(&self.store, task.job_id)?;
            }
            FailOutcome::AlreadyTerminal => {
                debug!(task_id = %task.id, status = %task.status, "failure report for terminal task ignored");
            }
        }
        Ok(task)
    }

    /// Move up to `limit` RETRYING tasks back to ENQUEUED and publish them.
    ///
    /// A task whose publish fails is put back to RETRYING for the next sweep.
    /// Returns the number of tasks re-enqueued.
    pub fn requeue_retrying(&self, limit: usize) -> ServiceResult<usize> {
        let candidates = self.store.tasks_with_status(TaskStatus::Retrying, limit)?;

        let mut requeued = 0;
        for candidate in candidates {
            let mut claimed = false;
            let task = match self.store.update_task(&candidate.id, &mut |t| {
                claimed = t.requeue(Utc::now());
                claimed
            }) {
                Ok(task) => task,
                // Job deleted since the scan.
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            if !claimed {
                continue;
            }

            match self.queue.publish(&task.to_message()) {
                Ok(_) => {
                    requeued += 1;
                    debug!(task_id = %task.id, retry_count = task.retry_count, "task re-enqueued");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "re-enqueue publish failed, releasing task");
                    self.store
                        .update_task(&task.id, &mut |t| t.release_requeue(Utc::now()))?;
                    return Err(e.into());
                }
            }
        }

        if requeued > 0 {
            info!(requeued, "retrying tasks re-enqueued");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use jobmesh_core::{CompletionPolicy, JobStatus, TaskMessage};
    use serde_json::json;

    use crate::queue::InMemoryWorkQueue;
    use crate::store::InMemoryJobStore;

    type Service = OrchestrationService<Arc<InMemoryJobStore>, Arc<InMemoryWorkQueue>>;

    fn service_with(config: OrchestratorConfig) -> Service {
        OrchestrationService::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryWorkQueue::new(Duration::from_secs(30))),
            config,
        )
    }

    fn service() -> Service {
        service_with(OrchestratorConfig::default())
    }

    fn report(v: JsonValue) -> CompletionReport {
        CompletionReport::success(v, Duration::from_millis(250))
    }

    #[test]
    fn create_job_materializes_enqueued_tasks() {
        let svc = service();
        let job = svc.create_job("compute", 3, json!({})).unwrap();

        assert_eq!(job.status, JobStatus::Enqueued);
        assert_eq!(job.total_tasks, 3);
        assert_eq!((job.completed_tasks, job.failed_tasks), (0, 0));

        let tasks = svc.list_job_tasks(job.id).unwrap();
        assert_eq!(tasks.iter().map(|t| t.task_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Enqueued));
        assert!(tasks.iter().all(|t| t.max_retries == 3));

        let published: Vec<TaskMessage> = svc
            .queue()
            .bodies()
            .iter()
            .map(|b| TaskMessage::parse(b).unwrap())
            .collect();
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|m| m.job_id == job.id.to_string()));
    }

    #[test]
    fn create_job_validates_input() {
        let svc = service_with(OrchestratorConfig::default().with_max_tasks(5));
        assert!(matches!(svc.create_job("compute", 0, json!({})), Err(ServiceError::Validation(_))));
        assert!(matches!(svc.create_job("compute", 6, json!({})), Err(ServiceError::Validation(_))));
        assert!(matches!(svc.create_job("compute", 1, json!("x")), Err(ServiceError::Validation(_))));
        assert_eq!(svc.list_jobs(&ListJobsQuery::default()).unwrap().total, 0);
    }

    #[test]
    fn create_job_accepts_empty_job_type() {
        let svc = service();
        let job = svc.create_job("", 3, json!({})).unwrap();
        assert_eq!(job.job_type, "");
        assert_eq!(job.total_tasks, 3);
        assert_eq!(svc.queue().len(), 3);
    }

    #[test]
    fn publish_failure_does_not_roll_back_tasks() {
        let svc = service();
        svc.queue().set_available(false);
        let job = svc.create_job("compute", 2, json!({})).unwrap();
        svc.queue().set_available(true);

        assert_eq!(job.status, JobStatus::Enqueued);
        assert_eq!(svc.list_job_tasks(job.id).unwrap().len(), 2);
        assert!(svc.queue().is_empty());

        assert_eq!(svc.republish_job(job.id).unwrap(), 2);
        assert_eq!(svc.queue().len(), 2);
    }

    #[test]
    fn repeated_failures_exhaust_retries_and_reconcile() {
        let svc = service();
        let job = svc.create_job("compute", 2, json!({})).unwrap();
        let t0 = TaskId::derive(job.id, 0);
        let t1 = TaskId::derive(job.id, 1);

        svc.mark_failed(&t0, "boom").unwrap();
        svc.mark_failed(&t0, "boom").unwrap();
        let task = svc.mark_failed(&t0, "boom").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);

        let job_now = svc.get_job(job.id).unwrap();
        assert_eq!(job_now.failed_tasks, 1);
        assert!(!job_now.is_terminal());

        svc.mark_complete(&t1, &report(json!({"ok": true}))).unwrap();
        let done = svc.get_job(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.completed_tasks, done.failed_tasks), (1, 1));
    }

    #[test]
    fn retrying_failure_does_not_touch_job_counters() {
        let svc = service();
        let job = svc.create_job("compute", 1, json!({})).unwrap();
        let task = svc.mark_failed(&TaskId::derive(job.id, 0), "transient").unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(svc.get_job(job.id).unwrap().failed_tasks, 0);
    }

    #[test]
    fn duplicate_completion_is_counted_once() {
        let svc = service();
        let job = svc.create_job("compute", 2, json!({})).unwrap();
        let t0 = TaskId::derive(job.id, 0);

        let first = svc.mark_complete(&t0, &report(json!({"v": 1}))).unwrap();
        let second = svc.mark_complete(&t0, &report(json!({"v": 2}))).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.result, Some(json!({"v": 1})));

        let job = svc.get_job(job.id).unwrap();
        assert_eq!(job.completed_tasks, 1);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn single_task_job_runs_then_completes() {
        let svc = service();
        let job = svc.create_job("compute", 1, json!({})).unwrap();
        assert_eq!(job.status, JobStatus::Enqueued);
        let t0 = TaskId::derive(job.id, 0);

        svc.mark_running(&t0).unwrap();
        let running = svc.get_job(job.id).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        svc.mark_complete(&t0, &report(json!({}))).unwrap();
        let done = svc.get_job(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
    }

    #[test]
    fn strict_policy_fails_job_on_any_failure() {
        let svc = service_with(
            OrchestratorConfig::default()
                .with_max_task_retries(1)
                .with_completion_policy(CompletionPolicy::FailOnAnyFailure),
        );
        let job = svc.create_job("compute", 2, json!({})).unwrap();
        svc.mark_complete(&TaskId::derive(job.id, 0), &report(json!({}))).unwrap();
        svc.mark_failed(&TaskId::derive(job.id, 1), "boom").unwrap();

        let job = svc.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("1 of 2 tasks failed"));
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let svc = service();
        let missing = JobId::new();
        assert!(matches!(svc.get_job(missing), Err(ServiceError::NotFound { entity: "job", .. })));
        assert!(matches!(svc.list_job_tasks(missing), Err(ServiceError::NotFound { .. })));
        assert!(matches!(svc.delete_job(missing), Err(ServiceError::NotFound { .. })));

        let task = TaskId::derive(missing, 0);
        assert!(matches!(svc.get_task(&task), Err(ServiceError::NotFound { entity: "task", .. })));
        assert!(matches!(svc.mark_running(&task), Err(ServiceError::NotFound { .. })));
        assert!(matches!(
            svc.mark_complete(&task, &CompletionReport::default()),
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(svc.mark_failed(&task, "x"), Err(ServiceError::NotFound { .. })));
    }

    #[test]
    fn list_jobs_pages_and_validates() {
        let svc = service();
        for i in 0..5 {
            svc.create_job(if i % 2 == 0 { "etl" } else { "render" }, 1, json!({})).unwrap();
        }

        let page = svc
            .list_jobs(&ListJobsQuery { page: 2, page_size: 2, search: None })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.jobs.len(), 2);

        let etl = svc
            .list_jobs(&ListJobsQuery { page: 1, page_size: 10, search: Some("ETL".into()) })
            .unwrap();
        assert_eq!(etl.total, 3);

        assert!(matches!(
            svc.list_jobs(&ListJobsQuery { page: 0, page_size: 10, search: None }),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            svc.list_jobs(&ListJobsQuery { page: 1, page_size: 101, search: None }),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn delete_job_removes_tasks() {
        let svc = service();
        let job = svc.create_job("compute", 3, json!({})).unwrap();
        assert_eq!(svc.delete_job(job.id).unwrap(), 3);
        assert!(matches!(svc.get_task(&TaskId::derive(job.id, 0)), Err(ServiceError::NotFound { .. })));
    }

    #[test]
    fn requeue_moves_retrying_tasks_back_onto_the_queue() {
        let svc = service();
        let job = svc.create_job("compute", 2, json!({})).unwrap();
        // Drain the initial messages as a worker would.
        for d in svc.queue().receive(10, Duration::ZERO).unwrap() {
            svc.queue().delete(&d.receipt).unwrap();
        }

        let t0 = TaskId::derive(job.id, 0);
        svc.mark_failed(&t0, "transient").unwrap();

        assert_eq!(svc.requeue_retrying(10).unwrap(), 1);
        assert_eq!(svc.get_task(&t0).unwrap().status, TaskStatus::Enqueued);
        assert_eq!(svc.get_task(&t0).unwrap().retry_count, 1);

        let bodies = svc.queue().bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(TaskMessage::parse(&bodies[0]).unwrap().task_id, t0.to_string());

        assert_eq!(svc.requeue_retrying(10).unwrap(), 0);
    }

    #[test]
    fn failed_requeue_publish_releases_task() {
        let svc = service();
        let job = svc.create_job("compute", 1, json!({})).unwrap();
        let t0 = TaskId::derive(job.id, 0);
        svc.mark_failed(&t0, "transient").unwrap();

        svc.queue().set_available(false);
        assert!(matches!(svc.requeue_retrying(10), Err(ServiceError::Queue(_))));
        assert_eq!(svc.get_task(&t0).unwrap().status, TaskStatus::Retrying);

        svc.queue().set_available(true);
        assert_eq!(svc.requeue_retrying(10).unwrap(), 1);
    }

    #[test]
    fn concurrent_duplicate_reports_keep_counters_exact() {
        let svc = Arc::new(service());
        let job = svc.create_job("compute", 8, json!({})).unwrap();

        let handles: Vec<_> = (0..16u32)
            .map(|i| {
                let svc = svc.clone();
                let task_id = TaskId::derive(job.id, i % 8);
                thread::spawn(move || {
                    svc.mark_running(&task_id).unwrap();
                    svc.mark_complete(&task_id, &report(json!({"worker": i}))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let job = svc.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_tasks, 8);
        assert_eq!(job.failed_tasks, 0);
    }
}
