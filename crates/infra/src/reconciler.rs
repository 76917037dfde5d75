//! Status reconciler: re-derives a job's counters and status from its tasks.

use chrono::Utc;
use tracing::{debug, info};

use jobmesh_core::{CompletionPolicy, Job, JobId, reconcile};

use crate::store::{JobStore, StoreError};

/// Applies [`reconcile`] inside the store's reconcile transaction.
///
/// Invoked after every transition of a task into a terminal state. Because it
/// recounts instead of incrementing, calling it any number of times for the
/// same job state is harmless.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusReconciler {
    policy: CompletionPolicy,
}

impl StatusReconciler {
    pub fn new(policy: CompletionPolicy) -> Self {
        Self { policy }
    }

    pub fn reconcile<S>(&self, store: &S, job_id: JobId) -> Result<Job, StoreError>
    where
        S: JobStore + ?Sized,
    {
        let policy = self.policy;
        let mut changed = false;
        let job = store.reconcile_job(job_id, &mut |job, counts| {
            changed = reconcile(job, counts, policy, Utc::now());
            changed
        })?;

        if changed && job.is_terminal() {
            info!(
                job_id = %job.id,
                status = %job.status,
                completed = job.completed_tasks,
                failed = job.failed_tasks,
                total = job.total_tasks,
                "job finished"
            );
        } else if changed {
            debug!(
                job_id = %job.id,
                completed = job.completed_tasks,
                failed = job.failed_tasks,
                total = job.total_tasks,
                "job progress reconciled"
            );
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use jobmesh_core::{JobStatus, TaskId};
    use serde_json::json;

    fn job_with_tasks(store: &InMemoryJobStore, n: u32, max_retries: u32) -> Job {
        let mut job = Job::create("compute", n, json!({}), 100, Utc::now()).unwrap();
        job.mark_enqueued(Utc::now());
        store.insert_job(&job).unwrap();
        store.insert_tasks(&job.build_tasks(max_retries, Utc::now())).unwrap();
        job
    }

    fn complete(store: &InMemoryJobStore, job: &Job, idx: u32) {
        store
            .update_task(&TaskId::derive(job.id, idx), &mut |t| {
                t.mark_completed(None, None, Utc::now()).changed()
            })
            .unwrap();
    }

    fn fail_terminally(store: &InMemoryJobStore, job: &Job, idx: u32) {
        store
            .update_task(&TaskId::derive(job.id, idx), &mut |t| {
                t.max_retries = 1;
                t.mark_failed("boom", Utc::now()).changed()
            })
            .unwrap();
    }

    #[test]
    fn partial_progress_moves_job_to_running() {
        let store = InMemoryJobStore::new();
        let job = job_with_tasks(&store, 3, 3);
        complete(&store, &job, 0);

        let job = StatusReconciler::default().reconcile(&store, job.id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.completed_tasks, 1);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn default_policy_completes_despite_failures() {
        let store = InMemoryJobStore::new();
        let job = job_with_tasks(&store, 2, 3);
        complete(&store, &job, 0);
        fail_terminally(&store, &job, 1);

        let job = StatusReconciler::default().reconcile(&store, job.id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.completed_tasks, job.failed_tasks), (1, 1));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn strict_policy_fails_the_job() {
        let store = InMemoryJobStore::new();
        let job = job_with_tasks(&store, 2, 3);
        complete(&store, &job, 0);
        fail_terminally(&store, &job, 1);

        let job = StatusReconciler::new(CompletionPolicy::FailOnAnyFailure)
            .reconcile(&store, job.id)
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("1 of 2 tasks failed"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let store = InMemoryJobStore::new();
        let job = job_with_tasks(&store, 1, 3);
        complete(&store, &job, 0);

        let reconciler = StatusReconciler::default();
        let first = reconciler.reconcile(&store, job.id).unwrap();
        let second = reconciler.reconcile(&store, job.id).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(
            StatusReconciler::default().reconcile(&store, JobId::new()),
            Err(StoreError::NotFound { entity: "job", .. })
        ));
    }
}
