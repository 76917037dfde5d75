//! Job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::status::JobStatus;
use crate::task::Task;

/// A job split into `total_tasks` independently executable tasks.
///
/// Counters are written only by the reconciler, from authoritative task
/// statuses, so they never drift under duplicate or concurrent reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub parameters: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Validate a creation request and build the PENDING job.
    ///
    /// `job_type` is a free-form tag. `parameters` must be a JSON object;
    /// `null` is treated as `{}`.
    pub fn create(
        job_type: impl Into<String>,
        num_tasks: u32,
        parameters: JsonValue,
        max_tasks: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let job_type = job_type.into();
        if num_tasks < 1 || num_tasks > max_tasks {
            return Err(DomainError::validation(format!(
                "num_tasks must be between 1 and {max_tasks}, got {num_tasks}"
            )));
        }
        let parameters = match parameters {
            JsonValue::Null => JsonValue::Object(Default::default()),
            JsonValue::Object(map) => JsonValue::Object(map),
            _ => return Err(DomainError::validation("parameters must be a JSON object")),
        };

        Ok(Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            total_tasks: num_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            parameters,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of tasks in a terminal state, as last reconciled.
    pub fn finished_tasks(&self) -> u32 {
        self.completed_tasks + self.failed_tasks
    }

    /// Materialize the dense task set `0..total_tasks`, inheriting the job parameters.
    pub fn build_tasks(&self, max_retries: u32, now: DateTime<Utc>) -> Vec<Task> {
        (0..self.total_tasks)
            .map(|index| Task::enqueued(self.id, index, max_retries, self.parameters.clone(), now))
            .collect()
    }

    /// PENDING → ENQUEUED once every task is persisted.
    pub fn mark_enqueued(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Enqueued;
        self.updated_at = now;
        true
    }

    /// PENDING/ENQUEUED → RUNNING when the first task starts.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Enqueued => {
                self.status = JobStatus::Running;
                self.started_at.get_or_insert(now);
                self.updated_at = now;
                true
            }
            JobStatus::Running
            | JobStatus::Completed
            | JobStatus::Failed
            | JobStatus::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::TaskStatus;
    use serde_json::json;

    #[test]
    fn create_rejects_out_of_range_task_counts() {
        let now = Utc::now();
        assert!(matches!(
            Job::create("compute", 0, json!({}), 10, now),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            Job::create("compute", 11, json!({}), 10, now),
            Err(DomainError::Validation(_))
        ));
        assert!(Job::create("compute", 10, json!({}), 10, now).is_ok());
    }

    #[test]
    fn create_accepts_any_type_but_rejects_non_object_parameters() {
        let now = Utc::now();
        let untyped = Job::create("", 1, json!({}), 10, now).unwrap();
        assert_eq!(untyped.job_type, "");
        assert!(Job::create(" ", 1, json!({}), 10, now).is_ok());
        assert!(Job::create("compute", 1, json!([1, 2]), 10, now).is_err());

        let job = Job::create("compute", 1, JsonValue::Null, 10, now).unwrap();
        assert_eq!(job.parameters, json!({}));
    }

    #[test]
    fn new_job_is_pending_with_zeroed_counters() {
        let job = Job::create("compute", 3, json!({"k": "v"}), 10, Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_tasks, 3);
        assert_eq!(job.completed_tasks, 0);
        assert_eq!(job.failed_tasks, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn build_tasks_yields_dense_indices() {
        let job = Job::create("compute", 4, json!({"k": "v"}), 10, Utc::now()).unwrap();
        let tasks = job.build_tasks(3, Utc::now());

        let indices: Vec<u32> = tasks.iter().map(|t| t.task_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Enqueued));
        assert!(tasks.iter().all(|t| t.job_id == job.id));
        assert!(tasks.iter().all(|t| t.parameters == json!({"k": "v"})));
        assert!(tasks.iter().all(|t| t.max_retries == 3 && t.retry_count == 0));
    }

    #[test]
    fn status_progression() {
        let now = Utc::now();
        let mut job = Job::create("compute", 1, json!({}), 10, now).unwrap();

        assert!(job.mark_enqueued(now));
        assert!(!job.mark_enqueued(now));
        assert_eq!(job.status, JobStatus::Enqueued);

        assert!(job.mark_started(now));
        assert!(!job.mark_started(now));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(now));
    }
}
