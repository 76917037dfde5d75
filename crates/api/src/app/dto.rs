use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobmesh_core::{Job, JobStatus, Task, TaskStatus};
use jobmesh_infra::{JobPage, ListJobsQuery};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    /// Signed so out-of-range counts reach the service's validation message
    pub num_tasks: i64,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
}

impl CreateJobRequest {
    pub fn num_tasks(&self) -> u32 {
        self.num_tasks.clamp(0, i64::from(u32::MAX)) as u32
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub search: Option<String>,
}

impl From<ListJobsParams> for ListJobsQuery {
    fn from(p: ListJobsParams) -> Self {
        let d = ListJobsQuery::default();
        Self {
            page: p.page.unwrap_or(d.page),
            page_size: p.page_size.unwrap_or(d.page_size),
            search: p.search.filter(|s| !s.trim().is_empty()),
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
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

impl From<Job> for JobResponse {
    fn from(j: Job) -> Self {
        Self {
            id: j.id.to_string(),
            job_type: j.job_type,
            status: j.status,
            total_tasks: j.total_tasks,
            completed_tasks: j.completed_tasks,
            failed_tasks: j.failed_tasks,
            parameters: j.parameters,
            created_at: j.created_at,
            updated_at: j.updated_at,
            started_at: j.started_at,
            completed_at: j.completed_at,
            error_message: j.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: usize,
}

impl From<JobPage> for JobListResponse {
    fn from(p: JobPage) -> Self {
        Self {
            jobs: p.jobs.into_iter().map(JobResponse::from).collect(),
            total: p.total,
            page: p.page,
            page_size: p.page_size,
            total_pages: p.total_pages,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub job_id: String,
    pub status: TaskStatus,
    pub task_index: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parameters: JsonValue,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_seconds: Option<f64>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id.to_string(),
            job_id: t.job_id.to_string(),
            status: t.status,
            task_index: t.task_index,
            retry_count: t.retry_count,
            max_retries: t.max_retries,
            parameters: t.parameters,
            result: t.result,
            error_message: t.error_message,
            created_at: t.created_at,
            updated_at: t.updated_at,
            started_at: t.started_at,
            completed_at: t.completed_at,
            processing_time_seconds: t.processing_time.map(|d| d.as_secs_f64()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: usize,
}

impl From<Vec<Task>> for TaskListResponse {
    fn from(tasks: Vec<Task>) -> Self {
        Self {
            total: tasks.len(),
            tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RepublishResponse {
    pub published: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn negative_and_huge_task_counts_are_clamped() {
        let mut req: CreateJobRequest =
            serde_json::from_value(json!({"job_type": "x", "num_tasks": -5})).unwrap();
        assert_eq!(req.num_tasks(), 0);
        req.num_tasks = i64::MAX;
        assert_eq!(req.num_tasks(), u32::MAX);
        assert!(req.parameters.is_none());
    }

    #[test]
    fn list_params_fall_back_to_defaults() {
        let q: ListJobsQuery = ListJobsParams {
            search: Some("  ".into()),
            ..Default::default()
        }
        .into();
        assert_eq!(q, ListJobsQuery::default());
    }

    #[test]
    fn task_response_reports_processing_time_in_seconds() {
        let job = Job::create("compute", 1, json!({}), 10, Utc::now()).unwrap();
        let mut task = job.build_tasks(3, Utc::now()).remove(0);
        task.processing_time = Some(std::time::Duration::from_millis(1500));

        let body = serde_json::to_value(TaskResponse::from(task)).unwrap();
        assert_eq!(body["processing_time_seconds"], json!(1.5));
        assert_eq!(body["status"], json!("ENQUEUED"));
    }
}
