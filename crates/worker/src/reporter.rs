//! Outcome reporting from a worker back to the orchestrator.

use std::sync::Arc;

use jobmesh_core::{CompletionReport, FailureReport, TaskId};
use jobmesh_infra::{ConfigError, JobStore, OrchestrationService, ServiceError, WorkQueue};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::debug;

use crate::config::WorkerConfig;

/// Report error, classified by what the worker should do about it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    /// Orchestrator unreachable or failing; the report may succeed later.
    #[error("transient report failure: {0}")]
    Transient(String),

    /// The task (or its job) no longer exists; retrying cannot help.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The orchestrator refused the report as invalid.
    #[error("report rejected: {0}")]
    Rejected(String),
}

/// Lifecycle reports a worker sends for each task it handles.
pub trait TaskReporter: Send + Sync {
    fn mark_running(&self, task_id: &TaskId) -> Result<(), ReportError>;

    fn mark_complete(&self, task_id: &TaskId, report: &CompletionReport) -> Result<(), ReportError>;

    fn mark_failed(&self, task_id: &TaskId, error_message: &str) -> Result<(), ReportError>;
}

impl<R> TaskReporter for Arc<R>
where
    R: TaskReporter + ?Sized,
{
    fn mark_running(&self, task_id: &TaskId) -> Result<(), ReportError> {
        (**self).mark_running(task_id)
    }

    fn mark_complete(&self, task_id: &TaskId, report: &CompletionReport) -> Result<(), ReportError> {
        (**self).mark_complete(task_id, report)
    }

    fn mark_failed(&self, task_id: &TaskId, error_message: &str) -> Result<(), ReportError> {
        (**self).mark_failed(task_id, error_message)
    }
}

impl From<ServiceError> for ReportError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::NotFound { .. } => ReportError::NotFound(e.to_string()),
            ServiceError::Validation(_) | ServiceError::Conflict(_) => {
                ReportError::Rejected(e.to_string())
            }
            ServiceError::Store(_) | ServiceError::Queue(_) => ReportError::Transient(e.to_string()),
        }
    }
}

/// Reports straight into an in-process [`OrchestrationService`] (embedded workers).
pub struct ServiceReporter<S, Q> {
    service: Arc<OrchestrationService<S, Q>>,
}

impl<S, Q> ServiceReporter<S, Q> {
    pub fn new(service: Arc<OrchestrationService<S, Q>>) -> Self {
        Self { service }
    }
}

impl<S, Q> TaskReporter for ServiceReporter<S, Q>
where
    S: JobStore,
    Q: WorkQueue,
{
    fn mark_running(&self, task_id: &TaskId) -> Result<(), ReportError> {
        self.service.mark_running(task_id)?;
        Ok(())
    }

    fn mark_complete(&self, task_id: &TaskId, report: &CompletionReport) -> Result<(), ReportError> {
        self.service.mark_complete(task_id, report)?;
        Ok(())
    }

    fn mark_failed(&self, task_id: &TaskId, error_message: &str) -> Result<(), ReportError> {
        self.service.mark_failed(task_id, error_message)?;
        Ok(())
    }
}

/// Reports over the HTTP API (`/api/v1/tasks/{id}/...`).
///
/// Uses the blocking client: must not be constructed or used from inside an
/// async runtime.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: Client,
    base_url: String,
}

impl HttpReporter {
    pub fn new(config: &WorkerConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.report_timeout)
            .user_agent(format!("jobmesh-worker/{}", config.worker_id))
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "API_BASE_URL",
                value: config.api_base_url.clone(),
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn task_url(&self, task_id: &TaskId, action: &str) -> String {
        format!("{}/api/v1/tasks/{}/{}", self.base_url, task_id, action)
    }

    fn post<B: serde::Serialize + ?Sized>(
        &self,
        task_id: &TaskId,
        action: &str,
        body: &B,
    ) -> Result<(), ReportError> {
        let url = self.task_url(task_id, action);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| ReportError::Transient(format!("POST {url}: {e}")))?;

        let status = response.status();
        debug!(task_id = %task_id, action, status = status.as_u16(), "report sent");
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().unwrap_or_default();
        Err(classify(status, format!("POST {url} returned {status}: {detail}")))
    }
}

fn classify(status: StatusCode, detail: String) -> ReportError {
    if status == StatusCode::NOT_FOUND {
        ReportError::NotFound(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        ReportError::Transient(detail)
    } else if status.is_client_error() {
        ReportError::Rejected(detail)
    } else {
        ReportError::Transient(detail)
    }
}

impl TaskReporter for HttpReporter {
    fn mark_running(&self, task_id: &TaskId) -> Result<(), ReportError> {
        self.post(task_id, "running", &serde_json::json!({}))
    }

    fn mark_complete(&self, task_id: &TaskId, report: &CompletionReport) -> Result<(), ReportError> {
        self.post(task_id, "complete", report)
    }

    fn mark_failed(&self, task_id: &TaskId, error_message: &str) -> Result<(), ReportError> {
        self.post(task_id, "failed", &FailureReport::new(error_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_infra::{QueueError, StoreError};

    #[test]
    fn service_errors_map_to_worker_actions() {
        let not_found = ServiceError::NotFound {
            entity: "task",
            id: "x".into(),
        };
        assert!(matches!(ReportError::from(not_found), ReportError::NotFound(_)));
        assert!(matches!(
            ReportError::from(ServiceError::Validation("bad".into())),
            ReportError::Rejected(_)
        ));
        assert!(matches!(
            ReportError::from(ServiceError::Store(StoreError::Storage("down".into()))),
            ReportError::Transient(_)
        ));
        assert!(matches!(
            ReportError::from(ServiceError::Queue(QueueError::Unavailable("down".into()))),
            ReportError::Transient(_)
        ));
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(classify(StatusCode::NOT_FOUND, String::new()), ReportError::NotFound(_)));
        assert!(matches!(classify(StatusCode::BAD_REQUEST, String::new()), ReportError::Rejected(_)));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            ReportError::Transient(_)
        ));
        assert!(matches!(classify(StatusCode::BAD_GATEWAY, String::new()), ReportError::Transient(_)));
    }

    #[test]
    fn task_urls_are_rooted_at_the_api_prefix() {
        let cfg = WorkerConfig::default();
        let reporter = HttpReporter::new(&cfg).unwrap();
        let id: TaskId = "abc-task-0".parse().unwrap();
        assert_eq!(
            reporter.task_url(&id, "complete"),
            "http://localhost:8000/api/v1/tasks/abc-task-0/complete"
        );
    }

    #[test]
    fn unreachable_api_is_transient() {
        let cfg = WorkerConfig {
            api_base_url: "http://127.0.0.1:9".to_string(),
            report_timeout: std::time::Duration::from_millis(500),
            ..WorkerConfig::default()
        };
        let reporter = HttpReporter::new(&cfg).unwrap();
        let id: TaskId = "abc-task-0".parse().unwrap();
        assert!(matches!(reporter.mark_running(&id), Err(ReportError::Transient(_))));
    }
}
