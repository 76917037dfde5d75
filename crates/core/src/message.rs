//! Wire shapes shared by the orchestrator, the work queue and workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;

/// Queue message published once per task (and again on re-enqueue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub job_id: String,
    pub task_index: u32,
    #[serde(default = "empty_object")]
    pub parameters: JsonValue,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl TaskMessage {
    /// Parse a raw queue body.
    ///
    /// Any error here is a protocol violation: the message can never become
    /// valid by redelivery.
    pub fn parse(body: &str) -> DomainResult<Self> {
        let msg: TaskMessage = serde_json::from_str(body)
            .map_err(|e| DomainError::validation(format!("malformed task message: {e}")))?;
        if msg.task_id.trim().is_empty() {
            return Err(DomainError::validation("malformed task message: empty task_id"));
        }
        if msg.job_id.trim().is_empty() {
            return Err(DomainError::validation("malformed task message: empty job_id"));
        }
        Ok(msg)
    }

    pub fn task_id(&self) -> DomainResult<TaskId> {
        self.task_id.parse()
    }
}

/// Completion report sent by a worker after a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub processing_time_seconds: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl CompletionReport {
    pub fn success(result: JsonValue, elapsed: Duration) -> Self {
        Self {
            result: Some(result),
            processing_time_seconds: Some(elapsed.as_secs_f64()),
            error_message: None,
        }
    }

    /// Reported duration, ignoring negative or non-finite values.
    pub fn processing_time(&self) -> Option<Duration> {
        self.processing_time_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Failure report sent by a worker after the work function errored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    #[serde(default)]
    pub error_message: Option<String>,
}

impl FailureReport {
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: Some(error_message.into()),
        }
    }

    pub fn message_or_default(&self) -> &str {
        self.error_message.as_deref().unwrap_or("Unknown error")
    }
}
