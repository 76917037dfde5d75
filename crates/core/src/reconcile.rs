//! Job status reconciliation rule.
//!
//! The rule is pure: callers count the authoritative task statuses of a job
//! (inside the same transaction that writes the job) and hand the counts here.
//! Recounting instead of incrementing keeps the counters correct under
//! duplicate reports and concurrent completions of sibling tasks.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::job::Job;
use crate::status::{JobStatus, TaskStatus};

/// How a job whose tasks are all terminal is classified.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// COMPLETED once every task is terminal; failures surface only via `failed_tasks`.
    #[default]
    CompleteWhenAllTerminal,
    /// FAILED if any task failed terminally, COMPLETED otherwise.
    FailOnAnyFailure,
}

impl FromStr for CompletionPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete_when_all_terminal" => Ok(CompletionPolicy::CompleteWhenAllTerminal),
            "fail_on_any_failure" => Ok(CompletionPolicy::FailOnAnyFailure),
            other => Err(DomainError::validation(format!(
                "unknown completion policy: {other}"
            ))),
        }
    }
}

/// Terminal task counts for one job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub completed: u32,
    pub failed: u32,
}

impl TaskCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        statuses
            .into_iter()
            .fold(Self::default(), |mut acc, status| {
                match status {
                    TaskStatus::Completed => acc.completed += 1,
                    TaskStatus::Failed => acc.failed += 1,
                    TaskStatus::Pending
                    | TaskStatus::Enqueued
                    | TaskStatus::Running
                    | TaskStatus::Retrying => {}
                }
                acc
            })
    }

    pub fn finished(&self) -> u32 {
        self.completed + self.failed
    }
}

/// Apply fresh task counts to `job`. Returns `true` if the job changed.
///
/// A terminal job is final and is left untouched.
pub fn reconcile(
    job: &mut Job,
    counts: TaskCounts,
    policy: CompletionPolicy,
    now: DateTime<Utc>,
) -> bool {
    if job.is_terminal() {
        return false;
    }

    let before = (job.status, job.completed_tasks, job.failed_tasks);
    job.completed_tasks = counts.completed;
    job.failed_tasks = counts.failed;

    let finished = counts.finished();
    if finished >= job.total_tasks {
        job.status = match policy {
            CompletionPolicy::FailOnAnyFailure if counts.failed > 0 => {
                job.error_message = Some(format!(
                    "{} of {} tasks failed",
                    counts.failed, job.total_tasks
                ));
                JobStatus::Failed
            }
            CompletionPolicy::FailOnAnyFailure | CompletionPolicy::CompleteWhenAllTerminal => {
                JobStatus::Completed
            }
        };
        job.started_at.get_or_insert(now);
        job.completed_at = Some(now);
    } else if finished > 0 {
        job.status = JobStatus::Running;
        job.started_at.get_or_insert(now);
    }

    let changed = before != (job.status, job.completed_tasks, job.failed_tasks);
    if changed {
        job.updated_at = now;
    }
    changed
}
