//! Task state machine.
//!
//! Every transition is idempotent with respect to duplicate delivery: calling
//! the same transition twice leaves the task exactly as the first call did, and
//! the returned outcome tells the caller whether anything changed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{JobId, TaskId};
use crate::message::TaskMessage;
use crate::status::TaskStatus;

/// A single unit of work belonging to exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub status: TaskStatus,
    /// Position within the job, unique in `[0, total_tasks)`
    pub task_index: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parameters: JsonValue,
    /// Set only on success
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time: Option<Duration>,
}

/// Result of applying a completion report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Task transitioned to COMPLETED
    Completed,
    /// Duplicate report; nothing changed
    AlreadyCompleted,
    /// Late success after terminal failure; terminal states are final
    AlreadyFailed,
}

impl CompleteOutcome {
    pub fn changed(self) -> bool {
        matches!(self, CompleteOutcome::Completed)
    }
}

/// Result of applying a failure report.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Not yet exhausted; the task waits to be re-enqueued
    Retrying { retry_count: u32 },
    /// `retry_count` reached `max_retries`; task is terminally FAILED
    Exhausted,
    /// Task was already terminal; nothing changed
    AlreadyTerminal,
}

impl FailOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, FailOutcome::AlreadyTerminal)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FailOutcome::Exhausted)
    }
}

impl Task {
    /// Create the task at `task_index` of `job_id`, ready to be published.
    pub fn enqueued(
        job_id: JobId,
        task_index: u32,
        max_retries: u32,
        parameters: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::derive(job_id, task_index),
            job_id,
            status: TaskStatus::Enqueued,
            task_index,
            retry_count: 0,
            max_retries,
            parameters,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// PENDING/ENQUEUED → RUNNING. Returns `false` (no-op) for any other status.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Enqueued => {
                self.status = TaskStatus::Running;
                self.started_at = Some(now);
                self.updated_at = now;
                true
            }
            TaskStatus::Running
            | TaskStatus::Retrying
            | TaskStatus::Completed
            | TaskStatus::Failed => false,
        }
    }

    /// Record a successful execution.
    ///
    /// `processing_time` falls back to `completed_at - started_at` when the
    /// worker did not report one and a start time is known.
    pub fn mark_completed(
        &mut self,
        result: Option<JsonValue>,
        processing_time: Option<Duration>,
        now: DateTime<Utc>,
    ) -> CompleteOutcome {
        match self.status {
            TaskStatus::Completed => CompleteOutcome::AlreadyCompleted,
            TaskStatus::Failed => CompleteOutcome::AlreadyFailed,
            TaskStatus::Pending
            | TaskStatus::Enqueued
            | TaskStatus::Running
            | TaskStatus::Retrying => {
                self.status = TaskStatus::Completed;
                self.completed_at = Some(now);
                self.updated_at = now;
                self.result = result;
                self.processing_time = processing_time.or_else(|| {
                    self.started_at
                        .and_then(|started| (now - started).to_std().ok())
                });
                CompleteOutcome::Completed
            }
        }
    }

    /// Record a failed execution and advance the retry counter.
    pub fn mark_failed(&mut self, error_message: impl Into<String>, now: DateTime<Utc>) -> FailOutcome {
        if self.is_terminal() {
            return FailOutcome::AlreadyTerminal;
        }

        self.retry_count = self.retry_count.saturating_add(1);
        self.updated_at = now;

        if self.retry_count >= self.max_retries {
            self.status = TaskStatus::Failed;
            self.error_message = Some(error_message.into());
            self.completed_at = Some(now);
            FailOutcome::Exhausted
        } else {
            self.status = TaskStatus::Retrying;
            self.error_message = Some(error_message.into());
            FailOutcome::Retrying {
                retry_count: self.retry_count,
            }
        }
    }

    /// RETRYING → ENQUEUED, claimed by the re-enqueue sweep before publishing.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Retrying {
            return false;
        }
        self.status = TaskStatus::Enqueued;
        self.updated_at = now;
        true
    }

    /// Undo `requeue` after a failed publish so the next sweep picks the task up again.
    ///
    /// Only applies while the task is still ENQUEUED; a worker may already have
    /// picked up a duplicate message and moved it on.
    pub fn release_requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Enqueued || self.retry_count == 0 {
            return false;
        }
        self.status = TaskStatus::Retrying;
        self.updated_at = now;
        true
    }

    /// Queue message for this task.
    pub fn to_message(&self) -> TaskMessage {
        TaskMessage {
            task_id: self.id.to_string(),
            job_id: self.job_id.to_string(),
            task_index: self.task_index,
            parameters: self.parameters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use serde_json::json;

    fn task(max_retries: u32) -> Task {
        Task::enqueued(JobId::new(), 0, max_retries, json!({"n": 1}), Utc::now())
    }

    #[test]
    fn mark_running_is_idempotent() {
        let mut t = task(3);
        let first = Utc::now();
        assert!(t.mark_running(first));
        assert_eq!(t.status, TaskStatus::Running);

        assert!(!t.mark_running(first + ChronoDuration::seconds(5)));
        assert_eq!(t.started_at, Some(first));
    }

    #[test]
    fn mark_running_does_not_touch_terminal_tasks() {
        let mut t = task(3);
        t.mark_completed(None, None, Utc::now());
        assert!(!t.mark_running(Utc::now()));
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn duplicate_completion_leaves_state_unchanged() {
        let mut t = task(3);
        let started = Utc::now();
        t.mark_running(started);

        let done = started + ChronoDuration::seconds(2);
        assert_eq!(
            t.mark_completed(Some(json!({"v": 1})), None, done),
            CompleteOutcome::Completed
        );
        let snapshot = t.clone();

        let later = done + ChronoDuration::seconds(30);
        assert_eq!(
            t.mark_completed(Some(json!({"v": 2})), Some(Duration::from_secs(9)), later),
            CompleteOutcome::AlreadyCompleted
        );
        assert_eq!(t, snapshot);
    }

    #[test]
    fn processing_time_is_derived_from_start_when_not_reported() {
        let mut t = task(3);
        let started = Utc::now();
        t.mark_running(started);
        t.mark_completed(None, None, started + ChronoDuration::milliseconds(1500));
        assert_eq!(t.processing_time, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn reported_processing_time_wins() {
        let mut t = task(3);
        t.mark_running(Utc::now());
        t.mark_completed(None, Some(Duration::from_secs(4)), Utc::now());
        assert_eq!(t.processing_time, Some(Duration::from_secs(4)));
    }

    #[test]
    fn processing_time_unknown_without_start() {
        let mut t = task(3);
        t.mark_completed(None, None, Utc::now());
        assert_eq!(t.processing_time, None);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn failures_retry_until_max_then_fail() {
        let mut t = task(3);
        let now = Utc::now();

        assert_eq!(t.mark_failed("boom", now), FailOutcome::Retrying { retry_count: 1 });
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.mark_failed("boom", now), FailOutcome::Retrying { retry_count: 2 });
        assert_eq!(t.mark_failed("boom", now), FailOutcome::Exhausted);
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.retry_count, 3);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
        assert!(t.completed_at.is_some());

        assert_eq!(t.mark_failed("again", now), FailOutcome::AlreadyTerminal);
        assert_eq!(t.retry_count, 3);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn late_success_after_terminal_failure_is_ignored() {
        let mut t = task(1);
        assert_eq!(t.mark_failed("boom", Utc::now()), FailOutcome::Exhausted);
        assert_eq!(
            t.mark_completed(Some(json!({})), None, Utc::now()),
            CompleteOutcome::AlreadyFailed
        );
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.result.is_none());
    }

    #[test]
    fn failure_after_completion_is_ignored() {
        let mut t = task(3);
        t.mark_completed(None, None, Utc::now());
        assert_eq!(t.mark_failed("late", Utc::now()), FailOutcome::AlreadyTerminal);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn requeue_and_release() {
        let mut t = task(3);
        assert!(!t.requeue(Utc::now()));

        t.mark_failed("boom", Utc::now());
        assert!(t.requeue(Utc::now()));
        assert_eq!(t.status, TaskStatus::Enqueued);
        assert!(t.release_requeue(Utc::now()));
        assert_eq!(t.status, TaskStatus::Retrying);

        t.requeue(Utc::now());
        t.mark_running(Utc::now());
        assert!(!t.release_requeue(Utc::now()));
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn message_carries_task_identity_and_parameters() {
        let t = task(3);
        let msg = t.to_message();
        assert_eq!(msg.task_id, t.id.to_string());
        assert_eq!(msg.job_id, t.job_id.to_string());
        assert_eq!(msg.task_index, 0);
        assert_eq!(msg.parameters, json!({"n": 1}));
    }

    #[derive(Debug, Clone)]
    enum Report {
        Running,
        Complete,
        Fail,
        Requeue,
    }

    fn report() -> impl Strategy<Value = Report> {
        prop_oneof![
            Just(Report::Running),
            Just(Report::Complete),
            Just(Report::Fail),
            Just(Report::Requeue),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: under any interleaving of (possibly duplicated) reports,
        /// retry_count never exceeds max_retries, FAILED implies exhaustion,
        /// and a terminal task never leaves its terminal status.
        #[test]
        fn retry_and_terminal_invariants_hold(
            max_retries in 1u32..6,
            reports in prop::collection::vec(report(), 0..40)
        ) {
            let mut t = task(max_retries);
            let mut terminal: Option<TaskStatus> = None;

            for r in reports {
                let now = Utc::now();
                match r {
                    Report::Running => { t.mark_running(now); }
                    Report::Complete => { t.mark_completed(None, None, now); }
                    Report::Fail => { t.mark_failed("err", now); }
                    Report::Requeue => { t.requeue(now); }
                }

                prop_assert!(t.retry_count <= t.max_retries);
                if t.status == TaskStatus::Failed {
                    prop_assert!(t.retry_count >= t.max_retries);
                }
                if let Some(s) = terminal {
                    prop_assert_eq!(t.status, s);
                }
                if t.is_terminal() {
                    terminal = Some(t.status);
                }
            }
        }
    }
}
