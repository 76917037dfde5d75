//! Worker loop: poll the work queue, execute tasks, report outcomes.
//!
//! Delete rules per delivery:
//! - malformed body: delete, never retried
//! - success: delete only once the completion report is acknowledged
//! - failure: report, then delete whatever the report outcome
//!
//! Anything not deleted reappears after the queue's visibility window.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Instant;

use jobmesh_core::{CompletionReport, TaskId, TaskMessage};
use jobmesh_infra::{Delivery, WorkQueue};
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::reporter::{ReportError, TaskReporter};
use crate::work::{WorkError, WorkFunction};

/// Why a delivery could not be turned into a task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Completion acknowledged, message deleted.
    Completed,
    /// Work failed, failure reported (best effort), message deleted.
    Failed,
    /// Body unusable, message deleted.
    Malformed,
    /// Completion not acknowledged; the queue will redeliver.
    LeftForRedelivery,
    /// Task or job no longer exists; message deleted.
    Orphaned,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub left_for_redelivery: u64,
    pub orphaned: u64,
    pub delete_failures: u64,
    pub poll_errors: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Ask the worker to stop without waiting for it.
    pub fn request_stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Stop polling and wait for the in-flight task to finish.
    ///
    /// Returns the final stats.
    pub fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct Worker<Q, R, W> {
    queue: Q,
    reporter: R,
    work: W,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<Q, R, W> Worker<Q, R, W>
where
    Q: WorkQueue + 'static,
    R: TaskReporter + 'static,
    W: WorkFunction + 'static,
{
    pub fn new(queue: Q, reporter: R, work: W, config: WorkerConfig) -> Self {
        Self {
            queue,
            reporter,
            work,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Receive one batch and process it. Returns the number of deliveries handled.
    pub fn poll_once(&self) -> Result<usize, jobmesh_infra::QueueError> {
        let batch = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time)?;
        for delivery in &batch {
            self.process_delivery(delivery);
        }
        Ok(batch.len())
    }

    /// Handle one delivery end to end, applying the delete rules.
    pub fn process_delivery(&self, delivery: &Delivery) -> Disposition {
        self.record(|s| s.received += 1);

        let (message, task_id) = match parse_delivery(delivery) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    worker_id = %self.config.worker_id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "dropping malformed message"
                );
                self.delete(delivery);
                self.record(|s| s.malformed += 1);
                return Disposition::Malformed;
            }
        };

        debug!(
            worker_id = %self.config.worker_id,
            task_id = %task_id,
            receive_count = delivery.receive_count,
            "task received"
        );

        if let Err(e) = self.reporter.mark_running(&task_id) {
            warn!(task_id = %task_id, error = %e, "failed to report task running");
        }

        let started = Instant::now();
        let outcome = self.execute(&message);
        let elapsed = started.elapsed();

        let disposition = match outcome {
            Ok(result) => {
                let report = CompletionReport::success(result, elapsed);
                match self.reporter.mark_complete(&task_id, &report) {
                    Ok(()) => {
                        info!(
                            task_id = %task_id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "task completed"
                        );
                        self.delete(delivery);
                        Disposition::Completed
                    }
                    Err(ReportError::NotFound(detail)) => {
                        error!(task_id = %task_id, detail = %detail, "completed task no longer exists");
                        self.delete(delivery);
                        Disposition::Orphaned
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "completion not acknowledged, leaving message for redelivery");
                        Disposition::LeftForRedelivery
                    }
                }
            }
            Err(work_error) => {
                warn!(task_id = %task_id, error = %work_error, "task failed");
                if let Err(e) = self.reporter.mark_failed(&task_id, &work_error.0) {
                    error!(task_id = %task_id, error = %e, "failed to report task failure");
                }
                self.delete(delivery);
                Disposition::Failed
            }
        };

        self.record(|s| match disposition {
            Disposition::Completed => s.completed += 1,
            Disposition::Failed => s.failed += 1,
            Disposition::Malformed => s.malformed += 1,
            Disposition::LeftForRedelivery => s.left_for_redelivery += 1,
            Disposition::Orphaned => s.orphaned += 1,
        });
        disposition
    }

    /// Run the work function; a panic counts as a work error.
    fn execute(&self, message: &TaskMessage) -> Result<serde_json::Value, WorkError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.work.execute(message))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(WorkError::new(format!("work function panicked: {detail}")))
            }
        }
    }

    fn delete(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.delete(&delivery.receipt) {
            warn!(message_id = %delivery.message_id, error = %e, "failed to delete message");
            self.record(|s| s.delete_failures += 1);
        }
    }

    /// Spawn the worker loop in a background thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(format!("worker-{}", self.config.worker_id))
            .spawn(move || worker_loop(self, shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn parse_delivery(delivery: &Delivery) -> Result<(TaskMessage, TaskId), MessageError> {
    let message =
        TaskMessage::parse(&delivery.body).map_err(|e| MessageError::Malformed(e.to_string()))?;
    let task_id = message
        .task_id()
        .map_err(|e| MessageError::Malformed(e.to_string()))?;
    Ok((message, task_id))
}

fn stop_requested(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

fn worker_loop<Q, R, W>(worker: Worker<Q, R, W>, shutdown_rx: mpsc::Receiver<()>)
where
    Q: WorkQueue + 'static,
    R: TaskReporter + 'static,
    W: WorkFunction + 'static,
{
    info!(
        worker_id = %worker.config.worker_id,
        max_messages = worker.config.max_messages,
        "worker started"
    );

    'poll: while !stop_requested(&shutdown_rx) {
        let batch = match worker
            .queue
            .receive(worker.config.max_messages, worker.config.wait_time)
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id = %worker.config.worker_id, error = %e, "receive failed");
                worker.record(|s| s.poll_errors += 1);
                Vec::new()
            }
        };

        if batch.is_empty() {
            match shutdown_rx.recv_timeout(worker.config.poll_interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        for delivery in &batch {
            // Unprocessed items of the batch are redelivered after the visibility window.
            if stop_requested(&shutdown_rx) {
                break 'poll;
            }
            worker.process_delivery(delivery);
        }
    }

    info!(worker_id = %worker.config.worker_id, "worker stopped");
}
