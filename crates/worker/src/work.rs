//! Work functions: what a worker actually runs for a task.

use std::thread;
use std::time::{Duration, Instant};

use jobmesh_core::TaskMessage;
use serde_json::{Value as JsonValue, json};
use tracing::info;

/// A work function failed; the task's retry budget decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct WorkError(pub String);

impl WorkError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Executes one task. Must be safe to run more than once for the same task.
pub trait WorkFunction: Send + Sync {
    fn execute(&self, message: &TaskMessage) -> Result<JsonValue, WorkError>;
}

impl<F> WorkFunction for F
where
    F: Fn(&TaskMessage) -> Result<JsonValue, WorkError> + Send + Sync,
{
    fn execute(&self, message: &TaskMessage) -> Result<JsonValue, WorkError> {
        self(message)
    }
}

const DEFAULT_WORK_DURATION_SECS: f64 = 2.0;
const DEFAULT_MATRIX_SIZE: u64 = 100;
const MAX_MATRIX_SIZE: u64 = 2_000;

/// Synthetic workloads selected by `parameters.work_type`:
///
/// - `cpu_bound`: busy loop for `work_duration_seconds` (the default)
/// - `io_bound`: sleep for `work_duration_seconds`
/// - `matrix_multiply`: multiply two `matrix_size`² matrices, then sleep
/// - anything else: sleep
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedWorkload;

impl SimulatedWorkload {
    pub fn new() -> Self {
        Self
    }
}

fn duration_param(params: &JsonValue) -> Result<Duration, WorkError> {
    match params.get("work_duration_seconds") {
        None | Some(JsonValue::Null) => Ok(Duration::from_secs_f64(DEFAULT_WORK_DURATION_SECS)),
        Some(v) => v
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| WorkError::new(format!("invalid work_duration_seconds: {v}"))),
    }
}

fn matrix_size_param(params: &JsonValue) -> Result<usize, WorkError> {
    let size = match params.get("matrix_size") {
        None | Some(JsonValue::Null) => DEFAULT_MATRIX_SIZE,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| WorkError::new(format!("invalid matrix_size: {v}")))?,
    };
    if size == 0 || size > MAX_MATRIX_SIZE {
        return Err(WorkError::new(format!(
            "matrix_size must be between 1 and {MAX_MATRIX_SIZE}, got {size}"
        )));
    }
    Ok(size as usize)
}

fn busy_loop(duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut acc: u64 = 0;
    while Instant::now() < deadline {
        for i in 0..1_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        std::hint::black_box(acc);
        thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Product of two deterministic `n`×`n` matrices; returns the trace.
fn matrix_multiply(n: usize) -> f64 {
    let a: Vec<f64> = (0..n * n).map(|i| ((i * 7 + 3) % 11) as f64 / 11.0).collect();
    let b: Vec<f64> = (0..n * n).map(|i| ((i * 5 + 1) % 13) as f64 / 13.0).collect();
    let mut c = vec![0.0f64; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                c[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    (0..n).map(|i| c[i * n + i]).sum()
}

impl WorkFunction for SimulatedWorkload {
    fn execute(&self, message: &TaskMessage) -> Result<JsonValue, WorkError> {
        let started = Instant::now();
        let params = &message.parameters;
        let duration = duration_param(params)?;
        let work_type = params
            .get("work_type")
            .and_then(JsonValue::as_str)
            .unwrap_or("cpu_bound")
            .to_string();

        info!(
            task_id = %message.task_id,
            job_id = %message.job_id,
            work_type = %work_type,
            duration_secs = duration.as_secs_f64(),
            "processing task"
        );

        match work_type.as_str() {
            "cpu_bound" => busy_loop(duration),
            "matrix_multiply" => {
                let size = matrix_size_param(params)?;
                std::hint::black_box(matrix_multiply(size));
                thread::sleep(duration);
            }
            _ => thread::sleep(duration),
        }

        Ok(json!({
            "task_id": message.task_id,
            "job_id": message.job_id,
            "task_index": message.task_index,
            "processing_time_seconds": started.elapsed().as_secs_f64(),
            "work_type": work_type,
            "status": "completed",
        }))
    }
}
