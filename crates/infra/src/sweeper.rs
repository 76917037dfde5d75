//! Background re-enqueue sweep for RETRYING tasks.
//!
//! Workers delete a message after reporting a failure, so a RETRYING task has
//! no message left in the queue. The sweeper periodically hands those tasks
//! back to the queue via [`OrchestrationService::requeue_retrying`].

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::queue::WorkQueue;
use crate::service::{OrchestrationService, ServiceResult};
use crate::store::JobStore;

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub tasks_requeued: u64,
    pub sweep_errors: u64,
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the current sweep to finish.
    ///
    /// Returns the final stats.
    pub fn shutdown(mut self) -> SweeperStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Periodic RETRYING → ENQUEUED sweep.
pub struct RetrySweeper<S, Q> {
    service: Arc<OrchestrationService<S, Q>>,
    interval: Duration,
    batch: usize,
}

impl<S, Q> RetrySweeper<S, Q>
where
    S: JobStore + 'static,
    Q: WorkQueue + 'static,
{
    /// Interval and batch size come from the service's `OrchestratorConfig`.
    pub fn new(service: Arc<OrchestrationService<S, Q>>) -> Self {
        let interval = service.config().retry_sweep_interval;
        let batch = service.config().retry_sweep_batch;
        Self {
            service,
            interval,
            batch,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep, draining up to `batch` tasks per round until a round
    /// comes back short.
    pub fn sweep_once(&self) -> ServiceResult<usize> {
        let mut total = 0;
        loop {
            let n = self.service.requeue_retrying(self.batch)?;
            total += n;
            if n < self.batch {
                return Ok(total);
            }
        }
    }

    /// Spawn the sweeper in a background thread.
    pub fn spawn(self) -> std::io::Result<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("retry-sweeper".to_string())
            .spawn(move || sweeper_loop(self, shutdown_rx, stats_clone))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn sweeper_loop<S, Q>(
    sweeper: RetrySweeper<S, Q>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    S: JobStore + 'static,
    Q: WorkQueue + 'static,
{
    info!(interval_ms = sweeper.interval.as_millis() as u64, batch = sweeper.batch, "retry sweeper started");

    loop {
        let started = Instant::now();
        let result = sweeper.sweep_once();

        if let Ok(mut s) = stats.lock() {
            s.sweeps += 1;
            match &result {
                Ok(n) => s.tasks_requeued += *n as u64,
                Err(_) => s.sweep_errors += 1,
            }
        }
        if let Err(e) = result {
            error!(error = %e, "retry sweep failed");
        }

        // Sleeping on the shutdown channel wakes us immediately on shutdown.
        let wait = sweeper.interval.saturating_sub(started.elapsed());
        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("retry sweeper stopped");
}
