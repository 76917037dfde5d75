//! Backend wiring: which store and queue the API runs on, plus the background
//! threads (retry sweeper, embedded workers) that share them.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Response;
use tracing::info;

use jobmesh_infra::{
    InMemoryJobStore, InMemoryWorkQueue, JobStore, OrchestrationService, OrchestratorConfig,
    QueueError, RetrySweeper, ServiceResult, SweeperHandle, WorkQueue,
};
#[cfg(feature = "redis")]
use jobmesh_infra::{PostgresJobStore, QueueConfig, RedisStreamsWorkQueue};
use jobmesh_worker::{ServiceReporter, SimulatedWorkload, Worker, WorkerConfig, WorkerHandle, WorkerStats};

use crate::app::errors;
use crate::config::ApiConfig;

pub type DynJobStore = Arc<dyn JobStore>;
pub type DynWorkQueue = Arc<dyn WorkQueue>;
pub type Orchestrator = OrchestrationService<DynJobStore, DynWorkQueue>;

/// Where embedded workers get their queue handle from.
enum WorkerQueues {
    /// Share the orchestrator's queue (in-memory mode).
    Shared,
    /// One Redis Streams consumer per worker.
    #[cfg(feature = "redis")]
    RedisStreams(QueueConfig),
}

pub struct AppServices {
    orchestrator: Arc<Orchestrator>,
    worker_queues: WorkerQueues,
    backend: &'static str,
}

impl AppServices {
    /// In-memory store and queue (dev/test).
    pub fn in_memory(config: OrchestratorConfig, visibility_timeout: Duration) -> Self {
        let store: DynJobStore = Arc::new(InMemoryJobStore::new());
        let queue: DynWorkQueue = Arc::new(InMemoryWorkQueue::new(visibility_timeout));
        Self {
            orchestrator: Arc::new(OrchestrationService::new(store, queue, config)),
            worker_queues: WorkerQueues::Shared,
            backend: "in-memory",
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Run a service call on the blocking pool.
    ///
    /// Store adapters may block on IO (the Postgres store drives its async
    /// pool with `block_on`), so handlers never call the service inline.
    pub async fn run<T, F>(&self, f: F) -> Result<T, Response>
    where
        F: FnOnce(&Orchestrator) -> ServiceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let orchestrator = self.orchestrator.clone();
        match tokio::task::spawn_blocking(move || f(&orchestrator)).await {
            Ok(result) => result.map_err(errors::service_error_to_response),
            Err(e) => Err(errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("service call aborted: {e}"),
            )),
        }
    }

    fn worker_queue(&self, _worker_id: &str) -> Result<DynWorkQueue, QueueError> {
        match &self.worker_queues {
            WorkerQueues::Shared => Ok(self.orchestrator.queue().clone()),
            #[cfg(feature = "redis")]
            WorkerQueues::RedisStreams(cfg) => {
                Ok(Arc::new(RedisStreamsWorkQueue::new(cfg, _worker_id)?))
            }
        }
    }
}

/// Build services from config: Postgres + Redis Streams when `DATABASE_URL`
/// is set and the `redis` feature is enabled, in-memory otherwise.
pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    if let Some(database_url) = &config.database_url {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config, database_url).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = database_url;
            tracing::warn!("DATABASE_URL set but redis feature not enabled, falling back to in-memory");
        }
    }

    info!("using in-memory job store and work queue");
    Ok(AppServices::in_memory(
        config.orchestrator.clone(),
        config.queue.visibility_timeout,
    ))
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &ApiConfig,
    database_url: &str,
) -> anyhow::Result<AppServices> {
    use anyhow::Context;

    let store = PostgresJobStore::connect(database_url, config.database_max_connections)
        .await
        .context("failed to connect to postgres")?;

    // The constructor talks to Redis synchronously.
    let queue_config = config.queue.clone();
    let consumer = format!("api-{}", std::process::id());
    let queue = tokio::task::spawn_blocking(move || RedisStreamsWorkQueue::new(&queue_config, consumer))
        .await
        .context("redis setup task aborted")?
        .context("failed to connect to redis")?;

    info!("using postgres job store and redis streams work queue");
    let store: DynJobStore = Arc::new(store);
    let queue: DynWorkQueue = Arc::new(queue);
    Ok(AppServices {
        orchestrator: Arc::new(OrchestrationService::new(
            store,
            queue,
            config.orchestrator.clone(),
        )),
        worker_queues: WorkerQueues::RedisStreams(config.queue.clone()),
        backend: "postgres+redis",
    })
}

/// Background threads owned by the API process.
pub struct BackgroundTasks {
    sweeper: SweeperHandle,
    workers: Vec<WorkerHandle>,
}

impl BackgroundTasks {
    /// Start the retry sweeper and `embedded_workers` in-process workers.
    ///
    /// Blocking (Redis setup for each worker); call from a blocking context.
    pub fn start(services: &AppServices, embedded_workers: usize) -> anyhow::Result<Self> {
        let sweeper = RetrySweeper::new(services.orchestrator.clone()).spawn()?;

        let mut workers = Vec::with_capacity(embedded_workers);
        for i in 0..embedded_workers {
            let config = WorkerConfig::default()
                .with_worker_id(format!("embedded-{}-{i}", std::process::id()))
                .with_wait_time(Duration::from_secs(1))
                .with_poll_interval(Duration::from_secs(1));
            let queue = services.worker_queue(&config.worker_id)?;
            let reporter = ServiceReporter::new(services.orchestrator.clone());
            workers.push(Worker::new(queue, reporter, SimulatedWorkload::new(), config).spawn()?);
        }
        if embedded_workers > 0 {
            info!(count = embedded_workers, "embedded workers started");
        }

        Ok(Self { sweeper, workers })
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(WorkerHandle::stats).collect()
    }

    /// Stop everything, letting in-flight tasks finish. Blocks.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.request_stop();
        }
        let completed: u64 = self.workers.into_iter().map(|w| w.shutdown().completed).sum();
        let sweeper = self.sweeper.shutdown();
        info!(
            tasks_completed = completed,
            sweeps = sweeper.sweeps,
            tasks_requeued = sweeper.tasks_requeued,
            "background tasks stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmesh_core::JobStatus;
    use serde_json::json;

    #[test]
    fn embedded_workers_complete_jobs_in_memory() {
        let services = AppServices::in_memory(OrchestratorConfig::default(), Duration::from_secs(30));
        let job = services
            .orchestrator()
            .create_job("compute", 3, json!({"work_type": "io_bound", "work_duration_seconds": 0}))
            .unwrap();

        let background = BackgroundTasks::start(&services, 2).unwrap();
        let completed = || -> u64 { background.worker_stats().iter().map(|s| s.completed).sum() };
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while completed() < 3 {
            assert!(std::time::Instant::now() < deadline, "workers never finished");
            std::thread::sleep(Duration::from_millis(10));
        }

        let job = services.orchestrator().get_job(job.id).unwrap();
        background.shutdown();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_tasks, 3);
    }

    #[tokio::test]
    async fn run_maps_service_errors_to_responses() {
        let services = AppServices::in_memory(OrchestratorConfig::default(), Duration::from_secs(30));
        let err = services
            .run(|o| o.create_job("", 1, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
