use anyhow::Context;
use jobmesh_infra::{QueueConfig, RedisStreamsWorkQueue};
use jobmesh_worker::{HttpReporter, SimulatedWorkload, Worker, WorkerConfig};

fn main() -> anyhow::Result<()> {
    jobmesh_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let queue_config = QueueConfig::from_env().context("invalid queue configuration")?;

    let queue = RedisStreamsWorkQueue::new(&queue_config, config.worker_id.clone())
        .context("failed to connect to the work queue")?;
    let reporter = HttpReporter::new(&config).context("failed to build the http reporter")?;

    tracing::info!(
        worker_id = %config.worker_id,
        api_base_url = %config.api_base_url,
        "starting worker"
    );

    let handle = Worker::new(queue, reporter, SimulatedWorkload::new(), config)
        .spawn()
        .context("failed to spawn worker thread")?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutdown requested, finishing in-flight task");
    let stats = handle.shutdown();
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        malformed = stats.malformed,
        "worker exited"
    );
    Ok(())
}
