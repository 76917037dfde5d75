//! Infrastructure layer: configuration, durable store, work queue, and the
//! orchestration service that ties them together.

pub mod config;
pub mod queue;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod sweeper;


pub use config::{ConfigError, OrchestratorConfig, QueueConfig};
pub use queue::{Delivery, InMemoryWorkQueue, QueueError, ReceiptHandle, WorkQueue};
#[cfg(feature = "redis")]
pub use queue::RedisStreamsWorkQueue;
pub use reconciler::StatusReconciler;
pub use service::{JobPage, ListJobsQuery, MAX_PAGE_SIZE, OrchestrationService, ServiceError, ServiceResult};
pub use store::{InMemoryJobStore, JobFilter, JobStore, PostgresJobStore, StoreError};
pub use sweeper::{RetrySweeper, SweeperHandle, SweeperStats};
