//! `jobmesh-core`: job/task model and the pure parts of the distribution protocol.
//!
//! This crate contains **no IO**: identifiers, the job and task state machines,
//! the reconciliation rule that derives job status from task statuses, and the
//! wire shapes exchanged between the orchestrator, the queue and workers.

pub mod error;
pub mod id;
pub mod job;
pub mod message;
pub mod reconcile;
pub mod status;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TaskId};
pub use job::Job;
pub use message::{CompletionReport, FailureReport, TaskMessage};
pub use reconcile::{CompletionPolicy, TaskCounts, reconcile};
pub use status::{JobStatus, TaskStatus};
pub use task::{CompleteOutcome, FailOutcome, Task};
