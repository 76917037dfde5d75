//! `jobmesh-worker`: the receive → execute → report → acknowledge cycle.
//!
//! A worker pulls task messages from a [`WorkQueue`](jobmesh_infra::WorkQueue),
//! runs a [`WorkFunction`] on each and reports the outcome through a
//! [`TaskReporter`]. Delivery is at-least-once; every report is idempotent on
//! the receiving side, so redelivered messages are harmless.

pub mod config;
pub mod reporter;
pub mod work;
pub mod worker;

pub use config::WorkerConfig;
pub use reporter::{HttpReporter, ReportError, ServiceReporter, TaskReporter};
pub use work::{SimulatedWorkload, WorkError, WorkFunction};
pub use worker::{Disposition, MessageError, Worker, WorkerHandle, WorkerStats};
