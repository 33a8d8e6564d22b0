//! Task queue and worker pool (`spec.md` §4.5).
//!
//! The queue facade operations (`enqueue`, `claimTask`, `recoverStaleTasks`,
//! ...) live directly on `workflow_core::storage::Storage` — the same atomic
//! `claim_task` seam `workflow-storage::PgStorage` implements with a single
//! conditional `UPDATE`. This crate adds the process-side pieces on top of
//! that seam: the `Actor` contract and the cooperative `WorkerPool` poll
//! loop, grounded in the teacher's `durable::worker::pool` module.

pub mod pool;
pub mod progress;

pub use pool::{Actor, GroupConfig, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use progress::ProgressStream;
