//! The execution engine, branch lineage, version store / execution-group
//! expansion, `$ref` resolution, and the pure-function template resolver
//! (`spec.md` §§4.1–4.4). Generic over `workflow_core::Storage` so the same
//! code path drives both `workflow-storage::PgStorage` and
//! `workflow-sandbox::MemoryStorage`.

pub mod builtin;
pub mod engine;
pub mod lineage;
pub mod refs;
pub mod resolver;
pub mod version_store;

pub use builtin::{ValidateModule, VALIDATE_MODULE_ID};
pub use engine::{Engine, EngineOutcome, ExecutionTarget, Progress, RunLocks};
