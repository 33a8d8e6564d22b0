//! Shared types and contracts for the workflow orchestration engine:
//! the tagged value type, time-sortable ids, canonical content hashing,
//! the domain model, the `Storage` seam, the module/resolver/addon
//! contracts, the error taxonomy, and log redaction.

pub mod addon;
pub mod error;
pub mod hash;
pub mod ids;
pub mod models;
pub mod module;
pub mod redact;
pub mod resolver;
pub mod storage;
pub mod value;

pub use error::{EngineError, EngineResult, QueueError, StorageError, StorageResult, ValidationError, ValidationIssue};
pub use storage::Storage;
pub use value::Value;
