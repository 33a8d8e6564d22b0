//! The virtual execution sandbox (`spec.md` §4.6): an in-memory `Storage`
//! implementation plus the namespace blob codec, so `workflow_engine::Engine`
//! runs unmodified against a throwaway per-call state instead of
//! `workflow-storage::PgStorage`.

pub mod blob;
pub mod memory;

pub use blob::{export_namespace, import_namespace, BlobError};
pub use memory::MemoryStorage;
