//! Postgres-backed implementation of `workflow_core::storage::Storage`
//! (`spec.md` §3, §4.1-§4.5 persistence requirements).

pub mod pg;
pub mod rows;

pub use pg::PgStorage;
