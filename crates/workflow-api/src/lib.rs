//! The HTTP surface for the workflow engine (`spec.md` §6): upload,
//! `StartWorkflowByVersion`, `Respond`, `Retry`, `SubAction`, `GetState`,
//! `GetInteractionHistory` over axum, backed by `workflow-storage::PgStorage`.

pub mod engine_setup;
pub mod error;
pub mod state;
pub mod workflows;

pub use state::AppState;
