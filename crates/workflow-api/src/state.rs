use std::sync::Arc;

use workflow_engine::Engine;
use workflow_storage::PgStorage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<PgStorage>,
    pub engine: Engine<PgStorage>,
}
