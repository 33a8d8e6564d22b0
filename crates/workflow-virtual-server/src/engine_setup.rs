//! Builds an `Engine<MemoryStorage>` the same way `workflow-api` builds an
//! `Engine<PgStorage>` (`spec.md` §4.6: "wraps the same engine" against a
//! different storage namespace). Kept as its own small bootstrap rather
//! than sharing `workflow_api::engine_setup` so this process never depends
//! on `workflow-storage`/Postgres.

use std::collections::BTreeMap;
use std::sync::Arc;

use workflow_core::addon::Addon;
use workflow_core::module::{ModuleCapability, ModuleRegistry};
use workflow_core::resolver::TemplateResolver;
use workflow_engine::resolver::SchemaResolver;
use workflow_engine::{Engine, ValidateModule, VALIDATE_MODULE_ID};
use workflow_sandbox::MemoryStorage;

pub fn build_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(VALIDATE_MODULE_ID, || ModuleCapability::Executable(Box::new(ValidateModule)));
    registry
}

pub fn build_engine(storage: Arc<MemoryStorage>) -> Engine<MemoryStorage> {
    let registry = Arc::new(build_registry());
    let resolver: Arc<dyn TemplateResolver> = Arc::new(SchemaResolver);
    let addons: Arc<BTreeMap<String, Box<dyn Addon>>> = Arc::new(BTreeMap::new());
    Engine::new(storage, registry, resolver, addons)
}
