//! Shared engine bootstrap: the module registry, resolver, and addon set
//! every process wiring an `Engine` needs (`spec.md` §9 "global module
//! registry", constructed once at process start).

use std::collections::BTreeMap;
use std::sync::Arc;

use workflow_core::addon::Addon;
use workflow_core::module::{ModuleCapability, ModuleRegistry};
use workflow_core::resolver::TemplateResolver;
use workflow_core::storage::Storage;
use workflow_engine::resolver::SchemaResolver;
use workflow_engine::{Engine, ValidateModule, VALIDATE_MODULE_ID};

pub fn build_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(VALIDATE_MODULE_ID, || ModuleCapability::Executable(Box::new(ValidateModule)));
    registry
}

pub fn build_engine<S: Storage>(storage: Arc<S>) -> Engine<S> {
    let registry = Arc::new(build_registry());
    let resolver: Arc<dyn TemplateResolver> = Arc::new(SchemaResolver);
    let addons: Arc<BTreeMap<String, Box<dyn Addon>>> = Arc::new(BTreeMap::new());
    Engine::new(storage, registry, resolver, addons)
}
