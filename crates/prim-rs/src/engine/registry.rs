//! Runtime engine registry for selecting engines by name.
//!
//! Backend crates register constructors either explicitly through [`register_engine`] or at
//! link time by adding a registrar to [`ENGINE_REGISTRARS`]; the registrars run once, the first
//! time the registry is consulted.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::EngineRef;

/// Factory that creates a new engine instance.
pub type EngineConstructor = Arc<dyn Fn() -> EngineRef + Send + Sync>;

#[linkme::distributed_slice]
pub static ENGINE_REGISTRARS: [fn()] = [..];

struct EngineRegistry {
    engines: RwLock<HashMap<String, EngineConstructor>>,
}

impl EngineRegistry {
    fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: EngineConstructor) {
        let mut engines = self
            .engines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if engines.insert(name.clone(), constructor).is_some() {
            log::debug!("engine '{name}' re-registered; replacing constructor");
        } else {
            log::info!("registered engine '{name}'");
        }
    }

    fn constructor(&self, name: &str) -> Option<EngineConstructor> {
        let engines = self
            .engines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        engines.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        let engines = self
            .engines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = engines.keys().cloned().collect();
        names.sort();
        names
    }
}

static GLOBAL_REGISTRY: OnceLock<EngineRegistry> = OnceLock::new();
static REGISTRARS_RUN: OnceLock<()> = OnceLock::new();

fn global_registry() -> &'static EngineRegistry {
    let registry = GLOBAL_REGISTRY.get_or_init(EngineRegistry::new);
    REGISTRARS_RUN.get_or_init(|| {
        for registrar in ENGINE_REGISTRARS {
            registrar();
        }
    });
    registry
}

/// Registers `constructor` under `name`, replacing any earlier registration.
///
/// # Example
/// ```ignore
/// prim_rs::engine::register_engine("cpu", || Arc::new(CpuEngine::new()) as EngineRef);
/// ```
pub fn register_engine<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> EngineRef + Send + Sync + 'static,
{
    let registry = GLOBAL_REGISTRY.get_or_init(EngineRegistry::new);
    registry.register(name.into(), Arc::new(constructor));
}

/// Creates a fresh engine instance. Returns `None` when `name` is not registered.
pub fn create_engine(name: &str) -> Option<EngineRef> {
    let constructor = global_registry().constructor(name)?;
    let engine = constructor();
    log::debug!("created engine '{name}' ({} #{})", engine.kind(), engine.index());
    Some(engine)
}

/// Registered engine names, sorted.
pub fn list_engines() -> Vec<String> {
    global_registry().names()
}

pub fn has_engine(name: &str) -> bool {
    global_registry().constructor(name).is_some()
}

pub fn engine_count() -> usize {
    global_registry().names().len()
}
