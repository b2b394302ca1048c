//! Reference CPU engine for `prim-rs`.
//!
//! Provides the `"cpu"` engine: candidate lists for every operator kind, host memory and a
//! synchronous stream. Linking this crate registers the engine with the global engine registry.

mod impl_list;
mod kernels;

use std::sync::Arc;

use once_cell::sync::Lazy;
use prim_rs::engine::{Engine, EngineKind, EngineRef};
use prim_rs::error::PrimResult;
use prim_rs::primitive::ImplementationRegistry;
use prim_rs::stream::{Stream, SyncStream};

/// Shared by all CPU engine instances so that equal descriptors map to one cache entry.
static CPU_REGISTRY: Lazy<ImplementationRegistry> = Lazy::new(impl_list::build_registry);

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEngine {
    index: usize,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: usize) -> Self {
        Self { index }
    }

    /// Shared handle, as returned by the engine registry.
    pub fn shared() -> EngineRef {
        Arc::new(Self::new())
    }
}

impl Engine for CpuEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cpu
    }

    fn name(&self) -> &str {
        "cpu"
    }

    fn index(&self) -> usize {
        self.index
    }

    fn implementation_registry(&self) -> &ImplementationRegistry {
        &CPU_REGISTRY
    }

    fn create_stream(&self) -> PrimResult<Box<dyn Stream>> {
        Ok(Box::new(SyncStream::new()))
    }
}

/// Register the CPU engine with the global engine registry.
///
/// Runs automatically the first time the registry is consulted, but can also be called
/// manually, e.g. after a test replaced the constructor.
pub fn register_cpu_engine() {
    prim_rs::engine::register_engine("cpu", CpuEngine::shared);
}

#[linkme::distributed_slice(prim_rs::engine::ENGINE_REGISTRARS)]
static REGISTER_CPU_ENGINE: fn() = register_cpu_engine;
