//! Engines: providers of candidate lists and streams.

pub mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::PrimResult;
use crate::primitive::ImplementationRegistry;
use crate::stream::Stream;

pub use registry::{
    create_engine, engine_count, has_engine, list_engines, register_engine, EngineConstructor,
    ENGINE_REGISTRARS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Cpu,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Cpu => f.write_str("cpu"),
        }
    }
}

/// A compute device as seen by resolution and execution.
///
/// The candidate lists returned by [`Engine::implementation_registry`] must stay fixed for the
/// engine's lifetime; cached primitives are keyed by the registry's identity.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Human-readable identifier, e.g. `"cpu"`.
    fn name(&self) -> &str;

    fn index(&self) -> usize {
        0
    }

    fn implementation_registry(&self) -> &ImplementationRegistry;

    fn create_stream(&self) -> PrimResult<Box<dyn Stream>>;
}

/// Shared engine handle. Primitives keep only a weak reference to it.
pub type EngineRef = Arc<dyn Engine>;
