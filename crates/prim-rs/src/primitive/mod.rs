//! Resolved, executable primitives.

pub mod args;
pub mod candidates;
pub mod kernel;
pub mod pd;
pub mod scratchpad;

use std::fmt;
use std::sync::{Arc, Weak};

pub use args::{ArgSlot, ExecArgs, ExecContext};
pub use candidates::{CandidateImpl, CreateFn, ImplementationRegistry, InitFn};
pub use kernel::Kernel;
pub use pd::{PdInit, PrimitiveDesc};
pub use scratchpad::{ScratchpadGrantor, ScratchpadKey, ScratchpadRegistry};

use crate::engine::{Engine, EngineRef};
use crate::error::PrimResult;
use crate::stream::Stream;

/// Opaque executable handle: a resolved descriptor plus its kernel.
///
/// Handles are immutable after construction and may be executed from many threads at once.
/// They hold their engine weakly; once the engine is dropped the handle is no longer valid and
/// the primitive cache discards it on the next lookup.
pub struct Primitive {
    pd: Arc<PrimitiveDesc>,
    kernel: Box<dyn Kernel>,
    engine: Weak<dyn Engine>,
}

impl Primitive {
    pub(crate) fn new(pd: Arc<PrimitiveDesc>, kernel: Box<dyn Kernel>, engine: &EngineRef) -> Self {
        Self {
            pd,
            kernel,
            engine: Arc::downgrade(engine),
        }
    }

    pub fn pd(&self) -> &Arc<PrimitiveDesc> {
        &self.pd
    }

    pub fn impl_name(&self) -> &'static str {
        self.pd.impl_name()
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn engine(&self) -> Option<EngineRef> {
        self.engine.upgrade()
    }

    /// `false` once the owning engine has been dropped.
    pub fn is_valid(&self) -> bool {
        self.engine.strong_count() > 0
    }

    pub fn execute(&self, stream: &dyn Stream, args: &ExecArgs) -> PrimResult<()> {
        crate::exec::execute(self, stream, args)
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Primitive")
            .field("pd", &self.pd)
            .field("valid", &self.is_valid())
            .finish()
    }
}
