use super::args::ExecContext;
use crate::error::PrimResult;

/// Executable half of a resolved primitive.
///
/// Kernels are shared across threads and executions; any per-call state must come from the
/// scratchpad granted through [`ExecContext`].
pub trait Kernel: Send + Sync {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()>;
}

/// Kernel of primitives whose operands have a zero extent.
pub(crate) struct NoopKernel;

impl Kernel for NoopKernel {
    fn execute(&self, _ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        Ok(())
    }
}
