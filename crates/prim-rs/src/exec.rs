//! Execution dispatch.

use crate::error::{PrimResult, PrimitiveError};
use crate::primitive::{ExecArgs, Primitive, PrimitiveDesc};
use crate::profiling;
use crate::stream::Stream;

/// Checks that every input and output slot the resolved descriptor requires is bound to memory
/// large enough for it.
pub fn validate_args(pd: &PrimitiveDesc, args: &ExecArgs) -> PrimResult<()> {
    for (arg, slot) in pd.required_args() {
        let memory = args.get(arg).ok_or_else(|| {
            PrimitiveError::invalid_arguments(format!(
                "{} ({}) requires {arg:?} ({:?})",
                pd.kind(),
                pd.impl_name(),
                slot.usage
            ))
        })?;
        let required = slot.desc.size();
        let provided = memory.len_bytes();
        if provided < required {
            return Err(PrimitiveError::invalid_arguments(format!(
                "{arg:?} holds {provided} bytes, {} needs {required}",
                slot.desc
            )));
        }
    }
    Ok(())
}

/// Runs `primitive` on `stream`. The handle itself is never mutated.
pub fn execute(primitive: &Primitive, stream: &dyn Stream, args: &ExecArgs) -> PrimResult<()> {
    let pd = primitive.pd();
    validate_args(pd, args)?;
    if !primitive.is_valid() {
        return Err(PrimitiveError::execution(format!(
            "engine of {} ({}) was destroyed",
            pd.kind(),
            pd.impl_name()
        )));
    }
    let _scope = profiling::execute_scope(pd.kind().as_str(), pd.impl_name());
    if crate::env::verbose_enabled() {
        log::info!("exec {pd}");
    } else {
        log::trace!("exec {} ({})", pd.kind(), pd.impl_name());
    }
    stream.enqueue(primitive, args)
}
