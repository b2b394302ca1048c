//! Resolution engine: turns a descriptor into an executable primitive.
//!
//! Candidates are tried in registry order on fresh copies of the descriptor. `Unimplemented`
//! moves on to the next candidate; any other failure ends resolution immediately. Descriptors
//! with a zero extent short-circuit to a no-op primitive without consulting the registry.

use std::sync::Arc;

use crate::cache::{global_cache, CacheKey};
use crate::desc::{Format, OpDesc, PrimitiveAttr};
use crate::engine::EngineRef;
use crate::error::{PrimResult, PrimitiveError};
use crate::primitive::kernel::NoopKernel;
use crate::primitive::{CandidateImpl, PdInit, Primitive, PrimitiveDesc};
use crate::profiling;

/// Implementation name reported by primitives of zero-extent descriptors.
pub const ZERO_DIM_IMPL_NAME: &str = "zero_dim:noop";

fn log_resolved(pd: &PrimitiveDesc) {
    if crate::env::verbose_enabled() {
        log::info!("resolved {pd}");
    } else {
        log::debug!("resolved {} -> {}", pd.kind(), pd.impl_name());
    }
}

fn left_any_format(pd: &PrimitiveDesc) -> bool {
    pd.required_args()
        .any(|(_, slot)| matches!(slot.desc.format(), Format::Any))
}

fn try_candidate(
    candidate: &CandidateImpl,
    desc: &Arc<OpDesc>,
    attr: &Arc<PrimitiveAttr>,
    engine: &EngineRef,
    hint: Option<&Arc<PrimitiveDesc>>,
) -> PrimResult<Primitive> {
    let _scope = profiling::resolve_scope(desc.kind().as_str(), candidate.name());
    let mut init = PdInit::new(desc, attr, hint, engine.as_ref());
    candidate.init(&mut init)?;
    let pd = init.finish(candidate.name(), Arc::new(OpDesc::clone(desc)));
    if left_any_format(&pd) {
        return Err(PrimitiveError::unimplemented(
            desc.kind().as_str(),
            format!("{} left an operand with format any", candidate.name()),
        ));
    }
    let pd = Arc::new(pd);
    let kernel = candidate.create(&pd)?;
    Ok(Primitive::new(pd, kernel, engine))
}

/// Resolves `desc` without consulting the primitive cache.
pub fn resolve_uncached(
    desc: &Arc<OpDesc>,
    attr: &Arc<PrimitiveAttr>,
    engine: &EngineRef,
    hint: Option<&Arc<PrimitiveDesc>>,
) -> PrimResult<Arc<Primitive>> {
    desc.validate()?;
    let kind = desc.kind();

    if desc.has_zero_dim_memory() {
        log::debug!("{kind}: zero-extent operand, resolving to a no-op");
        let pd = PrimitiveDesc::zero_dim(
            ZERO_DIM_IMPL_NAME,
            Arc::new(OpDesc::clone(desc)),
            Arc::new(PrimitiveAttr::clone(attr)),
        );
        return Ok(Arc::new(Primitive::new(
            Arc::new(pd),
            Box::new(NoopKernel),
            engine,
        )));
    }

    let registry = engine.implementation_registry();
    let candidates = registry.candidates_for(desc);
    let mut last_reason = None;
    for candidate in candidates {
        match try_candidate(candidate, desc, attr, engine, hint) {
            Ok(primitive) => {
                log_resolved(primitive.pd());
                return Ok(Arc::new(primitive));
            }
            Err(err) if err.is_unimplemented() => {
                log::debug!("{kind}: candidate {} declined: {err}", candidate.name());
                last_reason = Some(err);
            }
            Err(err) => {
                log::debug!("{kind}: candidate {} failed: {err}", candidate.name());
                return Err(err);
            }
        }
    }

    let reason = match last_reason {
        Some(PrimitiveError::Unimplemented { reason, .. }) => {
            format!("no candidate of '{}' accepted the descriptor; last: {reason}", registry.name())
        }
        _ => format!("'{}' has no candidates", registry.name()),
    };
    Err(PrimitiveError::unimplemented(kind.as_str(), reason))
}

/// Resolves `desc` through the process-wide primitive cache.
///
/// The descriptor and attributes are copied into the cache key, so callers may drop or reuse
/// their values as soon as this returns.
pub fn resolve_primitive_descriptor(
    desc: &OpDesc,
    attr: &PrimitiveAttr,
    engine: &EngineRef,
    hint: Option<&Arc<PrimitiveDesc>>,
) -> PrimResult<Arc<Primitive>> {
    let desc = Arc::new(desc.clone());
    let attr = Arc::new(attr.clone());
    let key = CacheKey::new(Arc::clone(&desc), Arc::clone(&attr), engine, hint);
    global_cache().get_or_add(&key, || resolve_uncached(&desc, &attr, engine, hint))
}
