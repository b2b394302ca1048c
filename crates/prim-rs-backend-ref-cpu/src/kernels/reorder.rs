use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, OpKind, ReorderDesc};
use prim_rs::error::PrimResult;
use prim_rs::primitive::{CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc};

use super::{desc_mismatch, other_kind, read_logical, write_logical, Epilogue};

const OP: &str = "reorder";

/// Byte copy between identically laid out dense tensors.
pub(crate) const DIRECT_COPY: CandidateImpl =
    CandidateImpl::new("direct_copy", init_direct_copy, create_direct_copy);

/// Element-wise conversion between any layouts and element types, with output scales and zero
/// points.
pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:any", init_ref, create_ref);

fn init_direct_copy(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_reorder().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::NONE),
        OP,
        "direct_copy takes no attributes"
    );
    prim_rs::ensure_supported!(
        desc.src.data_type() == desc.dst.data_type(),
        OP,
        "direct_copy cannot convert {} to {}",
        desc.src.data_type(),
        desc.dst.data_type()
    );
    prim_rs::ensure_supported!(
        desc.src.similar_to(&desc.dst) && desc.src.is_dense() && desc.dst.is_dense(),
        OP,
        "direct_copy needs matching dense layouts"
    );
    Ok(())
}

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_reorder().ok_or_else(|| other_kind(OP))?;
    let attr = init.attr();
    prim_rs::ensure_supported!(
        attr.has_default_values(AttrSkip::OUTPUT_SCALES | AttrSkip::ZERO_POINTS),
        OP,
        "only output scales and zero points are supported"
    );
    Epilogue::check(OP, attr, &desc.dst)
}

fn reorder_desc(pd: &PrimitiveDesc) -> PrimResult<ReorderDesc> {
    pd.op_desc()
        .as_reorder()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Reorder))
}

fn create_direct_copy(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    Ok(Box::new(DirectCopy {
        bytes: reorder_desc(pd)?.dst.size(),
    }))
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = reorder_desc(pd)?;
    let attr = pd.attr();
    Ok(Box::new(RefReorder {
        epilogue: Epilogue::new(attr, &desc.dst),
        src_zero_point: attr.zero_point(Arg::Src) as f32,
        dst_zero_point: attr.zero_point(Arg::Dst) as f32,
        desc,
    }))
}

struct DirectCopy {
    bytes: usize,
}

impl Kernel for DirectCopy {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let src = ctx.memory(Arg::Src)?;
        let dst = ctx.memory(Arg::Dst)?;
        if src.shares_buffer(dst) {
            return Ok(());
        }
        let from = src.read_bytes();
        let mut to = dst.write_bytes();
        let bytes = self.bytes.min(from.len()).min(to.len());
        to[..bytes].copy_from_slice(&from[..bytes]);
        Ok(())
    }
}

struct RefReorder {
    desc: ReorderDesc,
    epilogue: Epilogue,
    src_zero_point: f32,
    dst_zero_point: f32,
}

impl Kernel for RefReorder {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let mut values = read_logical(ctx.memory(Arg::Src)?, &desc.src);
        if self.src_zero_point != 0.0 {
            values.iter_mut().for_each(|value| *value -= self.src_zero_point);
        }
        self.epilogue.apply(&mut values, None, &[]);
        if self.dst_zero_point != 0.0 {
            values.iter_mut().for_each(|value| *value += self.dst_zero_point);
        }
        write_logical(ctx.memory(Arg::Dst)?, &desc.dst, &values);
        Ok(())
    }
}
