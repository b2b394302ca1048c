use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, OpDesc, OpKind, SumDesc};
use prim_rs::error::{PrimResult, PrimitiveError};
use prim_rs::primitive::{
    CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc, ScratchpadKey,
};

use super::{desc_mismatch, init_plain, other_kind, read_logical, tag_of, write_logical, F32Scratch};

const OP: &str = "sum";

pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:any", init_ref, create_ref);

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_sum().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::NONE),
        OP,
        "sum takes no attributes"
    );
    let accumulator = desc
        .dst
        .nelems(false)
        .checked_mul(4)
        .ok_or_else(|| PrimitiveError::out_of_memory("sum accumulator", usize::MAX))?;

    if let OpDesc::Sum(desc) = init.desc_mut() {
        // An `any` dst takes source 0's layout in its own element type.
        if desc.dst.is_any() {
            if tag_of(&desc.srcs[0]).is_some() {
                desc.dst = desc.srcs[0].with_data_type(desc.dst.data_type());
            } else {
                init_plain(&mut desc.dst)?;
            }
        }
    }
    init.book_scratchpad(ScratchpadKey::Accumulator, accumulator)
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = pd
        .op_desc()
        .as_sum()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Sum))?;
    Ok(Box::new(SumKernel { desc }))
}

struct SumKernel {
    desc: SumDesc,
}

impl Kernel for SumKernel {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let mut sources = Vec::with_capacity(desc.srcs.len());
        for (index, src) in desc.srcs.iter().enumerate() {
            sources.push(read_logical(ctx.memory(Arg::MultipleSrc(index as u16))?, src));
        }
        let dst_memory = ctx.memory(Arg::Dst)?;

        let mut acc = F32Scratch::new(ctx.scratchpad(ScratchpadKey::Accumulator)?);
        acc.fill(0.0);
        for (values, scale) in sources.iter().zip(&desc.scales) {
            let scale = scale.get();
            for (flat, value) in values.iter().enumerate() {
                acc.set(flat, acc.get(flat) + scale * value);
            }
        }
        write_logical(dst_memory, &desc.dst, &acc.to_vec());
        Ok(())
    }
}
