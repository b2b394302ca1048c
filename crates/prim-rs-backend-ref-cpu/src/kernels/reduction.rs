use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, OpDesc, OpKind, ReductionAlg, ReductionDesc};
use prim_rs::error::{PrimResult, PrimitiveError};
use prim_rs::primitive::{
    CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc, ScratchpadKey,
};

use super::{
    broadcast_index, desc_mismatch, init_like, other_kind, read_logical, write_logical, Epilogue,
    F32Scratch,
};

const OP: &str = "reduction";

pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:any", init_ref, create_ref);

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_reduction().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::POST_OPS),
        OP,
        "only post-ops are supported"
    );
    Epilogue::check(OP, init.attr(), &desc.dst)?;
    let accumulator = desc
        .dst
        .nelems(false)
        .checked_mul(4)
        .ok_or_else(|| PrimitiveError::out_of_memory("reduction accumulator", usize::MAX))?;

    if let OpDesc::Reduction(desc) = init.desc_mut() {
        let like = desc.src.clone();
        init_like(&mut desc.dst, &like)?;
    }
    init.book_scratchpad(ScratchpadKey::Accumulator, accumulator)
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = pd
        .op_desc()
        .as_reduction()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Reduction))?;
    Ok(Box::new(ReductionKernel {
        epilogue: Epilogue::new(pd.attr(), &desc.dst),
        desc,
    }))
}

fn identity(alg: ReductionAlg) -> f32 {
    match alg {
        ReductionAlg::Max => f32::NEG_INFINITY,
        ReductionAlg::Min => f32::INFINITY,
        ReductionAlg::Sum | ReductionAlg::Mean => 0.0,
        ReductionAlg::Mul => 1.0,
    }
}

fn combine(alg: ReductionAlg, acc: f32, value: f32) -> f32 {
    match alg {
        ReductionAlg::Max => acc.max(value),
        ReductionAlg::Min => acc.min(value),
        ReductionAlg::Sum | ReductionAlg::Mean => acc + value,
        ReductionAlg::Mul => acc * value,
    }
}

struct ReductionKernel {
    desc: ReductionDesc,
    epilogue: Epilogue,
}

impl Kernel for ReductionKernel {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let alg = desc.alg;
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.src);
        let dst_memory = ctx.memory(Arg::Dst)?;
        let prior = self
            .epilogue
            .needs_prior_dst()
            .then(|| read_logical(dst_memory, &desc.dst));
        let binary = self.epilogue.binary_operands(ctx)?;

        let mut acc = F32Scratch::new(ctx.scratchpad(ScratchpadKey::Accumulator)?);
        acc.fill(identity(alg));
        // Each source element folds into the destination element it broadcasts from.
        for (flat, &value) in src.iter().enumerate() {
            let out = broadcast_index(desc.src.dims(), desc.dst.dims(), flat);
            acc.set(out, combine(alg, acc.get(out), value));
        }
        let mut values = acc.to_vec();
        if alg == ReductionAlg::Mean {
            let ratio = (desc.src.nelems(false) / desc.dst.nelems(false).max(1)).max(1) as f32;
            values.iter_mut().for_each(|value| *value /= ratio);
        }

        self.epilogue.apply(&mut values, prior.as_deref(), &binary);
        write_logical(dst_memory, &desc.dst, &values);
        Ok(())
    }
}
