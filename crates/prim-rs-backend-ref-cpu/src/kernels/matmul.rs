use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, DataType, MatmulDesc, OpDesc, OpKind};
use prim_rs::error::PrimResult;
use prim_rs::primitive::{CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc};
use rayon::prelude::*;

use super::{
    accepts_types, broadcast_index, desc_mismatch, init_plain, is_row_major, other_kind,
    read_logical, write_logical, Epilogue, WEIGHTED_TYPES,
};

const OP: &str = "matmul";

/// Row-parallel f32 GEMM over dense row-major operands.
pub(crate) const GEMM_F32: CandidateImpl =
    CandidateImpl::new("gemm:f32", init_gemm_f32, create_gemm_f32);

/// f32, bf16 and int8 operands in any layout, with zero points; single-threaded.
pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:any", init_ref, create_ref);

fn finalize_layouts(init: &mut PdInit<'_>) -> PrimResult<()> {
    if let OpDesc::Matmul(desc) = init.desc_mut() {
        init_plain(&mut desc.src)?;
        init_plain(&mut desc.weights)?;
        init_plain(&mut desc.dst)?;
        if desc.with_bias() {
            init_plain(&mut desc.bias)?;
        }
    }
    Ok(())
}

fn init_gemm_f32(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_matmul().ok_or_else(|| other_kind(OP))?;
    let all_f32 = [&desc.src, &desc.weights, &desc.dst]
        .into_iter()
        .chain(desc.with_bias().then_some(&desc.bias))
        .all(|md| md.data_type() == DataType::F32);
    prim_rs::ensure_supported!(all_f32, OP, "gemm:f32 needs f32 operands");
    prim_rs::ensure_supported!(
        init.attr()
            .has_default_values(AttrSkip::POST_OPS | AttrSkip::OUTPUT_SCALES),
        OP,
        "zero points are not supported"
    );
    Epilogue::check(OP, init.attr(), &desc.dst)?;
    finalize_layouts(init)?;
    let desc = init.desc().as_matmul().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        is_row_major(&desc.src) && is_row_major(&desc.weights) && is_row_major(&desc.dst),
        OP,
        "gemm:f32 needs row-major layouts"
    );
    Ok(())
}

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_matmul().ok_or_else(|| other_kind(OP))?;
    let (src, weights, dst) = (
        desc.src.data_type(),
        desc.weights.data_type(),
        desc.dst.data_type(),
    );
    let bias = desc.with_bias().then(|| desc.bias.data_type());
    prim_rs::ensure_supported!(
        accepts_types(WEIGHTED_TYPES, src, weights, dst, bias),
        OP,
        "unsupported data types {src}x{weights}->{dst}"
    );
    Epilogue::check(OP, init.attr(), &desc.dst)?;
    finalize_layouts(init)
}

fn create_gemm_f32(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    create(pd, true)
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    create(pd, false)
}

fn create(pd: &Arc<PrimitiveDesc>, parallel: bool) -> PrimResult<Box<dyn Kernel>> {
    let desc = pd
        .op_desc()
        .as_matmul()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Matmul))?;
    let attr = pd.attr();
    Ok(Box::new(MatmulKernel {
        epilogue: Epilogue::new(attr, &desc.dst),
        src_zero_point: attr.zero_point(Arg::Src) as f32,
        weights_zero_point: attr.zero_point(Arg::Weights) as f32,
        dst_zero_point: attr.zero_point(Arg::Dst) as f32,
        parallel,
        desc,
    }))
}

struct MatmulKernel {
    desc: MatmulDesc,
    epilogue: Epilogue,
    src_zero_point: f32,
    weights_zero_point: f32,
    dst_zero_point: f32,
    parallel: bool,
}

impl MatmulKernel {
    fn row(&self, src: &[f32], weights: &[f32], row: usize, out: &mut [f32]) {
        let desc = &self.desc;
        let (m, n, k) = (desc.m(), desc.n(), desc.k());
        let batch = row / m;
        let i = row % m;
        let ndims = desc.ndims();
        let src_batch = if ndims == 3 && desc.src.dims()[0] != 1 { batch } else { 0 };
        let wei_batch = if ndims == 3 && desc.weights.dims()[0] != 1 { batch } else { 0 };
        let src_row = &src[(src_batch * m + i) * k..(src_batch * m + i + 1) * k];
        let wei = &weights[wei_batch * k * n..(wei_batch + 1) * k * n];
        out.fill(0.0);
        for (p, &a) in src_row.iter().enumerate() {
            let a = a - self.src_zero_point;
            if a == 0.0 {
                continue;
            }
            for (o, &b) in out.iter_mut().zip(&wei[p * n..(p + 1) * n]) {
                *o += a * (b - self.weights_zero_point);
            }
        }
    }
}

impl Kernel for MatmulKernel {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.src);
        let weights = read_logical(ctx.memory(Arg::Weights)?, &desc.weights);
        let bias = match ctx.optional_memory(Arg::Bias) {
            Some(memory) if desc.with_bias() => Some(read_logical(memory, &desc.bias)),
            _ => None,
        };
        let dst_memory = ctx.memory(Arg::Dst)?;
        let prior = self
            .epilogue
            .needs_prior_dst()
            .then(|| read_logical(dst_memory, &desc.dst));
        let binary = self.epilogue.binary_operands(ctx)?;

        let n = desc.n();
        let mut acc = vec![0f32; desc.batch() * desc.m() * n];
        if n > 0 {
            if self.parallel {
                acc.par_chunks_mut(n)
                    .enumerate()
                    .for_each(|(row, out)| self.row(&src, &weights, row, out));
            } else {
                for (row, out) in acc.chunks_mut(n).enumerate() {
                    self.row(&src, &weights, row, out);
                }
            }
        }
        if let Some(bias) = bias {
            let dims = desc.dst.dims();
            for (flat, value) in acc.iter_mut().enumerate() {
                *value += bias[broadcast_index(dims, desc.bias.dims(), flat)];
            }
        }
        self.epilogue.apply(&mut acc, prior.as_deref(), &binary);
        if self.dst_zero_point != 0.0 {
            acc.iter_mut().for_each(|value| *value += self.dst_zero_point);
        }
        write_logical(dst_memory, &desc.dst, &acc);
        Ok(())
    }
}
