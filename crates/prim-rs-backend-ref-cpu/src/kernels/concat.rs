use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, ConcatDesc, OpDesc, OpKind};
use prim_rs::error::PrimResult;
use prim_rs::primitive::{CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc};

use super::{
    desc_mismatch, init_like, init_plain, is_row_major, other_kind, read_logical, write_logical,
};

const OP: &str = "concat";

/// Contiguous block copies between row-major tensors of one element type.
pub(crate) const SIMPLE: CandidateImpl = CandidateImpl::new("simple:plain", init_simple, create_simple);

pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:any", init_ref, create_ref);

fn check_attr(init: &PdInit<'_>) -> PrimResult<()> {
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::NONE),
        OP,
        "concat takes no attributes"
    );
    Ok(())
}

fn init_simple(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_concat().ok_or_else(|| other_kind(OP))?;
    check_attr(init)?;
    prim_rs::ensure_supported!(
        desc.srcs.iter().all(is_row_major),
        OP,
        "simple:plain needs row-major sources"
    );
    let data_type = desc.srcs[0].data_type();
    prim_rs::ensure_supported!(
        desc.dst.data_type() == data_type,
        OP,
        "simple:plain cannot convert {data_type} to {}",
        desc.dst.data_type()
    );
    if let OpDesc::Concat(desc) = init.desc_mut() {
        init_plain(&mut desc.dst)?;
    }
    let desc = init.desc().as_concat().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(is_row_major(&desc.dst), OP, "simple:plain needs a row-major dst");
    Ok(())
}

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    init.desc().as_concat().ok_or_else(|| other_kind(OP))?;
    check_attr(init)?;
    if let OpDesc::Concat(desc) = init.desc_mut() {
        let like = desc.srcs[0].clone();
        init_like(&mut desc.dst, &like)?;
    }
    Ok(())
}

fn concat_desc(pd: &PrimitiveDesc) -> PrimResult<ConcatDesc> {
    pd.op_desc()
        .as_concat()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Concat))
}

fn create_simple(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    Ok(Box::new(SimpleConcat {
        desc: concat_desc(pd)?,
    }))
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    Ok(Box::new(RefConcat {
        desc: concat_desc(pd)?,
    }))
}

/// Number of independent slabs along the concat axis and elements per slab below it.
fn slabs(desc: &ConcatDesc) -> (usize, usize) {
    let dims = desc.dst.dims();
    let outer = dims[..desc.concat_dim].iter().product();
    let inner = dims[desc.concat_dim + 1..].iter().product();
    (outer, inner)
}

struct SimpleConcat {
    desc: ConcatDesc,
}

impl Kernel for SimpleConcat {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let element = desc.dst.data_type().size_in_bytes();
        let (outer, inner) = slabs(desc);
        let dst_row = desc.dst.dims()[desc.concat_dim] * inner * element;

        // Sources are copied out first so a source aliasing dst is read before it is written.
        let mut sources = Vec::with_capacity(desc.srcs.len());
        for index in 0..desc.srcs.len() {
            let memory = ctx.memory(Arg::MultipleSrc(index as u16))?;
            sources.push(memory.read_bytes().clone());
        }

        let mut dst = ctx.memory(Arg::Dst)?.write_bytes();
        let mut column = 0;
        for (src, bytes) in desc.srcs.iter().zip(&sources) {
            let src_row = src.dims()[desc.concat_dim] * inner * element;
            for slab in 0..outer {
                let from = slab * src_row;
                let to = slab * dst_row + column;
                dst[to..to + src_row].copy_from_slice(&bytes[from..from + src_row]);
            }
            column += src_row;
        }
        Ok(())
    }
}

struct RefConcat {
    desc: ConcatDesc,
}

impl Kernel for RefConcat {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let (outer, inner) = slabs(desc);
        let dst_row = desc.dst.dims()[desc.concat_dim] * inner;
        let mut values = vec![0f32; outer * dst_row];
        let mut column = 0;
        for (index, src) in desc.srcs.iter().enumerate() {
            let logical = read_logical(ctx.memory(Arg::MultipleSrc(index as u16))?, src);
            let src_row = src.dims()[desc.concat_dim] * inner;
            for slab in 0..outer {
                values[slab * dst_row + column..slab * dst_row + column + src_row]
                    .copy_from_slice(&logical[slab * src_row..(slab + 1) * src_row]);
            }
            column += src_row;
        }
        write_logical(ctx.memory(Arg::Dst)?, &desc.dst, &values);
        Ok(())
    }
}
