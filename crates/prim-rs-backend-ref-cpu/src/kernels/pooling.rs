use std::sync::Arc;

use prim_rs::desc::{
    Arg, AttrSkip, DataType, FormatTag, MemoryDesc, OpDesc, OpKind, PoolingAlg, PoolingDesc,
    PropKind,
};
use prim_rs::error::PrimResult;
use prim_rs::primitive::{CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc};
use rayon::prelude::*;

use super::{
    desc_mismatch, init_like, init_plain, other_kind, read_logical, write_logical, Epilogue,
    Window,
};

const OP: &str = "pooling";

pub(crate) const REF_FWD: CandidateImpl = CandidateImpl::new("ref:fwd", init_forward, create_forward);

/// Backward pass. Max pooling replays the argmax workspace of the forward hint.
pub(crate) const REF_BWD: CandidateImpl = CandidateImpl::new("ref:bwd", init_backward, create_backward);

fn window(desc: &PoolingDesc) -> Window {
    Window::new(
        &desc.src.dims()[2..],
        &desc.dst.dims()[2..],
        &desc.kernel,
        &desc.strides,
        &desc.dilation,
        &desc.padding_l,
    )
}

/// Argmax indices of a training forward max pooling, one `s32` per destination element.
fn workspace_desc(desc: &PoolingDesc) -> PrimResult<MemoryDesc> {
    let dims = desc.dst.dims();
    MemoryDesc::new(dims, DataType::S32, FormatTag::plain_for_ndims(dims.len()))
}

fn same_geometry(lhs: &PoolingDesc, rhs: &PoolingDesc) -> bool {
    lhs.alg == rhs.alg
        && lhs.src.dims() == rhs.src.dims()
        && lhs.dst.dims() == rhs.dst.dims()
        && lhs.kernel == rhs.kernel
        && lhs.strides == rhs.strides
        && lhs.padding_l == rhs.padding_l
        && lhs.padding_r == rhs.padding_r
}

fn init_forward(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_pooling().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(desc.prop_kind.is_forward(), OP, "ref:fwd is forward only");
    prim_rs::ensure_supported!(
        desc.src.data_type().is_integer() == desc.dst.data_type().is_integer(),
        OP,
        "src {} and dst {} mix integer and float",
        desc.src.data_type(),
        desc.dst.data_type()
    );
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::POST_OPS),
        OP,
        "only post-ops are supported"
    );
    Epilogue::check(OP, init.attr(), &desc.dst)?;

    let mut workspace = None;
    if let OpDesc::Pooling(desc) = init.desc_mut() {
        init_plain(&mut desc.src)?;
        let like = desc.src.clone();
        init_like(&mut desc.dst, &like)?;
        if desc.alg == PoolingAlg::Max && desc.prop_kind == PropKind::ForwardTraining {
            workspace = Some(workspace_desc(desc)?);
        }
    }
    if let Some(workspace) = workspace {
        init.set_workspace(workspace);
    }
    Ok(())
}

fn init_backward(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_pooling().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        desc.prop_kind == PropKind::BackwardData,
        OP,
        "ref:bwd is backward only"
    );
    prim_rs::ensure_supported!(
        desc.src.data_type().is_float() && desc.dst.data_type().is_float(),
        OP,
        "backward pooling needs float gradients"
    );
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::NONE),
        OP,
        "backward pooling takes no attributes"
    );

    let mut workspace = None;
    let mut hint_dst = None;
    if let Some(hint) = init.hint() {
        if let Some(forward) = hint.op_desc().as_pooling() {
            if forward.prop_kind.is_forward() && same_geometry(forward, desc) {
                hint_dst = Some(forward.dst.clone());
                if !hint.workspace_md().is_zero() {
                    workspace = Some(hint.workspace_md().clone());
                }
            }
        }
    }
    if desc.alg == PoolingAlg::Max {
        prim_rs::ensure_supported!(
            workspace.is_some(),
            OP,
            "max pooling backward needs a training forward hint with a workspace"
        );
    }

    if let OpDesc::Pooling(desc) = init.desc_mut() {
        if let Some(like) = hint_dst {
            init_like(&mut desc.dst, &like)?;
        }
        init_plain(&mut desc.dst)?;
        let like = desc.dst.clone();
        init_like(&mut desc.src, &like)?;
    }
    if let Some(workspace) = workspace {
        init.set_workspace(workspace);
    }
    Ok(())
}

fn pooling_desc(pd: &PrimitiveDesc) -> PrimResult<PoolingDesc> {
    pd.op_desc()
        .as_pooling()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Pooling))
}

fn create_forward(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = pooling_desc(pd)?;
    let workspace = pd.workspace_md();
    Ok(Box::new(PoolingForward {
        window: window(&desc),
        epilogue: Epilogue::new(pd.attr(), &desc.dst),
        workspace: (!workspace.is_zero()).then(|| workspace.clone()),
        desc,
    }))
}

fn create_backward(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = pooling_desc(pd)?;
    let workspace = pd.workspace_md();
    Ok(Box::new(PoolingBackward {
        window: window(&desc),
        workspace: (!workspace.is_zero()).then(|| workspace.clone()),
        desc,
    }))
}

struct PoolingForward {
    desc: PoolingDesc,
    window: Window,
    epilogue: Epilogue,
    workspace: Option<MemoryDesc>,
}

impl PoolingForward {
    /// Pooled value and, for max pooling, the flat input offset it came from.
    fn pool(&self, plane: &[f32], out: (usize, usize, usize)) -> (f32, usize) {
        let window = &self.window;
        match self.desc.alg {
            PoolingAlg::Max => {
                let mut best = (f32::NEG_INFINITY, 0);
                for tap in window.taps() {
                    if let Some(offset) = window.input_offset(out, tap) {
                        if plane[offset] > best.0 {
                            best = (plane[offset], offset);
                        }
                    }
                }
                best
            }
            PoolingAlg::AvgIncludePadding | PoolingAlg::AvgExcludePadding => {
                let mut sum = 0.0;
                let mut count = 0usize;
                for tap in window.taps() {
                    if let Some(offset) = window.input_offset(out, tap) {
                        sum += plane[offset];
                        count += 1;
                    }
                }
                let divisor = if self.desc.alg == PoolingAlg::AvgIncludePadding {
                    window.kernel.volume()
                } else {
                    count
                };
                (sum / divisor.max(1) as f32, 0)
            }
        }
    }
}

impl Kernel for PoolingForward {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.src);
        let dst_memory = ctx.memory(Arg::Dst)?;
        let prior = self
            .epilogue
            .needs_prior_dst()
            .then(|| read_logical(dst_memory, &desc.dst));
        let binary = self.epilogue.binary_operands(ctx)?;

        let (isp, osp) = (self.window.input.volume(), self.window.output.volume());
        let planes = desc.dst.dims()[0] * desc.dst.dims()[1];
        let mut pooled = vec![(0f32, 0usize); planes * osp];
        pooled
            .par_chunks_mut(osp)
            .enumerate()
            .for_each(|(plane, out)| {
                let input = &src[plane * isp..(plane + 1) * isp];
                for (pos, value) in Window::positions(self.window.output).zip(out.iter_mut()) {
                    *value = self.pool(input, pos);
                }
            });

        let mut values: Vec<f32> = pooled.iter().map(|(value, _)| *value).collect();
        self.epilogue.apply(&mut values, prior.as_deref(), &binary);
        write_logical(dst_memory, &desc.dst, &values);
        if let Some(workspace) = &self.workspace {
            let indices: Vec<f32> = pooled.iter().map(|(_, index)| *index as f32).collect();
            write_logical(ctx.memory(Arg::Workspace)?, workspace, &indices);
        }
        Ok(())
    }
}

struct PoolingBackward {
    desc: PoolingDesc,
    window: Window,
    workspace: Option<MemoryDesc>,
}

impl Kernel for PoolingBackward {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let window = self.window;
        let diff_dst = read_logical(ctx.memory(Arg::DiffDst)?, &desc.dst);
        let indices = match &self.workspace {
            Some(workspace) => Some(read_logical(ctx.memory(Arg::Workspace)?, workspace)),
            None => None,
        };

        let (isp, osp) = (window.input.volume(), window.output.volume());
        let planes = desc.src.dims()[0] * desc.src.dims()[1];
        let mut diff_src = vec![0f32; planes * isp];
        diff_src
            .par_chunks_mut(isp)
            .enumerate()
            .for_each(|(plane, out)| {
                let grad = &diff_dst[plane * osp..(plane + 1) * osp];
                match (&indices, desc.alg) {
                    (Some(indices), PoolingAlg::Max) => {
                        let argmax = &indices[plane * osp..(plane + 1) * osp];
                        for (g, &index) in grad.iter().zip(argmax) {
                            if let Some(slot) = out.get_mut(index as usize) {
                                *slot += g;
                            }
                        }
                    }
                    _ => {
                        for (pos, g) in Window::positions(window.output).zip(grad) {
                            let taps: Vec<usize> = window
                                .taps()
                                .filter_map(|tap| window.input_offset(pos, tap))
                                .collect();
                            let divisor = if desc.alg == PoolingAlg::AvgIncludePadding {
                                window.kernel.volume()
                            } else {
                                taps.len()
                            };
                            let share = g / divisor.max(1) as f32;
                            for offset in taps {
                                out[offset] += share;
                            }
                        }
                    }
                }
            });
        write_logical(ctx.memory(Arg::DiffSrc)?, &desc.src, &diff_src);
        Ok(())
    }
}
