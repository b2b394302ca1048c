use std::sync::Arc;

use prim_rs::desc::{Arg, AttrSkip, BatchNormDesc, DataType, MemoryDesc, OpDesc, OpKind, PropKind};
use prim_rs::error::{PrimResult, PrimitiveError};
use prim_rs::primitive::{
    CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc, ScratchpadKey,
};
use rayon::prelude::*;

use super::{desc_mismatch, init_like, init_plain, other_kind, read_logical, write_logical, F32Scratch};

const OP: &str = "batch_normalization";

pub(crate) const REF_FWD: CandidateImpl = CandidateImpl::new("ref:fwd", init_forward, create_forward);
pub(crate) const REF_BWD: CandidateImpl = CandidateImpl::new("ref:bwd", init_backward, create_backward);

/// Relu mask recorded by a fused training forward pass, one byte per data element.
fn relu_mask_desc(desc: &BatchNormDesc) -> PrimResult<MemoryDesc> {
    let mut md = MemoryDesc::any(desc.data.dims(), DataType::U8)?;
    init_plain(&mut md)?;
    Ok(md)
}

fn check_common(init: &PdInit<'_>, desc: &BatchNormDesc) -> PrimResult<()> {
    prim_rs::ensure_supported!(
        desc.data.data_type().is_float(),
        OP,
        "data type {} is not a float type",
        desc.data.data_type()
    );
    prim_rs::ensure_supported!(
        init.attr().has_default_values(AttrSkip::NONE),
        OP,
        "batch normalization takes no attributes"
    );
    Ok(())
}

fn init_forward(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_batch_normalization().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(desc.prop_kind.is_forward(), OP, "ref:fwd is forward only");
    check_common(init, desc)?;

    let channels = desc.channels();
    let computes_stats = !desc.flags.use_global_stats;
    let workspace = if desc.flags.fuse_norm_relu && desc.is_training() {
        Some(relu_mask_desc(desc)?)
    } else {
        None
    };

    if let OpDesc::BatchNormalization(desc) = init.desc_mut() {
        init_plain(&mut desc.data)?;
    }
    // Inference recomputes statistics per call without exposing them as outputs.
    if computes_stats && init.desc().prop_kind() == PropKind::ForwardInference {
        init.book_scratchpad(ScratchpadKey::BatchNormStats, 2 * channels * 4)?;
    }
    if let Some(workspace) = workspace {
        init.set_workspace(workspace);
    }
    Ok(())
}

fn init_backward(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_batch_normalization().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(!desc.prop_kind.is_forward(), OP, "ref:bwd is backward only");
    check_common(init, desc)?;

    let mut workspace = None;
    if desc.flags.fuse_norm_relu {
        let forward = init
            .hint()
            .filter(|hint| !hint.workspace_md().is_zero())
            .and_then(|hint| hint.op_desc().as_batch_normalization().map(|fwd| (hint, fwd)))
            .filter(|(_, fwd)| fwd.is_training() && fwd.data.dims() == desc.data.dims());
        let Some((hint, _)) = forward else {
            return Err(PrimitiveError::unimplemented(
                OP,
                "fused relu backward needs a training forward hint with a workspace",
            ));
        };
        workspace = Some(hint.workspace_md().clone());
    }

    if let OpDesc::BatchNormalization(desc) = init.desc_mut() {
        init_plain(&mut desc.data)?;
        let like = desc.data.clone();
        init_like(&mut desc.diff_data, &like)?;
    }
    if let Some(workspace) = workspace {
        init.set_workspace(workspace);
    }
    Ok(())
}

fn batch_norm_desc(pd: &PrimitiveDesc) -> PrimResult<BatchNormDesc> {
    pd.op_desc()
        .as_batch_normalization()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::BatchNormalization))
}

fn create_forward(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = batch_norm_desc(pd)?;
    let workspace = pd.workspace_md();
    Ok(Box::new(BatchNormForward {
        workspace: (!workspace.is_zero()).then(|| workspace.clone()),
        desc,
    }))
}

fn create_backward(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = batch_norm_desc(pd)?;
    let workspace = pd.workspace_md();
    Ok(Box::new(BatchNormBackward {
        workspace: (!workspace.is_zero()).then(|| workspace.clone()),
        desc,
    }))
}

/// `(minibatch, channels, spatial)` view of an `N x C x ...` tensor.
fn layout(desc: &BatchNormDesc) -> (usize, usize, usize) {
    let dims = desc.data.dims();
    (dims[0], dims[1], dims[2..].iter().product())
}

/// Flat indices of channel `c` across the minibatch.
fn channel_indices(shape: (usize, usize, usize), c: usize) -> impl Iterator<Item = usize> {
    let (mb, channels, spatial) = shape;
    (0..mb).flat_map(move |n| {
        let base = (n * channels + c) * spatial;
        base..base + spatial
    })
}

fn scale_shift(ctx: &ExecContext<'_>, desc: &BatchNormDesc) -> PrimResult<Option<Vec<f32>>> {
    if !desc.flags.use_scaleshift {
        return Ok(None);
    }
    Ok(Some(read_logical(ctx.memory(Arg::ScaleShift)?, &desc.scaleshift)))
}

struct BatchNormForward {
    desc: BatchNormDesc,
    workspace: Option<MemoryDesc>,
}

impl BatchNormForward {
    fn statistics(&self, src: &[f32], shape: (usize, usize, usize)) -> (Vec<f32>, Vec<f32>) {
        let count = (shape.0 * shape.2).max(1) as f32;
        (0..shape.1)
            .into_par_iter()
            .map(|c| {
                let mean = channel_indices(shape, c).map(|i| src[i]).sum::<f32>() / count;
                let variance = channel_indices(shape, c)
                    .map(|i| (src[i] - mean) * (src[i] - mean))
                    .sum::<f32>()
                    / count;
                (mean, variance)
            })
            .unzip()
    }
}

impl Kernel for BatchNormForward {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let shape = layout(desc);
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.data);
        let scale_shift = scale_shift(ctx, desc)?;

        let (mean, variance) = if desc.flags.use_global_stats {
            (
                read_logical(ctx.memory(Arg::Mean)?, &desc.stat),
                read_logical(ctx.memory(Arg::Variance)?, &desc.stat),
            )
        } else {
            let (mean, variance) = self.statistics(&src, shape);
            if desc.is_training() {
                write_logical(ctx.memory(Arg::Mean)?, &desc.stat, &mean);
                write_logical(ctx.memory(Arg::Variance)?, &desc.stat, &variance);
                (mean, variance)
            } else {
                let mut stats = F32Scratch::new(ctx.scratchpad(ScratchpadKey::BatchNormStats)?);
                for (c, (m, v)) in mean.iter().zip(&variance).enumerate() {
                    stats.set(c, *m);
                    stats.set(shape.1 + c, *v);
                }
                let stats = stats.to_vec();
                (stats[..shape.1].to_vec(), stats[shape.1..2 * shape.1].to_vec())
            }
        };

        let (_, channels, spatial) = shape;
        let eps = desc.epsilon.get();
        let fuse_relu = desc.flags.fuse_norm_relu;
        let mut dst = vec![0f32; src.len()];
        dst.par_chunks_mut(spatial.max(1))
            .enumerate()
            .for_each(|(plane, out)| {
                let c = plane % channels;
                let inv_std = 1.0 / (variance[c] + eps).sqrt();
                let (gamma, beta) = match &scale_shift {
                    Some(ss) => (ss[c], ss[channels + c]),
                    None => (1.0, 0.0),
                };
                let input = &src[plane * spatial..(plane + 1) * spatial];
                for (o, &x) in out.iter_mut().zip(input) {
                    let y = gamma * (x - mean[c]) * inv_std + beta;
                    *o = if fuse_relu { y.max(0.0) } else { y };
                }
            });

        if let Some(workspace) = &self.workspace {
            let mask: Vec<f32> = dst.iter().map(|&y| if y > 0.0 { 1.0 } else { 0.0 }).collect();
            write_logical(ctx.memory(Arg::Workspace)?, workspace, &mask);
        }
        write_logical(ctx.memory(Arg::Dst)?, &desc.data, &dst);
        Ok(())
    }
}

struct BatchNormBackward {
    desc: BatchNormDesc,
    workspace: Option<MemoryDesc>,
}

impl Kernel for BatchNormBackward {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let shape = layout(desc);
        let (_, channels, _) = shape;
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.data);
        let mean = read_logical(ctx.memory(Arg::Mean)?, &desc.stat);
        let variance = read_logical(ctx.memory(Arg::Variance)?, &desc.stat);
        let mut diff_dst = read_logical(ctx.memory(Arg::DiffDst)?, &desc.diff_data);
        let scale_shift = scale_shift(ctx, desc)?;
        if let Some(workspace) = &self.workspace {
            let mask = read_logical(ctx.memory(Arg::Workspace)?, workspace);
            for (dy, m) in diff_dst.iter_mut().zip(mask) {
                if m == 0.0 {
                    *dy = 0.0;
                }
            }
        }

        let eps = desc.epsilon.get();
        let count = (shape.0 * shape.2).max(1) as f32;
        let global = desc.flags.use_global_stats;
        let per_channel: Vec<(f32, f32, Vec<(usize, f32)>)> = (0..channels)
            .into_par_iter()
            .map(|c| {
                let inv_std = 1.0 / (variance[c] + eps).sqrt();
                let gamma = scale_shift.as_ref().map_or(1.0, |ss| ss[c]);
                let mut diff_gamma = 0.0;
                let mut diff_beta = 0.0;
                for i in channel_indices(shape, c) {
                    diff_gamma += diff_dst[i] * (src[i] - mean[c]) * inv_std;
                    diff_beta += diff_dst[i];
                }
                let grads = channel_indices(shape, c)
                    .map(|i| {
                        let dx = if global {
                            gamma * diff_dst[i] * inv_std
                        } else {
                            let xhat = (src[i] - mean[c]) * inv_std;
                            gamma * inv_std
                                * (diff_dst[i] - diff_beta / count - xhat * diff_gamma / count)
                        };
                        (i, dx)
                    })
                    .collect();
                (diff_gamma, diff_beta, grads)
            })
            .collect();

        let mut diff_src = vec![0f32; src.len()];
        let mut diff_scale_shift = vec![0f32; 2 * channels];
        for (c, (diff_gamma, diff_beta, grads)) in per_channel.into_iter().enumerate() {
            diff_scale_shift[c] = diff_gamma;
            diff_scale_shift[channels + c] = diff_beta;
            for (i, dx) in grads {
                diff_src[i] = dx;
            }
        }
        write_logical(ctx.memory(Arg::DiffSrc)?, &desc.diff_data, &diff_src);
        if !desc.diff_scaleshift.is_zero() {
            write_logical(
                ctx.memory(Arg::DiffScaleShift)?,
                &desc.diff_scaleshift,
                &diff_scale_shift,
            );
        }
        Ok(())
    }
}
