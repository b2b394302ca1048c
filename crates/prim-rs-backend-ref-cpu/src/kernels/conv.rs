//! Convolution: im2col + GEMM forward and direct forward/backward reference kernels.

use std::sync::Arc;

use prim_rs::desc::{
    eltwise_preserves_zero, Arg, AttrSkip, ConvAlg, ConvolutionDesc, DataType, OpDesc, OpKind,
    PropKind,
};
use prim_rs::error::{PrimResult, PrimitiveError};
use prim_rs::memory::{load_f32, store_f32};
use prim_rs::primitive::{
    CandidateImpl, ExecContext, Kernel, PdInit, PrimitiveDesc, ScratchpadKey,
};
use rayon::prelude::*;

use super::{
    accepts_types, desc_mismatch, init_like, init_plain, is_row_major, other_kind, read_logical,
    write_logical, Epilogue, Spatial, Window, WEIGHTED_TYPES,
};

const OP: &str = "convolution";

/// Forward f32 convolution lowered to im2col and a GEMM. Pointwise convolutions skip im2col.
pub(crate) const GEMM_F32: CandidateImpl = CandidateImpl::new("gemm:f32", init_gemm, create_gemm);

/// Direct loops for every propagation kind and grouped weights; int8 is forward only.
pub(crate) const REF: CandidateImpl = CandidateImpl::new("ref:direct", init_ref, create_ref);

#[derive(Debug, Clone, Copy)]
struct Geometry {
    mb: usize,
    groups: usize,
    icg: usize,
    ocg: usize,
    window: Window,
}

impl Geometry {
    fn new(desc: &ConvolutionDesc) -> Self {
        let groups = desc.groups();
        Self {
            mb: desc.mb(),
            groups,
            icg: desc.ic() / groups,
            ocg: desc.oc() / groups,
            window: Window::new(
                &desc.src.dims()[2..],
                &desc.dst.dims()[2..],
                desc.kernel_dims(),
                &desc.strides,
                &desc.dilates,
                &desc.padding_l,
            ),
        }
    }

    fn ic(&self) -> usize {
        self.icg * self.groups
    }

    fn oc(&self) -> usize {
        self.ocg * self.groups
    }

    fn is_pointwise(&self) -> bool {
        let window = &self.window;
        window.kernel.volume() == 1
            && window.stride.volume() == 1
            && window.pad == Spatial::from_slice(&[], 0)
            && window.input == window.output
    }

    fn weight_index(&self, g: usize, o: usize, i: usize, tap: usize) -> usize {
        ((g * self.ocg + o) * self.icg + i) * self.window.kernel.volume() + tap
    }
}

fn types_supported(desc: &ConvolutionDesc) -> bool {
    let bias = desc.with_bias().then(|| desc.bias.data_type());
    let supported = accepts_types(
        WEIGHTED_TYPES,
        desc.src.data_type(),
        desc.weights.data_type(),
        desc.dst.data_type(),
        bias,
    );
    supported && (desc.prop_kind.is_forward() || !desc.src.data_type().is_int8())
}

/// A bias next to a channel-padded dst (diff dst for backward weights) is padded the same way.
fn finalize_bias(desc: &mut ConvolutionDesc) -> PrimResult<()> {
    if !desc.with_bias() {
        return Ok(());
    }
    let padded_oc = desc.dst.padded_dims()[1];
    if desc.bias.padded_dims()[0] != padded_oc {
        prim_rs::ensure_supported!(
            desc.bias.is_any(),
            OP,
            "bias {} does not cover padded dst channels {padded_oc}",
            desc.bias
        );
        desc.bias = desc.bias.with_padded_dims(&[padded_oc])?;
    }
    init_plain(&mut desc.bias)
}

fn finalize_layouts(init: &mut PdInit<'_>) -> PrimResult<()> {
    if let OpDesc::Convolution(desc) = init.desc_mut() {
        if desc.src.is_any() {
            let like = desc.dst.clone();
            init_like(&mut desc.src, &like)?;
        }
        let like = desc.src.clone();
        init_like(&mut desc.dst, &like)?;
        init_plain(&mut desc.weights)?;
        finalize_bias(desc)?;
    }
    Ok(())
}

fn init_gemm(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_convolution().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        desc.prop_kind.is_forward(),
        OP,
        "gemm:f32 is forward only"
    );
    prim_rs::ensure_supported!(
        desc.alg != ConvAlg::Winograd,
        OP,
        "winograd is not provided"
    );
    prim_rs::ensure_supported!(!desc.with_groups(), OP, "gemm:f32 does not take grouped weights");
    let all_f32 = [&desc.src, &desc.weights, &desc.dst]
        .into_iter()
        .chain(desc.with_bias().then_some(&desc.bias))
        .all(|md| md.data_type() == DataType::F32);
    prim_rs::ensure_supported!(all_f32, OP, "gemm:f32 needs f32 operands");
    let attr = init.attr();
    prim_rs::ensure_supported!(
        attr.has_default_values(AttrSkip::POST_OPS | AttrSkip::OUTPUT_SCALES),
        OP,
        "zero points are not supported"
    );
    Epilogue::check(OP, attr, &desc.dst)?;
    if !desc.dst.is_any() && !desc.dst.is_plain() {
        prim_rs::ensure_supported!(
            attr.post_ops().entries().iter().all(eltwise_preserves_zero),
            OP,
            "blocked dst requires post-ops that keep zero padding intact"
        );
    }

    let geometry = Geometry::new(desc);
    let columns = if geometry.is_pointwise() {
        0
    } else {
        geometry
            .ic()
            .checked_mul(geometry.window.kernel.volume())
            .and_then(|rows| rows.checked_mul(geometry.window.output.volume()))
            .and_then(|elems| elems.checked_mul(DataType::F32.size_in_bytes()))
            .ok_or_else(|| PrimitiveError::out_of_memory("sizing im2col columns", usize::MAX))?
    };

    finalize_layouts(init)?;
    let desc = init.desc().as_convolution().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        is_row_major(&desc.src) && is_row_major(&desc.weights),
        OP,
        "gemm:f32 needs row-major src and weights"
    );
    init.book_scratchpad(ScratchpadKey::ConvColumns, columns)
}

fn init_ref(init: &mut PdInit<'_>) -> PrimResult<()> {
    let desc = init.desc().as_convolution().ok_or_else(|| other_kind(OP))?;
    prim_rs::ensure_supported!(
        desc.alg != ConvAlg::Winograd,
        OP,
        "winograd is not provided"
    );
    prim_rs::ensure_supported!(
        types_supported(desc),
        OP,
        "unsupported data types {}x{}->{}",
        desc.src.data_type(),
        desc.weights.data_type(),
        desc.dst.data_type()
    );
    if desc.prop_kind.is_forward() {
        prim_rs::ensure_supported!(
            init.attr()
                .has_default_values(AttrSkip::POST_OPS | AttrSkip::OUTPUT_SCALES),
            OP,
            "zero points are not supported"
        );
        Epilogue::check(OP, init.attr(), &desc.dst)?;
    } else {
        prim_rs::ensure_supported!(
            init.attr().has_default_values(AttrSkip::NONE),
            OP,
            "backward passes take no attributes"
        );
    }
    finalize_layouts(init)
}

fn conv_desc(pd: &PrimitiveDesc) -> PrimResult<ConvolutionDesc> {
    pd.op_desc()
        .as_convolution()
        .cloned()
        .ok_or_else(|| desc_mismatch(OpKind::Convolution))
}

fn create_gemm(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = conv_desc(pd)?;
    let geometry = Geometry::new(&desc);
    if geometry.is_pointwise() {
        log::trace!("convolution: 1x1 kernel, skipping im2col");
    }
    Ok(Box::new(ConvForward {
        geometry,
        epilogue: Epilogue::new(pd.attr(), &desc.dst),
        lowered: true,
        desc,
    }))
}

fn create_ref(pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
    let desc = conv_desc(pd)?;
    let geometry = Geometry::new(&desc);
    Ok(match desc.prop_kind {
        PropKind::BackwardData => Box::new(ConvBackwardData { desc, geometry }),
        PropKind::BackwardWeights => Box::new(ConvBackwardWeights { desc, geometry }),
        _ => Box::new(ConvForward {
            epilogue: Epilogue::new(pd.attr(), &desc.dst),
            lowered: false,
            desc,
            geometry,
        }),
    })
}

struct ConvForward {
    desc: ConvolutionDesc,
    geometry: Geometry,
    epilogue: Epilogue,
    lowered: bool,
}

impl ConvForward {
    fn run_direct(&self, src: &[f32], weights: &[f32], acc: &mut [f32]) {
        let geo = self.geometry;
        let (isp, osp) = (geo.window.input.volume(), geo.window.output.volume());
        let oc = geo.oc();
        acc.par_chunks_mut(osp).enumerate().for_each(|(plane, out)| {
            let (n, oc_idx) = (plane / oc, plane % oc);
            let (g, o) = (oc_idx / geo.ocg, oc_idx % geo.ocg);
            for (pos, value) in Window::positions(geo.window.output).zip(out.iter_mut()) {
                let mut sum = 0.0;
                for i in 0..geo.icg {
                    let channel = &src[(n * geo.ic() + g * geo.icg + i) * isp..][..isp];
                    for (tap, k) in geo.window.taps().enumerate() {
                        if let Some(offset) = geo.window.input_offset(pos, k) {
                            sum += channel[offset] * weights[geo.weight_index(g, o, i, tap)];
                        }
                    }
                }
                *value = sum;
            }
        });
    }

    fn im2col(&self, src_image: &[f32], columns: &mut [u8]) {
        let geo = self.geometry;
        let isp = geo.window.input.volume();
        let osp = geo.window.output.volume();
        let width = osp * DataType::F32.size_in_bytes();
        let taps: Vec<_> = geo.window.taps().collect();
        columns
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(row, column)| {
                let (c, tap) = (row / taps.len(), row % taps.len());
                let plane = &src_image[c * isp..(c + 1) * isp];
                for (s, pos) in Window::positions(geo.window.output).enumerate() {
                    let value = geo
                        .window
                        .input_offset(pos, taps[tap])
                        .map_or(0.0, |offset| plane[offset]);
                    store_f32(column, DataType::F32, s, value);
                }
            });
    }

    fn run_gemm(&self, ctx: &mut ExecContext<'_>, src: &[f32], weights: &[f32], acc: &mut [f32]) -> PrimResult<()> {
        let geo = self.geometry;
        let rows = geo.ic() * geo.window.kernel.volume();
        let (isp, osp) = (geo.window.input.volume(), geo.window.output.volume());
        let pointwise = geo.is_pointwise();
        let image_len = geo.ic() * isp;
        for n in 0..geo.mb {
            let src_image = &src[n * image_len..(n + 1) * image_len];
            let out_image = &mut acc[n * geo.oc() * osp..(n + 1) * geo.oc() * osp];
            if pointwise {
                out_image.par_chunks_mut(osp).enumerate().for_each(|(oc, out)| {
                    out.fill(0.0);
                    for r in 0..rows {
                        let w = weights[oc * rows + r];
                        for (value, x) in out.iter_mut().zip(&src_image[r * osp..(r + 1) * osp]) {
                            *value += w * x;
                        }
                    }
                });
            } else {
                let columns = ctx.scratchpad(ScratchpadKey::ConvColumns)?;
                self.im2col(src_image, columns);
                let columns: &[u8] = columns;
                out_image.par_chunks_mut(osp).enumerate().for_each(|(oc, out)| {
                    out.fill(0.0);
                    for r in 0..rows {
                        let w = weights[oc * rows + r];
                        if w == 0.0 {
                            continue;
                        }
                        for (s, value) in out.iter_mut().enumerate() {
                            *value += w * load_f32(columns, DataType::F32, r * osp + s);
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

impl Kernel for ConvForward {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let geo = self.geometry;
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

        let osp = geo.window.output.volume();
        let mut acc = vec![0f32; geo.mb * geo.oc() * osp];
        if self.lowered {
            self.run_gemm(ctx, &src, &weights, &mut acc)?;
        } else {
            self.run_direct(&src, &weights, &mut acc);
        }
        if let Some(bias) = bias {
            for (plane, out) in acc.chunks_mut(osp.max(1)).enumerate() {
                let b = bias[plane % geo.oc()];
                out.iter_mut().for_each(|value| *value += b);
            }
        }
        self.epilogue.apply(&mut acc, prior.as_deref(), &binary);
        write_logical(dst_memory, &desc.dst, &acc);
        Ok(())
    }
}

struct ConvBackwardData {
    desc: ConvolutionDesc,
    geometry: Geometry,
}

impl Kernel for ConvBackwardData {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let geo = self.geometry;
        let diff_dst = read_logical(ctx.memory(Arg::DiffDst)?, &desc.dst);
        let weights = read_logical(ctx.memory(Arg::Weights)?, &desc.weights);
        let (isp, osp) = (geo.window.input.volume(), geo.window.output.volume());
        let ic = geo.ic();

        let mut diff_src = vec![0f32; geo.mb * ic * isp];
        diff_src
            .par_chunks_mut(isp)
            .enumerate()
            .for_each(|(plane, out)| {
                let (n, c) = (plane / ic, plane % ic);
                let (g, i) = (c / geo.icg, c % geo.icg);
                for (pos, value) in Window::positions(geo.window.input).zip(out.iter_mut()) {
                    let mut sum = 0.0;
                    for o in 0..geo.ocg {
                        let grad = &diff_dst[(n * geo.oc() + g * geo.ocg + o) * osp..][..osp];
                        for (tap, k) in geo.window.taps().enumerate() {
                            if let Some(offset) = geo.window.output_offset(pos, k) {
                                sum += grad[offset] * weights[geo.weight_index(g, o, i, tap)];
                            }
                        }
                    }
                    *value = sum;
                }
            });
        write_logical(ctx.memory(Arg::DiffSrc)?, &desc.src, &diff_src);
        Ok(())
    }
}

struct ConvBackwardWeights {
    desc: ConvolutionDesc,
    geometry: Geometry,
}

impl Kernel for ConvBackwardWeights {
    fn execute(&self, ctx: &mut ExecContext<'_>) -> PrimResult<()> {
        let desc = &self.desc;
        let geo = self.geometry;
        let src = read_logical(ctx.memory(Arg::Src)?, &desc.src);
        let diff_dst = read_logical(ctx.memory(Arg::DiffDst)?, &desc.dst);
        let (isp, osp) = (geo.window.input.volume(), geo.window.output.volume());
        let kv = geo.window.kernel.volume();
        let taps: Vec<_> = geo.window.taps().collect();

        let mut diff_weights = vec![0f32; geo.oc() * geo.icg * kv];
        diff_weights
            .par_chunks_mut(geo.icg * kv)
            .enumerate()
            .for_each(|(oc_idx, row)| {
                let g = oc_idx / geo.ocg;
                for (entry, value) in row.iter_mut().enumerate() {
                    let (i, tap) = (entry / kv, entry % kv);
                    let mut sum = 0.0;
                    for n in 0..geo.mb {
                        let plane = &src[(n * geo.ic() + g * geo.icg + i) * isp..][..isp];
                        let grad = &diff_dst[(n * geo.oc() + oc_idx) * osp..][..osp];
                        for (s, pos) in Window::positions(geo.window.output).enumerate() {
                            if let Some(offset) = geo.window.input_offset(pos, taps[tap]) {
                                sum += plane[offset] * grad[s];
                            }
                        }
                    }
                    *value = sum;
                }
            });
        write_logical(ctx.memory(Arg::DiffWeights)?, &desc.weights, &diff_weights);

        if desc.with_bias() {
            let diff_bias: Vec<f32> = (0..geo.oc())
                .into_par_iter()
                .map(|oc_idx| {
                    (0..geo.mb)
                        .map(|n| diff_dst[(n * geo.oc() + oc_idx) * osp..][..osp].iter().sum::<f32>())
                        .sum()
                })
                .collect();
            write_logical(ctx.memory(Arg::DiffBias)?, &desc.bias, &diff_bias);
        }
        Ok(())
    }
}
