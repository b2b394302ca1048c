//! Reference kernels and the helpers they share.
//!
//! Every kernel reads its operands as logical `f32` values, computes in `f32`, and writes the
//! result back through the destination's layout and element type. Attribute handling (output
//! scales followed by the post-op chain) lives in [`Epilogue`].

pub(crate) mod batch_norm;
pub(crate) mod concat;
pub(crate) mod conv;
pub(crate) mod matmul;
pub(crate) mod pooling;
pub(crate) mod reduction;
pub(crate) mod reorder;
pub(crate) mod sum;

use prim_rs::desc::{Arg, DataType, FormatTag, MemoryDesc, OpKind, PostOp, PrimitiveAttr};
use prim_rs::error::{PrimResult, PrimitiveError};
use prim_rs::memory::{element_offsets, load_f32, store_f32, Memory};
use prim_rs::primitive::ExecContext;
use rayon::prelude::*;
use DataType::{Bf16, F32, S32, S8, U8};

/// Row-major strides, in elements, of a dense tensor with `dims`.
pub(crate) fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1].max(1);
    }
    strides
}

/// Gives an `any` descriptor a dense row-major layout of any rank.
pub(crate) fn init_plain(md: &mut MemoryDesc) -> PrimResult<()> {
    if md.is_any() {
        let strides = row_major_strides(md.dims());
        *md = MemoryDesc::with_strides(md.dims(), md.data_type(), &strides)?;
    }
    Ok(())
}

pub(crate) fn is_row_major(md: &MemoryDesc) -> bool {
    md.is_plain()
        && md
            .blocking()
            .is_some_and(|blocking| blocking.strides.as_slice() == row_major_strides(md.dims()))
}

/// Named tag `md` is laid out in, for propagating a source layout to an `any` destination.
pub(crate) fn tag_of(md: &MemoryDesc) -> Option<FormatTag> {
    let ndims = md.ndims();
    [
        FormatTag::plain_for_ndims(ndims),
        FormatTag::channels_last_for_ndims(ndims),
        FormatTag::NChw8c,
        FormatTag::NChw16c,
    ]
    .into_iter()
    .find(|&tag| tag != FormatTag::Undef && md.matches_tag(tag))
}

/// Initializes an `any` destination with the layout of `like`, falling back to row-major.
pub(crate) fn init_like(md: &mut MemoryDesc, like: &MemoryDesc) -> PrimResult<()> {
    match tag_of(like) {
        Some(tag) if md.is_any() => md.init_format_if_any(tag),
        _ => init_plain(md),
    }
}

/// Logical elements of `memory` interpreted through `md`, in row-major index order.
pub(crate) fn read_logical(memory: &Memory, md: &MemoryDesc) -> Vec<f32> {
    let bytes = memory.read_bytes();
    let data_type = md.data_type();
    element_offsets(md)
        .into_iter()
        .map(|offset| load_f32(&bytes, data_type, offset))
        .collect()
}

pub(crate) fn write_logical(memory: &Memory, md: &MemoryDesc, values: &[f32]) {
    let offsets = element_offsets(md);
    let data_type = md.data_type();
    let mut bytes = memory.write_bytes();
    for (offset, value) in offsets.into_iter().zip(values) {
        store_f32(&mut bytes, data_type, offset, *value);
    }
}

/// Index into a tensor of `src_dims` broadcast against the row-major position `flat` of `dims`.
pub(crate) fn broadcast_index(dims: &[usize], src_dims: &[usize], flat: usize) -> usize {
    let mut rest = flat;
    let mut index = 0;
    let mut src_stride = 1;
    for axis in (0..dims.len()).rev() {
        let coord = rest % dims[axis].max(1);
        rest /= dims[axis].max(1);
        if src_dims[axis] != 1 {
            index += coord * src_stride;
        }
        src_stride *= src_dims[axis];
    }
    index
}

pub(crate) fn broadcastable(dims: &[usize], src_dims: &[usize]) -> bool {
    dims.len() == src_dims.len()
        && dims
            .iter()
            .zip(src_dims)
            .all(|(&dim, &src)| src == dim || src == 1)
}

/// `f32` view over raw scratchpad bytes.
pub(crate) struct F32Scratch<'a> {
    bytes: &'a mut [u8],
}

impl<'a> F32Scratch<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub(crate) fn get(&self, index: usize) -> f32 {
        let start = index * 4;
        let raw = &self.bytes[start..start + 4];
        f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    pub(crate) fn set(&mut self, index: usize, value: f32) {
        let start = index * 4;
        self.bytes[start..start + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn fill(&mut self, value: f32) {
        let raw = value.to_ne_bytes();
        for chunk in self.bytes.chunks_exact_mut(4) {
            chunk.copy_from_slice(&raw);
        }
    }

    pub(crate) fn to_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|index| self.get(index)).collect()
    }
}

/// Decline raised when a candidate list is consulted for a descriptor of another kind.
pub(crate) fn other_kind(op: &'static str) -> PrimitiveError {
    PrimitiveError::unimplemented(op, "descriptor of another operation kind")
}

pub(crate) fn desc_mismatch(kind: OpKind) -> PrimitiveError {
    PrimitiveError::execution(format!("resolved descriptor is not a {kind} descriptor"))
}

/// One accepted `(src, weights, dst, bias)` element type combination.
pub(crate) struct TypeRow {
    src: &'static [DataType],
    weights: &'static [DataType],
    dst: &'static [DataType],
    bias: &'static [DataType],
}

/// Combinations the reference convolution and matmul kernels compute. Anything else declines.
pub(crate) const WEIGHTED_TYPES: &[TypeRow] = &[
    TypeRow {
        src: &[F32],
        weights: &[F32],
        dst: &[F32],
        bias: &[F32],
    },
    TypeRow {
        src: &[Bf16],
        weights: &[Bf16],
        dst: &[Bf16, F32],
        bias: &[Bf16, F32],
    },
    TypeRow {
        src: &[S8, U8],
        weights: &[S8],
        dst: &[F32, S32, S8, U8],
        bias: &[F32, S32, S8, U8],
    },
];

/// Whether some row of `table` admits the given operand types; `bias` is `None` without a bias.
pub(crate) fn accepts_types(
    table: &[TypeRow],
    src: DataType,
    weights: DataType,
    dst: DataType,
    bias: Option<DataType>,
) -> bool {
    table.iter().any(|row| {
        row.src.contains(&src)
            && row.weights.contains(&weights)
            && row.dst.contains(&dst)
            && bias.map_or(true, |bias| row.bias.contains(&bias))
    })
}

/// Output scaling and post-op chain applied to a freshly computed destination.
pub(crate) struct Epilogue {
    dims: Vec<usize>,
    scales: Vec<f32>,
    scale_axis: Option<usize>,
    post_ops: Vec<PostOp>,
}

impl Epilogue {
    /// Declines attributes the reference epilogue cannot express for `dst`.
    pub(crate) fn check(op: &'static str, attr: &PrimitiveAttr, dst: &MemoryDesc) -> PrimResult<()> {
        let scales = attr.output_scales();
        if scales.mask != 0 {
            prim_rs::ensure_supported!(
                scales.mask.count_ones() == 1,
                op,
                "output scale mask {:#b} spans several axes",
                scales.mask
            );
            let axis = scales.mask.trailing_zeros() as usize;
            prim_rs::ensure_supported!(
                axis < dst.ndims() && scales.scales.len() == dst.dims()[axis],
                op,
                "output scales do not match dst axis {axis}"
            );
        }
        for post_op in attr.post_ops().entries() {
            if let PostOp::Binary { src1, .. } = post_op {
                prim_rs::ensure_supported!(
                    !src1.is_any() && broadcastable(dst.dims(), src1.dims()),
                    op,
                    "binary post-op operand {src1} does not broadcast to {dst}"
                );
            }
        }
        Ok(())
    }

    pub(crate) fn new(attr: &PrimitiveAttr, dst: &MemoryDesc) -> Self {
        let scales = attr.output_scales();
        Self {
            dims: dst.dims().to_vec(),
            scales: scales.scales.iter().map(|scale| scale.get()).collect(),
            scale_axis: (scales.mask != 0).then(|| scales.mask.trailing_zeros() as usize),
            post_ops: attr.post_ops().entries().to_vec(),
        }
    }

    /// `true` when a sum post-op needs the destination's previous contents.
    pub(crate) fn needs_prior_dst(&self) -> bool {
        self.post_ops.iter().any(PostOp::is_sum)
    }

    /// Logical values of every binary post-op operand, indexed like the chain.
    pub(crate) fn binary_operands(&self, ctx: &ExecContext<'_>) -> PrimResult<Vec<Option<Vec<f32>>>> {
        self.post_ops
            .iter()
            .enumerate()
            .map(|(index, post_op)| match post_op {
                PostOp::Binary { src1, .. } => {
                    let memory = ctx.memory(Arg::PostOpBinarySrc(index as u16))?;
                    Ok(Some(read_logical(memory, src1)))
                }
                _ => Ok(None),
            })
            .collect()
    }

    fn scale_at(&self, flat: usize) -> f32 {
        match self.scale_axis {
            None => self.scales.first().copied().unwrap_or(1.0),
            Some(axis) => {
                let inner: usize = self.dims[axis + 1..].iter().product();
                let coord = (flat / inner.max(1)) % self.dims[axis].max(1);
                self.scales[coord]
            }
        }
    }

    fn finish(&self, flat: usize, value: f32, prior: Option<&[f32]>, binary: &[Option<Vec<f32>>]) -> f32 {
        let mut value = value * self.scale_at(flat);
        for (index, post_op) in self.post_ops.iter().enumerate() {
            value = match post_op {
                PostOp::Eltwise {
                    alg,
                    alpha,
                    beta,
                    scale,
                } => scale.get() * alg.apply(value, alpha.get(), beta.get()),
                PostOp::Sum { scale } => value + scale.get() * prior.map_or(0.0, |prior| prior[flat]),
                PostOp::Binary { alg, src1 } => match &binary[index] {
                    Some(operand) => {
                        alg.apply(value, operand[broadcast_index(&self.dims, src1.dims(), flat)])
                    }
                    None => value,
                },
            };
        }
        value
    }

    pub(crate) fn apply(&self, values: &mut [f32], prior: Option<&[f32]>, binary: &[Option<Vec<f32>>]) {
        if self.scale_axis.is_none() && self.scales.first() == Some(&1.0) && self.post_ops.is_empty() {
            return;
        }
        values
            .par_iter_mut()
            .enumerate()
            .for_each(|(flat, value)| *value = self.finish(flat, *value, prior, binary));
    }
}

/// Spatial extents normalized to three axes (depth, height, width); missing leading axes are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Spatial {
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl Spatial {
    pub(crate) fn from_slice(values: &[usize], fill: usize) -> Self {
        let mut padded = [fill; 3];
        let start = 3 - values.len().min(3);
        padded[start..].copy_from_slice(&values[values.len().saturating_sub(3)..]);
        Self {
            d: padded[0],
            h: padded[1],
            w: padded[2],
        }
    }

    pub(crate) fn volume(self) -> usize {
        self.d * self.h * self.w
    }
}

/// Input coordinate read by output `o` through kernel tap `k`, if it falls inside the image.
fn input_coord(o: usize, k: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    (o * stride + k * (dilation + 1))
        .checked_sub(pad)
        .filter(|&i| i < extent)
}

/// Output coordinate that reads input `i` through kernel tap `k`, if any.
fn output_coord(i: usize, k: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let offset = (i + pad).checked_sub(k * (dilation + 1))?;
    if offset % stride != 0 {
        return None;
    }
    Some(offset / stride).filter(|&o| o < extent)
}

pub(crate) type Position = (usize, usize, usize);

/// Sliding-window geometry shared by convolution and pooling. Dilation is zero-based.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub input: Spatial,
    pub output: Spatial,
    pub kernel: Spatial,
    pub stride: Spatial,
    pub dilation: Spatial,
    pub pad: Spatial,
}

impl Window {
    pub(crate) fn new(
        input: &[usize],
        output: &[usize],
        kernel: &[usize],
        stride: &[usize],
        dilation: &[usize],
        pad: &[usize],
    ) -> Self {
        Self {
            input: Spatial::from_slice(input, 1),
            output: Spatial::from_slice(output, 1),
            kernel: Spatial::from_slice(kernel, 1),
            stride: Spatial::from_slice(stride, 1),
            dilation: Spatial::from_slice(dilation, 0),
            pad: Spatial::from_slice(pad, 0),
        }
    }

    /// Flat input spatial offset read by output `out` through tap `tap`.
    pub(crate) fn input_offset(&self, out: Position, tap: Position) -> Option<usize> {
        let id = input_coord(out.0, tap.0, self.stride.d, self.dilation.d, self.pad.d, self.input.d)?;
        let ih = input_coord(out.1, tap.1, self.stride.h, self.dilation.h, self.pad.h, self.input.h)?;
        let iw = input_coord(out.2, tap.2, self.stride.w, self.dilation.w, self.pad.w, self.input.w)?;
        Some((id * self.input.h + ih) * self.input.w + iw)
    }

    /// Flat output spatial offset that reads input `input` through tap `tap`.
    pub(crate) fn output_offset(&self, input: Position, tap: Position) -> Option<usize> {
        let od = output_coord(input.0, tap.0, self.stride.d, self.dilation.d, self.pad.d, self.output.d)?;
        let oh = output_coord(input.1, tap.1, self.stride.h, self.dilation.h, self.pad.h, self.output.h)?;
        let ow = output_coord(input.2, tap.2, self.stride.w, self.dilation.w, self.pad.w, self.output.w)?;
        Some((od * self.output.h + oh) * self.output.w + ow)
    }

    /// Row-major positions of `extent`.
    pub(crate) fn positions(extent: Spatial) -> impl Iterator<Item = Position> {
        (0..extent.d).flat_map(move |d| {
            (0..extent.h).flat_map(move |h| (0..extent.w).map(move |w| (d, h, w)))
        })
    }

    pub(crate) fn taps(&self) -> impl Iterator<Item = Position> {
        Self::positions(self.kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prim_rs::desc::{BinaryAlg, DataType, EltwiseAlg, PostOps};

    #[test]
    fn broadcast_index_collapses_unit_axes() {
        let dims = [2, 3];
        assert_eq!(broadcast_index(&dims, &[1, 3], 4), 1);
        assert_eq!(broadcast_index(&dims, &[2, 1], 4), 1);
        assert_eq!(broadcast_index(&dims, &[2, 3], 4), 4);
        assert_eq!(broadcast_index(&dims, &[1, 1], 5), 0);
    }

    #[test]
    fn init_plain_handles_ranks_without_tags() {
        let mut md = MemoryDesc::any(&[2, 1, 1, 3, 3, 3], DataType::F32).unwrap();
        init_plain(&mut md).unwrap();
        assert!(is_row_major(&md));
        assert_eq!(md.size(), 2 * 27 * 4);
    }

    #[test]
    fn tag_of_recognizes_blocked_layouts() {
        let md = MemoryDesc::new(&[1, 3, 2, 2], DataType::F32, FormatTag::NChw8c).unwrap();
        assert_eq!(tag_of(&md), Some(FormatTag::NChw8c));
        let md = MemoryDesc::new(&[1, 3, 2, 2], DataType::F32, FormatTag::Nhwc).unwrap();
        assert_eq!(tag_of(&md), Some(FormatTag::Nhwc));
    }

    #[test]
    fn epilogue_applies_scales_then_chain() {
        let dst = MemoryDesc::new(&[1, 2], DataType::F32, FormatTag::Nc).unwrap();
        let attr = PrimitiveAttr::new()
            .with_output_scales(1 << 1, vec![2.0, -1.0])
            .unwrap()
            .with_post_ops(
                PostOps::new()
                    .append_eltwise(1.0, EltwiseAlg::Relu, 0.0, 0.0)
                    .append_sum(0.5)
                    .append_binary(BinaryAlg::Add, dst.clone()),
            );
        Epilogue::check("test", &attr, &dst).unwrap();
        let epilogue = Epilogue::new(&attr, &dst);
        assert!(epilogue.needs_prior_dst());
        let mut values = vec![3.0, 3.0];
        let prior = [4.0, 4.0];
        let binary = vec![None, None, Some(vec![10.0, 20.0])];
        epilogue.apply(&mut values, Some(&prior), &binary);
        assert_eq!(values, vec![6.0 + 2.0 + 10.0, 0.0 + 2.0 + 20.0]);
    }

    #[test]
    fn epilogue_declines_multi_axis_scales() {
        let dst = MemoryDesc::new(&[2, 2], DataType::F32, FormatTag::Nc).unwrap();
        let attr = PrimitiveAttr::new()
            .with_output_scales(0b11, vec![1.0; 4])
            .unwrap();
        let err = Epilogue::check("test", &attr, &dst).unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[test]
    fn coordinates_respect_stride_dilation_and_padding() {
        assert_eq!(input_coord(0, 0, 1, 0, 1, 4), None);
        assert_eq!(input_coord(1, 2, 2, 0, 1, 8), Some(3));
        assert_eq!(input_coord(1, 1, 1, 1, 0, 8), Some(3));
        assert_eq!(output_coord(3, 2, 2, 0, 1, 4), Some(1));
        assert_eq!(output_coord(2, 0, 2, 0, 0, 4), Some(1));
        assert_eq!(output_coord(3, 0, 2, 0, 0, 4), None);
    }

    #[test]
    fn window_offsets_are_inverse() {
        let window = Window::new(&[5, 5], &[3, 3], &[3, 3], &[2, 2], &[0, 0], &[1, 1]);
        let tap = (0, 2, 1);
        let input = window.input_offset((0, 1, 2), tap).unwrap();
        assert_eq!(input, 3 * 5 + 4);
        assert_eq!(window.output_offset((0, 3, 4), tap), Some(5));
        assert_eq!(window.taps().count(), 9);
    }

    #[test]
    fn spatial_pads_leading_axes() {
        let spatial = Spatial::from_slice(&[5], 1);
        assert_eq!((spatial.d, spatial.h, spatial.w), (1, 1, 5));
        assert_eq!(Spatial::from_slice(&[2, 3, 4], 0).volume(), 24);
    }
}
