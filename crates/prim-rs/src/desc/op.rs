//! Operation descriptors.
//!
//! [`OpDesc`] is a closed tagged union over the supported operator kinds. Each variant is a plain
//! value type validated on construction; resolution works on a private clone so the caller's
//! descriptor is never modified.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::attr::Scalar;
use super::memory::{DataType, Dims, MemoryDesc};
use crate::error::{PrimResult, PrimitiveError};

/// Logical argument slots of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Arg {
    Src,
    Weights,
    Bias,
    Dst,
    Mean,
    Variance,
    ScaleShift,
    Workspace,
    Scratchpad,
    DiffSrc,
    DiffWeights,
    DiffBias,
    DiffDst,
    DiffScaleShift,
    /// The `n`-th source of an n-ary primitive (concat, sum).
    MultipleSrc(u16),
    /// Second operand of the binary post-op at index `n`.
    PostOpBinarySrc(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgUsage {
    Input,
    Output,
    Unused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Convolution,
    BatchNormalization,
    Matmul,
    Pooling,
    Reduction,
    Concat,
    Sum,
    Reorder,
}

impl OpKind {
    pub const ALL: [OpKind; 8] = [
        OpKind::Convolution,
        OpKind::BatchNormalization,
        OpKind::Matmul,
        OpKind::Pooling,
        OpKind::Reduction,
        OpKind::Concat,
        OpKind::Sum,
        OpKind::Reorder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Convolution => "convolution",
            OpKind::BatchNormalization => "batch_normalization",
            OpKind::Matmul => "matmul",
            OpKind::Pooling => "pooling",
            OpKind::Reduction => "reduction",
            OpKind::Concat => "concat",
            OpKind::Sum => "sum",
            OpKind::Reorder => "reorder",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    /// Backward pass producing both data and parameter gradients.
    Backward,
    BackwardData,
    BackwardWeights,
}

impl PropKind {
    pub fn is_forward(self) -> bool {
        matches!(self, PropKind::ForwardTraining | PropKind::ForwardInference)
    }
}

fn invalid(message: impl Into<String>) -> PrimitiveError {
    PrimitiveError::invalid_arguments(message)
}

fn require_concrete_type(what: &str, md: &MemoryDesc) -> PrimResult<()> {
    if md.is_zero() {
        return Err(invalid(format!("{what} descriptor is required")));
    }
    if md.data_type() == DataType::Undef {
        return Err(invalid(format!("{what} descriptor has no data type")));
    }
    Ok(())
}

fn default_accum_type(src: DataType) -> DataType {
    if src.is_int8() || src == DataType::S32 {
        DataType::S32
    } else {
        DataType::F32
    }
}

/// Output extent of a windowed spatial axis. Dilation is zero-based (0 = dense window).
fn windowed_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_l: usize,
    pad_r: usize,
) -> Option<usize> {
    let window = (kernel.checked_sub(1)?) * (dilation + 1) + 1;
    let span = (input + pad_l + pad_r).checked_sub(window)?;
    Some(span / stride + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvAlg {
    /// Lets the resolved implementation choose.
    Auto,
    Direct,
    Gemm,
    Winograd,
}

/// Convolution descriptor. `src`, `weights`, `bias` and `dst` are prop-kind invariant: for
/// backward-data `src` describes `diff_src`, for backward-weights `weights`/`bias` describe
/// the weight gradients, and every backward pass reads `dst` as `diff_dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvolutionDesc {
    pub prop_kind: PropKind,
    pub alg: ConvAlg,
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub bias: MemoryDesc,
    pub dst: MemoryDesc,
    pub strides: Dims,
    pub dilates: Dims,
    pub padding_l: Dims,
    pub padding_r: Dims,
    pub accum_data_type: DataType,
}

impl ConvolutionDesc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prop_kind: PropKind,
        alg: ConvAlg,
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
        strides: &[usize],
        dilates: &[usize],
        padding_l: &[usize],
        padding_r: &[usize],
    ) -> PrimResult<Self> {
        if prop_kind == PropKind::Backward {
            return Err(invalid(
                "convolution uses backward_data or backward_weights, not backward",
            ));
        }
        let desc = Self {
            prop_kind,
            alg,
            accum_data_type: default_accum_type(src.data_type()),
            src,
            weights,
            bias: bias.unwrap_or_default(),
            dst,
            strides: Dims::from_slice(strides),
            dilates: Dims::from_slice(dilates),
            padding_l: Dims::from_slice(padding_l),
            padding_r: Dims::from_slice(padding_r),
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn ndims(&self) -> usize {
        self.src.ndims()
    }

    pub fn with_groups(&self) -> bool {
        self.weights.ndims() == self.ndims() + 1
    }

    pub fn with_bias(&self) -> bool {
        !self.bias.is_zero()
    }

    pub fn groups(&self) -> usize {
        if self.with_groups() {
            self.weights.dims()[0]
        } else {
            1
        }
    }

    pub fn mb(&self) -> usize {
        self.src.dims()[0]
    }

    pub fn ic(&self) -> usize {
        self.src.dims()[1]
    }

    pub fn oc(&self) -> usize {
        self.dst.dims()[1]
    }

    /// Kernel extents over the spatial axes.
    pub fn kernel_dims(&self) -> &[usize] {
        let offset = 2 + usize::from(self.with_groups());
        &self.weights.dims()[offset..]
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("convolution src", &self.src)?;
        require_concrete_type("convolution weights", &self.weights)?;
        require_concrete_type("convolution dst", &self.dst)?;
        let ndims = self.ndims();
        if !(3..=5).contains(&ndims) {
            return Err(invalid(format!("convolution src rank {ndims} outside 3..=5")));
        }
        if self.dst.ndims() != ndims {
            return Err(invalid("convolution src and dst ranks differ"));
        }
        let with_groups = self.with_groups();
        if !with_groups && self.weights.ndims() != ndims {
            return Err(invalid("convolution weights rank does not match src"));
        }
        let spatial = ndims - 2;
        for (name, values) in [
            ("strides", &self.strides),
            ("dilates", &self.dilates),
            ("padding_l", &self.padding_l),
            ("padding_r", &self.padding_r),
        ] {
            if values.len() != spatial {
                return Err(invalid(format!(
                    "convolution {name} has {} entries, expected {spatial}",
                    values.len()
                )));
            }
        }
        if self.strides.iter().any(|&stride| stride == 0) {
            return Err(invalid("convolution strides must be positive"));
        }

        let g = self.groups();
        let wei = self.weights.dims();
        let (w_oc, w_ic) = if with_groups {
            (wei[1] * g, wei[2] * g)
        } else {
            (wei[0], wei[1])
        };
        if self.src.dims()[0] != self.dst.dims()[0] {
            return Err(invalid("convolution minibatch differs between src and dst"));
        }
        if w_oc != self.oc() || w_ic != self.ic() {
            return Err(invalid(format!(
                "convolution weights {}x{} do not match ic={} oc={}",
                w_oc,
                w_ic,
                self.ic(),
                self.oc()
            )));
        }
        if self.with_bias() && self.bias.dims() != [self.oc()] {
            return Err(invalid("convolution bias must be a vector of length oc"));
        }

        let kernel = self.kernel_dims();
        for axis in 0..spatial {
            let input = self.src.dims()[2 + axis];
            let output = self.dst.dims()[2 + axis];
            if input == 0 || output == 0 {
                continue;
            }
            let expected = windowed_extent(
                input,
                kernel[axis],
                self.strides[axis],
                self.dilates[axis],
                self.padding_l[axis],
                self.padding_r[axis],
            );
            if expected != Some(output) {
                return Err(invalid(format!(
                    "convolution spatial axis {axis}: output {output} inconsistent with input {input}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchNormFlags {
    pub use_global_stats: bool,
    pub use_scaleshift: bool,
    pub fuse_norm_relu: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchNormDesc {
    pub prop_kind: PropKind,
    pub data: MemoryDesc,
    pub diff_data: MemoryDesc,
    /// Mean/variance descriptor, `[C]` in f32.
    pub stat: MemoryDesc,
    /// Scale and shift stacked as `[2, C]` in f32.
    pub scaleshift: MemoryDesc,
    pub diff_scaleshift: MemoryDesc,
    pub epsilon: Scalar,
    pub flags: BatchNormFlags,
}

impl BatchNormDesc {
    pub fn new_forward(
        prop_kind: PropKind,
        data: MemoryDesc,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimResult<Self> {
        if !prop_kind.is_forward() {
            return Err(invalid("forward batch normalization needs a forward prop kind"));
        }
        Self::build(prop_kind, data, MemoryDesc::zero(), epsilon, flags)
    }

    pub fn new_backward(
        prop_kind: PropKind,
        diff_data: MemoryDesc,
        data: MemoryDesc,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimResult<Self> {
        if !matches!(prop_kind, PropKind::Backward | PropKind::BackwardData) {
            return Err(invalid(
                "backward batch normalization needs backward or backward_data",
            ));
        }
        Self::build(prop_kind, data, diff_data, epsilon, flags)
    }

    fn build(
        prop_kind: PropKind,
        data: MemoryDesc,
        diff_data: MemoryDesc,
        epsilon: f32,
        flags: BatchNormFlags,
    ) -> PrimResult<Self> {
        require_concrete_type("batch normalization data", &data)?;
        if data.ndims() < 2 {
            return Err(invalid("batch normalization data needs at least 2 dims"));
        }
        let channels = data.dims()[1];
        let stat = MemoryDesc::new(&[channels], DataType::F32, super::FormatTag::X)?;
        let scaleshift =
            MemoryDesc::new(&[2, channels], DataType::F32, super::FormatTag::Nc)?;
        let diff_scaleshift = if prop_kind == PropKind::Backward && flags.use_scaleshift {
            scaleshift.clone()
        } else {
            MemoryDesc::zero()
        };
        let desc = Self {
            prop_kind,
            data,
            diff_data,
            stat,
            scaleshift,
            diff_scaleshift,
            epsilon: epsilon.into(),
            flags,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn channels(&self) -> usize {
        self.data.dims()[1]
    }

    pub fn is_training(&self) -> bool {
        self.prop_kind == PropKind::ForwardTraining
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("batch normalization data", &self.data)?;
        if !self.prop_kind.is_forward() {
            require_concrete_type("batch normalization diff data", &self.diff_data)?;
            if self.diff_data.dims() != self.data.dims() {
                return Err(invalid("batch normalization diff data dims differ from data"));
            }
        }
        if !(self.epsilon.get() >= 0.0) {
            return Err(invalid("batch normalization epsilon must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulDesc {
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub bias: MemoryDesc,
    pub dst: MemoryDesc,
    pub accum_data_type: DataType,
}

impl MatmulDesc {
    pub fn new(
        src: MemoryDesc,
        weights: MemoryDesc,
        bias: Option<MemoryDesc>,
        dst: MemoryDesc,
    ) -> PrimResult<Self> {
        let desc = Self {
            accum_data_type: default_accum_type(src.data_type()),
            src,
            weights,
            bias: bias.unwrap_or_default(),
            dst,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn ndims(&self) -> usize {
        self.dst.ndims()
    }

    pub fn with_bias(&self) -> bool {
        !self.bias.is_zero()
    }

    pub fn batch(&self) -> usize {
        if self.ndims() == 3 {
            self.dst.dims()[0]
        } else {
            1
        }
    }

    pub fn m(&self) -> usize {
        self.dst.dims()[self.ndims() - 2]
    }

    pub fn n(&self) -> usize {
        self.dst.dims()[self.ndims() - 1]
    }

    pub fn k(&self) -> usize {
        self.src.dims()[self.ndims() - 1]
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("matmul src", &self.src)?;
        require_concrete_type("matmul weights", &self.weights)?;
        require_concrete_type("matmul dst", &self.dst)?;
        let ndims = self.dst.ndims();
        if !(2..=3).contains(&ndims)
            || self.src.ndims() != ndims
            || self.weights.ndims() != ndims
        {
            return Err(invalid("matmul operands must all be rank 2 or rank 3"));
        }
        let (src, wei, dst) = (self.src.dims(), self.weights.dims(), self.dst.dims());
        if src[ndims - 1] != wei[ndims - 2] {
            return Err(invalid(format!(
                "matmul K mismatch: src has {}, weights have {}",
                src[ndims - 1],
                wei[ndims - 2]
            )));
        }
        if src[ndims - 2] != dst[ndims - 2] || wei[ndims - 1] != dst[ndims - 1] {
            return Err(invalid("matmul dst dims do not match M x N"));
        }
        if ndims == 3 {
            let batch = dst[0];
            if (src[0] != batch && src[0] != 1) || (wei[0] != batch && wei[0] != 1) {
                return Err(invalid("matmul batch dims are not broadcast compatible"));
            }
        }
        if self.with_bias() {
            if self.bias.ndims() != ndims {
                return Err(invalid("matmul bias rank must match dst"));
            }
            let compatible = self
                .bias
                .dims()
                .iter()
                .zip(dst)
                .all(|(&b, &d)| b == d || b == 1);
            if !compatible {
                return Err(invalid("matmul bias is not broadcast compatible with dst"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingAlg {
    Max,
    AvgIncludePadding,
    AvgExcludePadding,
}

/// Pooling descriptor. For backward passes `src` describes `diff_src` and `dst` `diff_dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolingDesc {
    pub prop_kind: PropKind,
    pub alg: PoolingAlg,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub kernel: Dims,
    pub strides: Dims,
    pub dilation: Dims,
    pub padding_l: Dims,
    pub padding_r: Dims,
    pub accum_data_type: DataType,
}

impl PoolingDesc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prop_kind: PropKind,
        alg: PoolingAlg,
        src: MemoryDesc,
        dst: MemoryDesc,
        kernel: &[usize],
        strides: &[usize],
        padding_l: &[usize],
        padding_r: &[usize],
    ) -> PrimResult<Self> {
        if !matches!(
            prop_kind,
            PropKind::ForwardTraining | PropKind::ForwardInference | PropKind::BackwardData
        ) {
            return Err(invalid("pooling supports forward and backward_data only"));
        }
        let desc = Self {
            prop_kind,
            alg,
            accum_data_type: default_accum_type(src.data_type()),
            dilation: SmallVec::from_elem(0, kernel.len()),
            src,
            dst,
            kernel: Dims::from_slice(kernel),
            strides: Dims::from_slice(strides),
            padding_l: Dims::from_slice(padding_l),
            padding_r: Dims::from_slice(padding_r),
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn ndims(&self) -> usize {
        self.src.ndims()
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("pooling src", &self.src)?;
        require_concrete_type("pooling dst", &self.dst)?;
        let ndims = self.ndims();
        if !(3..=5).contains(&ndims) || self.dst.ndims() != ndims {
            return Err(invalid("pooling src/dst must share a rank in 3..=5"));
        }
        let spatial = ndims - 2;
        for (name, values) in [
            ("kernel", &self.kernel),
            ("strides", &self.strides),
            ("dilation", &self.dilation),
            ("padding_l", &self.padding_l),
            ("padding_r", &self.padding_r),
        ] {
            if values.len() != spatial {
                return Err(invalid(format!(
                    "pooling {name} has {} entries, expected {spatial}",
                    values.len()
                )));
            }
        }
        if self.strides.iter().chain(&self.kernel).any(|&v| v == 0) {
            return Err(invalid("pooling kernel and strides must be positive"));
        }
        if self.src.dims()[..2] != self.dst.dims()[..2] {
            return Err(invalid("pooling minibatch/channels differ between src and dst"));
        }
        for axis in 0..spatial {
            let input = self.src.dims()[2 + axis];
            let output = self.dst.dims()[2 + axis];
            if input == 0 || output == 0 {
                continue;
            }
            if self.padding_l[axis] >= self.kernel[axis] || self.padding_r[axis] >= self.kernel[axis]
            {
                return Err(invalid("pooling padding must be smaller than the kernel"));
            }
            let expected = windowed_extent(
                input,
                self.kernel[axis],
                self.strides[axis],
                self.dilation[axis],
                self.padding_l[axis],
                self.padding_r[axis],
            );
            if expected != Some(output) {
                return Err(invalid(format!(
                    "pooling spatial axis {axis}: output {output} inconsistent with input {input}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionAlg {
    Max,
    Min,
    Sum,
    Mul,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionDesc {
    pub alg: ReductionAlg,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub p: Scalar,
    pub eps: Scalar,
}

impl ReductionDesc {
    pub fn new(alg: ReductionAlg, src: MemoryDesc, dst: MemoryDesc) -> PrimResult<Self> {
        let desc = Self {
            alg,
            src,
            dst,
            p: Scalar(0.0),
            eps: Scalar(0.0),
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("reduction src", &self.src)?;
        require_concrete_type("reduction dst", &self.dst)?;
        if self.src.ndims() != self.dst.ndims() {
            return Err(invalid("reduction src and dst ranks differ"));
        }
        let ok = self
            .src
            .dims()
            .iter()
            .zip(self.dst.dims())
            .all(|(&s, &d)| s == d || d == 1);
        if !ok {
            return Err(invalid("reduction dst dims must equal src dims or be 1"));
        }
        Ok(())
    }

    /// Axes collapsed by the reduction.
    pub fn reduced_axes(&self) -> impl Iterator<Item = usize> + '_ {
        self.src
            .dims()
            .iter()
            .zip(self.dst.dims())
            .enumerate()
            .filter(|(_, (s, d))| s != d)
            .map(|(axis, _)| axis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcatDesc {
    pub dst: MemoryDesc,
    pub concat_dim: usize,
    pub srcs: Vec<MemoryDesc>,
}

impl ConcatDesc {
    /// Builds a concat descriptor; a missing `dst` is derived from the sources with format `any`.
    pub fn new(dst: Option<MemoryDesc>, concat_dim: usize, srcs: Vec<MemoryDesc>) -> PrimResult<Self> {
        let first = srcs
            .first()
            .ok_or_else(|| invalid("concat needs at least one source"))?;
        if concat_dim >= first.ndims() {
            return Err(invalid(format!(
                "concat axis {concat_dim} out of range for rank {}",
                first.ndims()
            )));
        }
        let concat_extent: usize = srcs.iter().map(|md| md.dims().get(concat_dim).copied().unwrap_or(0)).sum();
        let dst = match dst {
            Some(dst) => dst,
            None => {
                let mut dims = Dims::from_slice(first.dims());
                dims[concat_dim] = concat_extent;
                MemoryDesc::any(&dims, first.data_type())?
            }
        };
        let desc = Self {
            dst,
            concat_dim,
            srcs,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> PrimResult<()> {
        let first = self
            .srcs
            .first()
            .ok_or_else(|| invalid("concat needs at least one source"))?;
        let ndims = first.ndims();
        let mut extent = 0;
        for (index, src) in self.srcs.iter().enumerate() {
            require_concrete_type("concat src", src)?;
            if src.is_any() {
                return Err(invalid(format!("concat src {index} must have a concrete layout")));
            }
            if src.ndims() != ndims || src.data_type() != first.data_type() {
                return Err(invalid(format!("concat src {index} rank or data type differs")));
            }
            for axis in 0..ndims {
                if axis != self.concat_dim && src.dims()[axis] != first.dims()[axis] {
                    return Err(invalid(format!(
                        "concat src {index} differs from src 0 on axis {axis}"
                    )));
                }
            }
            extent += src.dims()[self.concat_dim];
        }
        require_concrete_type("concat dst", &self.dst)?;
        if self.dst.ndims() != ndims {
            return Err(invalid("concat dst rank differs from sources"));
        }
        for axis in 0..ndims {
            let expected = if axis == self.concat_dim {
                extent
            } else {
                first.dims()[axis]
            };
            if self.dst.dims()[axis] != expected {
                return Err(invalid(format!("concat dst axis {axis} should be {expected}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SumDesc {
    pub dst: MemoryDesc,
    pub scales: Vec<Scalar>,
    pub srcs: Vec<MemoryDesc>,
}

impl SumDesc {
    /// Builds a sum descriptor; a missing `dst` is derived from source 0 with format `any`.
    pub fn new(dst: Option<MemoryDesc>, scales: &[f32], srcs: Vec<MemoryDesc>) -> PrimResult<Self> {
        let first = srcs
            .first()
            .ok_or_else(|| invalid("sum needs at least one source"))?;
        let dst = match dst {
            Some(dst) => dst,
            None => first.to_any(),
        };
        let desc = Self {
            dst,
            scales: scales.iter().copied().map(Scalar).collect(),
            srcs,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> PrimResult<()> {
        if self.srcs.is_empty() {
            return Err(invalid("sum needs at least one source"));
        }
        if self.scales.len() != self.srcs.len() {
            return Err(invalid(format!(
                "sum has {} scales for {} sources",
                self.scales.len(),
                self.srcs.len()
            )));
        }
        require_concrete_type("sum dst", &self.dst)?;
        for (index, src) in self.srcs.iter().enumerate() {
            require_concrete_type("sum src", src)?;
            if src.is_any() {
                return Err(invalid(format!("sum src {index} must have a concrete layout")));
            }
            if src.dims() != self.dst.dims() {
                return Err(invalid(format!("sum src {index} dims differ from dst")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReorderDesc {
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
}

impl ReorderDesc {
    pub fn new(src: MemoryDesc, dst: MemoryDesc) -> PrimResult<Self> {
        let desc = Self { src, dst };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> PrimResult<()> {
        require_concrete_type("reorder src", &self.src)?;
        require_concrete_type("reorder dst", &self.dst)?;
        if self.src.is_any() || self.dst.is_any() {
            return Err(invalid("reorder operands must have concrete layouts"));
        }
        if self.src.dims() != self.dst.dims() {
            return Err(invalid("reorder src and dst dims differ"));
        }
        Ok(())
    }
}

/// Immutable description of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpDesc {
    Convolution(ConvolutionDesc),
    BatchNormalization(BatchNormDesc),
    Matmul(MatmulDesc),
    Pooling(PoolingDesc),
    Reduction(ReductionDesc),
    Concat(ConcatDesc),
    Sum(SumDesc),
    Reorder(ReorderDesc),
}

impl OpDesc {
    pub fn kind(&self) -> OpKind {
        match self {
            OpDesc::Convolution(_) => OpKind::Convolution,
            OpDesc::BatchNormalization(_) => OpKind::BatchNormalization,
            OpDesc::Matmul(_) => OpKind::Matmul,
            OpDesc::Pooling(_) => OpKind::Pooling,
            OpDesc::Reduction(_) => OpKind::Reduction,
            OpDesc::Concat(_) => OpKind::Concat,
            OpDesc::Sum(_) => OpKind::Sum,
            OpDesc::Reorder(_) => OpKind::Reorder,
        }
    }

    pub fn prop_kind(&self) -> PropKind {
        match self {
            OpDesc::Convolution(desc) => desc.prop_kind,
            OpDesc::BatchNormalization(desc) => desc.prop_kind,
            OpDesc::Pooling(desc) => desc.prop_kind,
            OpDesc::Matmul(_)
            | OpDesc::Reduction(_)
            | OpDesc::Concat(_)
            | OpDesc::Sum(_)
            | OpDesc::Reorder(_) => PropKind::ForwardInference,
        }
    }

    /// Re-checks construction invariants; descriptors are plain values and may have been edited.
    pub fn validate(&self) -> PrimResult<()> {
        match self {
            OpDesc::Convolution(desc) => desc.validate(),
            OpDesc::BatchNormalization(desc) => desc.validate(),
            OpDesc::Matmul(desc) => desc.validate(),
            OpDesc::Pooling(desc) => desc.validate(),
            OpDesc::Reduction(desc) => desc.validate(),
            OpDesc::Concat(desc) => desc.validate(),
            OpDesc::Sum(desc) => desc.validate(),
            OpDesc::Reorder(desc) => desc.validate(),
        }
    }

    /// Structural hash of the descriptor, stable within a process.
    pub fn fingerprint(&self) -> u64 {
        crate::hashing::hash_value(self)
    }

    /// `true` when the operation has no work to do because an operand has a zero extent.
    pub fn has_zero_dim_memory(&self) -> bool {
        match self {
            OpDesc::Convolution(desc) => desc.src.has_zero_dim() || desc.dst.has_zero_dim(),
            OpDesc::BatchNormalization(desc) => desc.data.has_zero_dim(),
            OpDesc::Matmul(desc) => {
                desc.src.has_zero_dim() || desc.weights.has_zero_dim() || desc.dst.has_zero_dim()
            }
            OpDesc::Pooling(desc) => desc.src.has_zero_dim() || desc.dst.has_zero_dim(),
            OpDesc::Reduction(desc) => desc.src.has_zero_dim() || desc.dst.has_zero_dim(),
            OpDesc::Concat(desc) => desc.dst.has_zero_dim(),
            OpDesc::Sum(desc) => desc.dst.has_zero_dim(),
            OpDesc::Reorder(desc) => desc.src.has_zero_dim() || desc.dst.has_zero_dim(),
        }
    }

    /// Source/destination element types used to pick a type-pair keyed candidate list.
    pub fn type_pair(&self) -> Option<(DataType, DataType)> {
        match self {
            OpDesc::Reorder(desc) => Some((desc.src.data_type(), desc.dst.data_type())),
            _ => None,
        }
    }

    pub fn as_convolution(&self) -> Option<&ConvolutionDesc> {
        match self {
            OpDesc::Convolution(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_batch_normalization(&self) -> Option<&BatchNormDesc> {
        match self {
            OpDesc::BatchNormalization(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_matmul(&self) -> Option<&MatmulDesc> {
        match self {
            OpDesc::Matmul(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_pooling(&self) -> Option<&PoolingDesc> {
        match self {
            OpDesc::Pooling(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_reduction(&self) -> Option<&ReductionDesc> {
        match self {
            OpDesc::Reduction(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_concat(&self) -> Option<&ConcatDesc> {
        match self {
            OpDesc::Concat(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_sum(&self) -> Option<&SumDesc> {
        match self {
            OpDesc::Sum(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_reorder(&self) -> Option<&ReorderDesc> {
        match self {
            OpDesc::Reorder(desc) => Some(desc),
            _ => None,
        }
    }
}

macro_rules! impl_from_desc {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for OpDesc {
                fn from(desc: $ty) -> Self {
                    OpDesc::$variant(desc)
                }
            }
        )+
    };
}

impl_from_desc! {
    Convolution => ConvolutionDesc,
    BatchNormalization => BatchNormDesc,
    Matmul => MatmulDesc,
    Pooling => PoolingDesc,
    Reduction => ReductionDesc,
    Concat => ConcatDesc,
    Sum => SumDesc,
    Reorder => ReorderDesc,
}
