//! Primitive attributes: post-ops, scaling, zero points and scratchpad ownership.
//!
//! Attributes are immutable once built and participate in cache keys by value.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::memory::MemoryDesc;
use super::op::Arg;
use crate::error::{PrimResult, PrimitiveError};

/// `f32` compared and hashed by bit pattern so descriptors can be used as map keys.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scalar(pub f32);

impl Scalar {
    pub fn get(self) -> f32 {
        self.0
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EltwiseAlg {
    Relu,
    Tanh,
    Elu,
    Square,
    Abs,
    Sqrt,
    Linear,
    BoundedRelu,
    Logistic,
    Exp,
    Gelu,
    Swish,
}

impl EltwiseAlg {
    /// Whether `f(0) == 0`, i.e. zero padding in a blocked destination survives the post-op.
    pub fn preserves_zero(self, beta: f32) -> bool {
        match self {
            EltwiseAlg::Relu
            | EltwiseAlg::Tanh
            | EltwiseAlg::Elu
            | EltwiseAlg::Square
            | EltwiseAlg::Abs
            | EltwiseAlg::Sqrt
            | EltwiseAlg::BoundedRelu
            | EltwiseAlg::Gelu
            | EltwiseAlg::Swish => true,
            EltwiseAlg::Linear => beta == 0.0,
            EltwiseAlg::Logistic | EltwiseAlg::Exp => false,
        }
    }

    pub fn apply(self, x: f32, alpha: f32, beta: f32) -> f32 {
        match self {
            EltwiseAlg::Relu => {
                if x > 0.0 {
                    x
                } else {
                    x * alpha
                }
            }
            EltwiseAlg::Tanh => x.tanh(),
            EltwiseAlg::Elu => {
                if x > 0.0 {
                    x
                } else {
                    alpha * (x.exp() - 1.0)
                }
            }
            EltwiseAlg::Square => x * x,
            EltwiseAlg::Abs => x.abs(),
            EltwiseAlg::Sqrt => x.sqrt(),
            EltwiseAlg::Linear => alpha * x + beta,
            EltwiseAlg::BoundedRelu => x.max(0.0).min(alpha),
            EltwiseAlg::Logistic => 1.0 / (1.0 + (-x).exp()),
            EltwiseAlg::Exp => x.exp(),
            EltwiseAlg::Gelu => {
                let k = (2.0f32 / std::f32::consts::PI).sqrt();
                0.5 * x * (1.0 + (k * (x + 0.044715 * x * x * x)).tanh())
            }
            EltwiseAlg::Swish => x / (1.0 + (-alpha * x).exp()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryAlg {
    Add,
    Mul,
    Max,
    Min,
}

impl BinaryAlg {
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryAlg::Add => lhs + rhs,
            BinaryAlg::Mul => lhs * rhs,
            BinaryAlg::Max => lhs.max(rhs),
            BinaryAlg::Min => lhs.min(rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostOp {
    Eltwise {
        alg: EltwiseAlg,
        alpha: Scalar,
        beta: Scalar,
        scale: Scalar,
    },
    Sum {
        scale: Scalar,
    },
    Binary {
        alg: BinaryAlg,
        src1: MemoryDesc,
    },
}

impl PostOp {
    pub fn is_eltwise(&self) -> bool {
        matches!(self, PostOp::Eltwise { .. })
    }

    pub fn is_sum(&self) -> bool {
        matches!(self, PostOp::Sum { .. })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, PostOp::Binary { .. })
    }

    /// Plain relu (`alpha == 0`, unit scale).
    pub fn is_relu(&self) -> bool {
        matches!(
            self,
            PostOp::Eltwise { alg: EltwiseAlg::Relu, alpha, scale, .. }
                if alpha.get() == 0.0 && scale.get() == 1.0
        )
    }
}

/// `true` for eltwise post-ops that map zero to zero, so padded lanes of a blocked destination
/// stay zero after the chain runs.
pub fn eltwise_preserves_zero(post_op: &PostOp) -> bool {
    match post_op {
        PostOp::Eltwise { alg, beta, .. } => alg.preserves_zero(beta.get()),
        PostOp::Sum { .. } | PostOp::Binary { .. } => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostOps {
    entries: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_eltwise(mut self, scale: f32, alg: EltwiseAlg, alpha: f32, beta: f32) -> Self {
        self.entries.push(PostOp::Eltwise {
            alg,
            alpha: alpha.into(),
            beta: beta.into(),
            scale: scale.into(),
        });
        self
    }

    pub fn append_sum(mut self, scale: f32) -> Self {
        self.entries.push(PostOp::Sum {
            scale: scale.into(),
        });
        self
    }

    pub fn append_binary(mut self, alg: BinaryAlg, src1: MemoryDesc) -> Self {
        self.entries.push(PostOp::Binary { alg, src1 });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PostOp] {
        &self.entries
    }

    pub fn find(&self, predicate: impl Fn(&PostOp) -> bool) -> Option<usize> {
        self.entries.iter().position(predicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputScales {
    /// Bit `d` set means scales vary along output axis `d`.
    pub mask: u32,
    pub scales: Vec<Scalar>,
}

impl Default for OutputScales {
    fn default() -> Self {
        Self {
            mask: 0,
            scales: vec![Scalar(1.0)],
        }
    }
}

impl OutputScales {
    pub fn is_default(&self) -> bool {
        self.mask == 0 && self.scales.len() == 1 && self.scales[0].get() == 1.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScratchpadMode {
    /// The stream provides scratch memory for every execution.
    #[default]
    Library,
    /// The caller passes scratch memory as [`Arg::Scratchpad`].
    User,
}

/// Mask of attribute components a candidate tolerates when checking for default values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrSkip(u32);

impl AttrSkip {
    pub const NONE: AttrSkip = AttrSkip(0);
    pub const POST_OPS: AttrSkip = AttrSkip(1);
    pub const OUTPUT_SCALES: AttrSkip = AttrSkip(1 << 1);
    pub const ZERO_POINTS: AttrSkip = AttrSkip(1 << 2);

    pub fn contains(self, other: AttrSkip) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AttrSkip {
    type Output = AttrSkip;

    fn bitor(self, rhs: Self) -> Self::Output {
        AttrSkip(self.0 | rhs.0)
    }
}

/// Side-channel modifiers attached to a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimitiveAttr {
    post_ops: PostOps,
    output_scales: OutputScales,
    zero_points: Vec<(Arg, i32)>,
    scratchpad_mode: ScratchpadMode,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_ops(mut self, post_ops: PostOps) -> Self {
        self.post_ops = post_ops;
        self
    }

    pub fn with_output_scales(mut self, mask: u32, scales: Vec<f32>) -> PrimResult<Self> {
        if scales.is_empty() {
            return Err(PrimitiveError::invalid_arguments(
                "output scales must not be empty",
            ));
        }
        if mask == 0 && scales.len() != 1 {
            return Err(PrimitiveError::invalid_arguments(
                "common output scale mask requires exactly one scale",
            ));
        }
        self.output_scales = OutputScales {
            mask,
            scales: scales.into_iter().map(Scalar).collect(),
        };
        Ok(self)
    }

    pub fn with_zero_point(mut self, arg: Arg, zero_point: i32) -> Self {
        self.zero_points.retain(|(existing, _)| *existing != arg);
        if zero_point != 0 {
            self.zero_points.push((arg, zero_point));
            self.zero_points.sort_by_key(|(arg, _)| *arg);
        }
        self
    }

    pub fn with_scratchpad_mode(mut self, mode: ScratchpadMode) -> Self {
        self.scratchpad_mode = mode;
        self
    }

    pub fn post_ops(&self) -> &PostOps {
        &self.post_ops
    }

    pub fn output_scales(&self) -> &OutputScales {
        &self.output_scales
    }

    pub fn zero_point(&self, arg: Arg) -> i32 {
        self.zero_points
            .iter()
            .find(|(existing, _)| *existing == arg)
            .map_or(0, |(_, zero_point)| *zero_point)
    }

    pub fn scratchpad_mode(&self) -> ScratchpadMode {
        self.scratchpad_mode
    }

    /// `true` when every component not named in `skip` holds its default value.
    pub fn has_default_values(&self, skip: AttrSkip) -> bool {
        (skip.contains(AttrSkip::POST_OPS) || self.post_ops.is_empty())
            && (skip.contains(AttrSkip::OUTPUT_SCALES) || self.output_scales.is_default())
            && (skip.contains(AttrSkip::ZERO_POINTS) || self.zero_points.is_empty())
    }
}
