//! Argument maps handed to execution and the per-kind argument classification.

use std::collections::BTreeMap;

use super::scratchpad::{ScratchpadGrantor, ScratchpadKey};
use crate::desc::{
    Arg, ArgUsage, BatchNormDesc, ConvolutionDesc, DataType, FormatTag, MemoryDesc, OpDesc,
    PostOp, PrimitiveAttr, PropKind, ScratchpadMode,
};
use crate::error::{PrimResult, PrimitiveError};
use crate::memory::Memory;

/// Caller-populated map from argument slot to memory.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    args: BTreeMap<Arg, Memory>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, arg: Arg, memory: Memory) -> Self {
        self.insert(arg, memory);
        self
    }

    pub fn insert(&mut self, arg: Arg, memory: Memory) {
        self.args.insert(arg, memory);
    }

    pub fn get(&self, arg: Arg) -> Option<&Memory> {
        self.args.get(&arg)
    }

    pub fn contains(&self, arg: Arg) -> bool {
        self.args.contains_key(&arg)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// What a kernel sees during one execution.
pub struct ExecContext<'a> {
    args: &'a ExecArgs,
    scratchpad: ScratchpadGrantor<'a>,
}

impl<'a> ExecContext<'a> {
    pub fn new(args: &'a ExecArgs, scratchpad: ScratchpadGrantor<'a>) -> Self {
        Self { args, scratchpad }
    }

    pub fn memory(&self, arg: Arg) -> PrimResult<&'a Memory> {
        self.args.get(arg).ok_or_else(|| {
            PrimitiveError::execution(format!("argument {arg:?} missing at execution"))
        })
    }

    /// Optional arguments such as a bias or a post-op operand.
    pub fn optional_memory(&self, arg: Arg) -> Option<&'a Memory> {
        self.args.get(arg)
    }

    pub fn scratchpad(&mut self, key: ScratchpadKey) -> PrimResult<&mut [u8]> {
        self.scratchpad.get(key)
    }
}

/// One classified argument slot of a resolved descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSlot {
    pub usage: ArgUsage,
    pub desc: MemoryDesc,
}

fn push(slots: &mut BTreeMap<Arg, ArgSlot>, arg: Arg, usage: ArgUsage, desc: &MemoryDesc) {
    slots.insert(
        arg,
        ArgSlot {
            usage,
            desc: desc.clone(),
        },
    );
}

fn convolution_args(desc: &ConvolutionDesc, slots: &mut BTreeMap<Arg, ArgSlot>) {
    use ArgUsage::{Input, Output};
    match desc.prop_kind {
        PropKind::BackwardData => {
            push(slots, Arg::DiffDst, Input, &desc.dst);
            push(slots, Arg::Weights, Input, &desc.weights);
            push(slots, Arg::DiffSrc, Output, &desc.src);
        }
        PropKind::BackwardWeights => {
            push(slots, Arg::Src, Input, &desc.src);
            push(slots, Arg::DiffDst, Input, &desc.dst);
            push(slots, Arg::DiffWeights, Output, &desc.weights);
            if desc.with_bias() {
                push(slots, Arg::DiffBias, Output, &desc.bias);
            }
        }
        _ => {
            push(slots, Arg::Src, Input, &desc.src);
            push(slots, Arg::Weights, Input, &desc.weights);
            if desc.with_bias() {
                push(slots, Arg::Bias, Input, &desc.bias);
            }
            push(slots, Arg::Dst, Output, &desc.dst);
        }
    }
}

fn batch_norm_args(desc: &BatchNormDesc, slots: &mut BTreeMap<Arg, ArgSlot>) {
    use ArgUsage::{Input, Output};
    if desc.prop_kind.is_forward() {
        push(slots, Arg::Src, Input, &desc.data);
        push(slots, Arg::Dst, Output, &desc.data);
        if desc.flags.use_global_stats {
            push(slots, Arg::Mean, Input, &desc.stat);
            push(slots, Arg::Variance, Input, &desc.stat);
        } else if desc.is_training() {
            push(slots, Arg::Mean, Output, &desc.stat);
            push(slots, Arg::Variance, Output, &desc.stat);
        }
        if desc.flags.use_scaleshift {
            push(slots, Arg::ScaleShift, Input, &desc.scaleshift);
        }
    } else {
        push(slots, Arg::Src, Input, &desc.data);
        push(slots, Arg::Mean, Input, &desc.stat);
        push(slots, Arg::Variance, Input, &desc.stat);
        push(slots, Arg::DiffDst, Input, &desc.diff_data);
        if desc.flags.use_scaleshift {
            push(slots, Arg::ScaleShift, Input, &desc.scaleshift);
        }
        push(slots, Arg::DiffSrc, Output, &desc.diff_data);
        if !desc.diff_scaleshift.is_zero() {
            push(slots, Arg::DiffScaleShift, Output, &desc.diff_scaleshift);
        }
    }
}

/// Argument slots implied by a finalized descriptor and its attributes. The workspace and a
/// user-mode scratchpad are included when the resolved implementation asked for them.
pub fn classify_args(
    desc: &OpDesc,
    attr: &PrimitiveAttr,
    workspace: &MemoryDesc,
    scratchpad_size: usize,
) -> BTreeMap<Arg, ArgSlot> {
    use ArgUsage::{Input, Output};
    let mut slots = BTreeMap::new();
    match desc {
        OpDesc::Convolution(conv) => convolution_args(conv, &mut slots),
        OpDesc::BatchNormalization(bnorm) => batch_norm_args(bnorm, &mut slots),
        OpDesc::Matmul(matmul) => {
            push(&mut slots, Arg::Src, Input, &matmul.src);
            push(&mut slots, Arg::Weights, Input, &matmul.weights);
            if matmul.with_bias() {
                push(&mut slots, Arg::Bias, Input, &matmul.bias);
            }
            push(&mut slots, Arg::Dst, Output, &matmul.dst);
        }
        OpDesc::Pooling(pool) => {
            if pool.prop_kind.is_forward() {
                push(&mut slots, Arg::Src, Input, &pool.src);
                push(&mut slots, Arg::Dst, Output, &pool.dst);
            } else {
                push(&mut slots, Arg::DiffDst, Input, &pool.dst);
                push(&mut slots, Arg::DiffSrc, Output, &pool.src);
            }
        }
        OpDesc::Reduction(reduction) => {
            push(&mut slots, Arg::Src, Input, &reduction.src);
            push(&mut slots, Arg::Dst, Output, &reduction.dst);
        }
        OpDesc::Concat(concat) => {
            for (index, src) in concat.srcs.iter().enumerate() {
                push(&mut slots, Arg::MultipleSrc(index as u16), Input, src);
            }
            push(&mut slots, Arg::Dst, Output, &concat.dst);
        }
        OpDesc::Sum(sum) => {
            for (index, src) in sum.srcs.iter().enumerate() {
                push(&mut slots, Arg::MultipleSrc(index as u16), Input, src);
            }
            push(&mut slots, Arg::Dst, Output, &sum.dst);
        }
        OpDesc::Reorder(reorder) => {
            push(&mut slots, Arg::Src, Input, &reorder.src);
            push(&mut slots, Arg::Dst, Output, &reorder.dst);
        }
    }

    for (index, post_op) in attr.post_ops().entries().iter().enumerate() {
        if let PostOp::Binary { src1, .. } = post_op {
            push(&mut slots, Arg::PostOpBinarySrc(index as u16), Input, src1);
        }
    }

    if !workspace.is_zero() {
        let usage = if desc.prop_kind().is_forward() {
            Output
        } else {
            Input
        };
        push(&mut slots, Arg::Workspace, usage, workspace);
    }

    if scratchpad_size > 0 && attr.scratchpad_mode() == ScratchpadMode::User {
        if let Ok(md) = MemoryDesc::new(&[scratchpad_size], DataType::U8, FormatTag::X) {
            push(&mut slots, Arg::Scratchpad, Input, &md);
        }
    }
    slots
}
