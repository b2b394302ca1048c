//! Descriptor model: what an operation computes, independent of how it is implemented.

pub mod attr;
pub mod memory;
pub mod op;

pub use attr::{
    eltwise_preserves_zero, AttrSkip, BinaryAlg, EltwiseAlg, OutputScales, PostOp, PostOps,
    PrimitiveAttr, Scalar, ScratchpadMode,
};
pub use memory::{
    BlockingDesc, DataType, Dims, Format, FormatTag, InnerBlock, MemoryDesc, MAX_NDIMS,
};
pub use op::{
    Arg, ArgUsage, BatchNormDesc, BatchNormFlags, ConcatDesc, ConvAlg, ConvolutionDesc,
    MatmulDesc, OpDesc, OpKind, PoolingAlg, PoolingDesc, PropKind, ReductionAlg, ReductionDesc,
    ReorderDesc, SumDesc,
};
