use std::sync::Arc;

use prim_rs::desc::{
    Arg, BatchNormDesc, BatchNormFlags, ConcatDesc, ConvAlg, ConvolutionDesc, DataType,
    EltwiseAlg, FormatTag, MatmulDesc, MemoryDesc, OpDesc, PoolingAlg, PoolingDesc, PostOps,
    PrimitiveAttr, PropKind, ReductionAlg, ReductionDesc, ReorderDesc, ScratchpadMode, SumDesc,
};
use prim_rs::primitive::{ExecArgs, Primitive, ScratchpadKey};
use prim_rs::{resolve_uncached, EngineRef, Memory, PrimResult, Status, SyncStream};
use prim_rs_backend_ref_cpu::CpuEngine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Harness {
    engine: EngineRef,
}

impl Harness {
    fn new() -> Self {
        Self {
            engine: CpuEngine::shared(),
        }
    }

    fn resolve(&self, desc: impl Into<OpDesc>, attr: PrimitiveAttr) -> PrimResult<Arc<Primitive>> {
        self.resolve_with_hint(desc, attr, None)
    }

    fn resolve_with_hint(
        &self,
        desc: impl Into<OpDesc>,
        attr: PrimitiveAttr,
        hint: Option<&Arc<Primitive>>,
    ) -> PrimResult<Arc<Primitive>> {
        let desc = Arc::new(desc.into());
        let attr = Arc::new(attr);
        resolve_uncached(&desc, &attr, &self.engine, hint.map(|primitive| primitive.pd()))
    }

    fn run(&self, primitive: &Primitive, args: &ExecArgs) -> PrimResult<()> {
        let stream = self.engine.create_stream()?;
        primitive.execute(stream.as_ref(), args)
    }
}

fn md(dims: &[usize], tag: FormatTag) -> MemoryDesc {
    MemoryDesc::new(dims, DataType::F32, tag).unwrap()
}

/// Allocates the slot `arg` of `primitive`, filled with `values` when given.
fn bind(primitive: &Primitive, arg: Arg, values: Option<&[f32]>) -> Memory {
    let desc = primitive.pd().arg_md(arg);
    match values {
        Some(values) => Memory::from_f32(&desc, values).unwrap(),
        None => Memory::new(&desc).unwrap(),
    }
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} vs {expected:?}");
    }
}

fn conv_3x3_by_2x2(prop_kind: PropKind, src_tag: FormatTag, bias: bool) -> ConvolutionDesc {
    ConvolutionDesc::new(
        prop_kind,
        ConvAlg::Direct,
        md(&[1, 1, 3, 3], src_tag),
        md(&[1, 1, 2, 2], FormatTag::OIHW),
        bias.then(|| md(&[1], FormatTag::X)),
        md(&[1, 1, 2, 2], FormatTag::Nchw),
        &[1, 1],
        &[0, 0],
        &[0, 0],
        &[0, 0],
    )
    .unwrap()
}

const IMAGE: [f32; 9] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];

#[test]
fn matmul_f32_uses_gemm_and_broadcasts_bias() {
    let h = Harness::new();
    let desc = MatmulDesc::new(
        md(&[2, 3], FormatTag::Nc),
        md(&[3, 2], FormatTag::Nc),
        Some(md(&[1, 2], FormatTag::Nc)),
        MemoryDesc::any(&[2, 2], DataType::F32).unwrap(),
    )
    .unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    assert_eq!(primitive.impl_name(), "gemm:f32");

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])))
        .with(
            Arg::Weights,
            bind(&primitive, Arg::Weights, Some(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0])),
        )
        .with(Arg::Bias, bind(&primitive, Arg::Bias, Some(&[10.0, 20.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[14.0, 25.0, 20.0, 31.0]);
}

#[test]
fn matmul_int8_applies_zero_points_in_reference_kernel() {
    let h = Harness::new();
    let s8 = |dims: &[usize]| MemoryDesc::new(dims, DataType::S8, FormatTag::Nc).unwrap();
    let desc = MatmulDesc::new(s8(&[1, 2]), s8(&[2, 1]), None, md(&[1, 1], FormatTag::Nc)).unwrap();
    let attr = PrimitiveAttr::new().with_zero_point(Arg::Src, 1);
    let primitive = h.resolve(desc, attr).unwrap();
    assert_eq!(primitive.impl_name(), "ref:any");

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[3.0, 4.0])))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&[2.0, 1.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[7.0]);
}

#[test]
fn conv_forward_lowers_to_gemm_with_column_scratchpad() {
    let h = Harness::new();
    let primitive = h
        .resolve(conv_3x3_by_2x2(PropKind::ForwardInference, FormatTag::Nchw, true), PrimitiveAttr::new())
        .unwrap();
    assert_eq!(primitive.impl_name(), "gemm:f32");
    // ic * kernel volume * output spatial * sizeof(f32)
    let registry = primitive.pd().scratchpad_registry();
    assert_eq!(registry.entry(ScratchpadKey::ConvColumns).map(|e| e.size), Some(64));

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&IMAGE)))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&[1.0; 4])))
        .with(Arg::Bias, bind(&primitive, Arg::Bias, Some(&[0.5])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[12.5, 16.5, 24.5, 28.5]);
}

#[test]
fn conv_channels_last_src_falls_back_to_direct_kernel() {
    let h = Harness::new();
    let post_ops = PostOps::new()
        .append_eltwise(1.0, EltwiseAlg::Linear, -1.0, 0.0)
        .append_eltwise(1.0, EltwiseAlg::Relu, 0.0, 0.0);
    let attr = PrimitiveAttr::new().with_post_ops(post_ops);
    let primitive = h
        .resolve(conv_3x3_by_2x2(PropKind::ForwardInference, FormatTag::Nhwc, false), attr)
        .unwrap();
    assert_eq!(primitive.impl_name(), "ref:direct");

    let dst = bind(&primitive, Arg::Dst, None);
    let mut weights = [0.0; 4];
    weights[0] = 1.0;
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&IMAGE)))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&weights)))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    // Negated by the linear post-op, then clamped by relu.
    assert_close(&dst.read_f32(), &[0.0; 4]);
}

#[test]
fn conv_sum_post_op_accumulates_into_dst() {
    let h = Harness::new();
    let attr = PrimitiveAttr::new().with_post_ops(PostOps::new().append_sum(2.0));
    let primitive = h
        .resolve(conv_3x3_by_2x2(PropKind::ForwardInference, FormatTag::Nchw, false), attr)
        .unwrap();
    let dst = bind(&primitive, Arg::Dst, Some(&[1.0, 1.0, 1.0, 1.0]));
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&IMAGE)))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&[1.0; 4])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[14.0, 18.0, 26.0, 30.0]);
}

#[test]
fn conv_backward_data_and_weights() {
    let h = Harness::new();
    let bwd_data = h
        .resolve(conv_3x3_by_2x2(PropKind::BackwardData, FormatTag::Nchw, false), PrimitiveAttr::new())
        .unwrap();
    assert_eq!(bwd_data.impl_name(), "ref:direct");
    let diff_src = bind(&bwd_data, Arg::DiffSrc, None);
    let args = ExecArgs::new()
        .with(Arg::DiffDst, bind(&bwd_data, Arg::DiffDst, Some(&[1.0; 4])))
        .with(Arg::Weights, bind(&bwd_data, Arg::Weights, Some(&[1.0; 4])))
        .with(Arg::DiffSrc, diff_src.clone());
    h.run(&bwd_data, &args).unwrap();
    assert_close(
        &diff_src.read_f32(),
        &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0],
    );

    let bwd_weights = h
        .resolve(conv_3x3_by_2x2(PropKind::BackwardWeights, FormatTag::Nchw, true), PrimitiveAttr::new())
        .unwrap();
    let diff_weights = bind(&bwd_weights, Arg::DiffWeights, None);
    let diff_bias = bind(&bwd_weights, Arg::DiffBias, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&bwd_weights, Arg::Src, Some(&IMAGE)))
        .with(Arg::DiffDst, bind(&bwd_weights, Arg::DiffDst, Some(&[1.0; 4])))
        .with(Arg::DiffWeights, diff_weights.clone())
        .with(Arg::DiffBias, diff_bias.clone());
    h.run(&bwd_weights, &args).unwrap();
    assert_close(&diff_weights.read_f32(), &[12.0, 16.0, 24.0, 28.0]);
    assert_close(&diff_bias.read_f32(), &[4.0]);
}

#[test]
fn winograd_is_not_provided() {
    let h = Harness::new();
    let mut desc = conv_3x3_by_2x2(PropKind::ForwardInference, FormatTag::Nchw, false);
    desc.alg = ConvAlg::Winograd;
    let err = h.resolve(desc, PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented(), "{err}");
}

#[test]
fn batch_norm_training_writes_statistics() {
    let h = Harness::new();
    let flags = BatchNormFlags {
        use_scaleshift: true,
        ..Default::default()
    };
    let desc = BatchNormDesc::new_forward(
        PropKind::ForwardTraining,
        md(&[1, 2, 1, 2], FormatTag::Nchw),
        0.0,
        flags,
    )
    .unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    assert_eq!(primitive.pd().scratchpad_size(), 0);

    let (dst, mean, variance) = (
        bind(&primitive, Arg::Dst, None),
        bind(&primitive, Arg::Mean, None),
        bind(&primitive, Arg::Variance, None),
    );
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 3.0, 2.0, 6.0])))
        .with(
            Arg::ScaleShift,
            bind(&primitive, Arg::ScaleShift, Some(&[2.0, 1.0, 0.0, 1.0])),
        )
        .with(Arg::Dst, dst.clone())
        .with(Arg::Mean, mean.clone())
        .with(Arg::Variance, variance.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&mean.read_f32(), &[2.0, 4.0]);
    assert_close(&variance.read_f32(), &[1.0, 4.0]);
    assert_close(&dst.read_f32(), &[-2.0, 2.0, 0.0, 2.0]);
}

#[test]
fn batch_norm_inference_books_statistics_scratchpad() {
    let h = Harness::new();
    let desc = BatchNormDesc::new_forward(
        PropKind::ForwardInference,
        md(&[2, 3, 2, 2], FormatTag::Nchw),
        1e-5,
        BatchNormFlags::default(),
    )
    .unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    let entry = primitive
        .pd()
        .scratchpad_registry()
        .entry(ScratchpadKey::BatchNormStats)
        .copied();
    assert_eq!(entry.map(|e| e.size), Some(2 * 3 * 4));
    assert_eq!(primitive.pd().arg_md(Arg::Mean), MemoryDesc::zero());
}

#[test]
fn fused_relu_backward_needs_forward_workspace() {
    let h = Harness::new();
    let flags = BatchNormFlags {
        fuse_norm_relu: true,
        ..Default::default()
    };
    let data = md(&[1, 1, 1, 4], FormatTag::Nchw);
    let forward = h
        .resolve(
            BatchNormDesc::new_forward(PropKind::ForwardTraining, data.clone(), 0.0, flags).unwrap(),
            PrimitiveAttr::new(),
        )
        .unwrap();
    assert_eq!(forward.pd().workspace_md().data_type(), DataType::U8);

    let backward_desc =
        BatchNormDesc::new_backward(PropKind::BackwardData, data.clone(), data, 0.0, flags).unwrap();
    let err = h.resolve(backward_desc.clone(), PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented());

    let backward = h
        .resolve_with_hint(backward_desc, PrimitiveAttr::new(), Some(&forward))
        .unwrap();
    assert_eq!(backward.pd().workspace_md(), forward.pd().workspace_md());

    let workspace = bind(&forward, Arg::Workspace, None);
    let (mean, variance) = (bind(&forward, Arg::Mean, None), bind(&forward, Arg::Variance, None));
    let src = bind(&forward, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0]));
    let args = ExecArgs::new()
        .with(Arg::Src, src.clone())
        .with(Arg::Dst, bind(&forward, Arg::Dst, None))
        .with(Arg::Mean, mean.clone())
        .with(Arg::Variance, variance.clone())
        .with(Arg::Workspace, workspace.clone());
    h.run(&forward, &args).unwrap();
    assert_close(&workspace.read_f32(), &[0.0, 0.0, 1.0, 1.0]);

    let diff_src = bind(&backward, Arg::DiffSrc, None);
    let args = ExecArgs::new()
        .with(Arg::Src, src)
        .with(Arg::Mean, mean)
        .with(Arg::Variance, variance)
        .with(Arg::DiffDst, bind(&backward, Arg::DiffDst, Some(&[1.0; 4])))
        .with(Arg::Workspace, workspace)
        .with(Arg::DiffSrc, diff_src.clone());
    h.run(&backward, &args).unwrap();
    let grads = diff_src.read_f32();
    // Masked lanes only receive the mean-correction terms; the total gradient stays zero.
    assert!(grads.iter().sum::<f32>().abs() < 1e-4, "{grads:?}");
}

fn pooling(prop_kind: PropKind, alg: PoolingAlg) -> PoolingDesc {
    PoolingDesc::new(
        prop_kind,
        alg,
        md(&[1, 1, 4, 4], FormatTag::Nchw),
        md(&[1, 1, 2, 2], FormatTag::Nchw),
        &[2, 2],
        &[2, 2],
        &[0, 0],
        &[0, 0],
    )
    .unwrap()
}

#[test]
fn max_pooling_round_trip_through_workspace() {
    let h = Harness::new();
    let forward = h
        .resolve(pooling(PropKind::ForwardTraining, PoolingAlg::Max), PrimitiveAttr::new())
        .unwrap();
    assert_eq!(forward.pd().workspace_md().data_type(), DataType::S32);

    let src: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let dst = bind(&forward, Arg::Dst, None);
    let workspace = bind(&forward, Arg::Workspace, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&forward, Arg::Src, Some(&src)))
        .with(Arg::Dst, dst.clone())
        .with(Arg::Workspace, workspace.clone());
    h.run(&forward, &args).unwrap();
    assert_close(&dst.read_f32(), &[5.0, 7.0, 13.0, 15.0]);
    assert_close(&workspace.read_f32(), &[5.0, 7.0, 13.0, 15.0]);

    let backward_desc = pooling(PropKind::BackwardData, PoolingAlg::Max);
    assert!(h
        .resolve(backward_desc.clone(), PrimitiveAttr::new())
        .unwrap_err()
        .is_unimplemented());
    let backward = h
        .resolve_with_hint(backward_desc, PrimitiveAttr::new(), Some(&forward))
        .unwrap();
    let diff_src = bind(&backward, Arg::DiffSrc, None);
    let args = ExecArgs::new()
        .with(Arg::DiffDst, bind(&backward, Arg::DiffDst, Some(&[1.0, 2.0, 3.0, 4.0])))
        .with(Arg::Workspace, workspace)
        .with(Arg::DiffSrc, diff_src.clone());
    h.run(&backward, &args).unwrap();
    let mut expected = vec![0.0; 16];
    expected[5] = 1.0;
    expected[7] = 2.0;
    expected[13] = 3.0;
    expected[15] = 4.0;
    assert_close(&diff_src.read_f32(), &expected);
}

#[test]
fn inference_max_pooling_has_no_workspace() {
    let h = Harness::new();
    let forward = h
        .resolve(pooling(PropKind::ForwardInference, PoolingAlg::Max), PrimitiveAttr::new())
        .unwrap();
    assert!(forward.pd().workspace_md().is_zero());
}

#[test]
fn average_pooling_padding_modes() {
    let h = Harness::new();
    let desc = |alg| {
        PoolingDesc::new(
            PropKind::ForwardInference,
            alg,
            md(&[1, 1, 2, 2], FormatTag::Nchw),
            MemoryDesc::any(&[1, 1, 3, 3], DataType::F32).unwrap(),
            &[2, 2],
            &[1, 1],
            &[1, 1],
            &[1, 1],
        )
        .unwrap()
    };
    let mut corners = Vec::new();
    for alg in [PoolingAlg::AvgIncludePadding, PoolingAlg::AvgExcludePadding] {
        let primitive = h.resolve(desc(alg), PrimitiveAttr::new()).unwrap();
        let dst = bind(&primitive, Arg::Dst, None);
        let args = ExecArgs::new()
            .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0])))
            .with(Arg::Dst, dst.clone());
        h.run(&primitive, &args).unwrap();
        let values = dst.read_f32();
        assert!((values[4] - 2.5).abs() < 1e-6);
        corners.push(values[0]);
    }
    assert_close(&corners, &[0.25, 1.0]);
}

#[test]
fn reductions_accumulate_through_scratchpad() {
    let h = Harness::new();
    let src = md(&[2, 3], FormatTag::Nc);
    let cases = [
        (ReductionAlg::Sum, vec![1, 3], vec![5.0, 7.0, 9.0]),
        (ReductionAlg::Mean, vec![1, 3], vec![2.5, 3.5, 4.5]),
        (ReductionAlg::Max, vec![2, 1], vec![3.0, 6.0]),
        (ReductionAlg::Min, vec![2, 1], vec![1.0, 4.0]),
        (ReductionAlg::Mul, vec![1, 1], vec![720.0]),
    ];
    for (alg, dims, expected) in cases {
        let desc = ReductionDesc::new(
            alg,
            src.clone(),
            MemoryDesc::any(&dims, DataType::F32).unwrap(),
        )
        .unwrap();
        let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
        let booked = primitive
            .pd()
            .scratchpad_registry()
            .entry(ScratchpadKey::Accumulator)
            .map(|e| e.size);
        assert_eq!(booked, Some(expected.len() * 4));

        let dst = bind(&primitive, Arg::Dst, None);
        let args = ExecArgs::new()
            .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])))
            .with(Arg::Dst, dst.clone());
        h.run(&primitive, &args).unwrap();
        assert_close(&dst.read_f32(), &expected);
    }
}

#[test]
fn concat_picks_block_copy_for_plain_sources() {
    let h = Harness::new();
    let desc = ConcatDesc::new(
        None,
        1,
        vec![md(&[2, 1], FormatTag::Nc), md(&[2, 2], FormatTag::Nc)],
    )
    .unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    assert_eq!(primitive.impl_name(), "simple:plain");

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::MultipleSrc(0), bind(&primitive, Arg::MultipleSrc(0), Some(&[1.0, 4.0])))
        .with(
            Arg::MultipleSrc(1),
            bind(&primitive, Arg::MultipleSrc(1), Some(&[2.0, 3.0, 5.0, 6.0])),
        )
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn concat_of_channels_last_sources_uses_reference() {
    let h = Harness::new();
    let desc = ConcatDesc::new(
        None,
        1,
        vec![md(&[1, 1, 1, 2], FormatTag::Nhwc), md(&[1, 2, 1, 2], FormatTag::Nhwc)],
    )
    .unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    assert_eq!(primitive.impl_name(), "ref:any");
    assert!(primitive.pd().arg_md(Arg::Dst).matches_tag(FormatTag::Nhwc));

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::MultipleSrc(0), bind(&primitive, Arg::MultipleSrc(0), Some(&[1.0, 2.0])))
        .with(
            Arg::MultipleSrc(1),
            bind(&primitive, Arg::MultipleSrc(1), Some(&[3.0, 4.0, 5.0, 6.0])),
        )
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn sum_scales_each_source() {
    let h = Harness::new();
    let src = md(&[2, 2], FormatTag::Nc);
    let desc = SumDesc::new(None, &[1.0, 2.0], vec![src.clone(), src]).unwrap();
    let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
    assert!(primitive.pd().arg_md(Arg::Dst).matches_tag(FormatTag::Nc));

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::MultipleSrc(0), bind(&primitive, Arg::MultipleSrc(0), Some(&[1.0, 2.0, 3.0, 4.0])))
        .with(Arg::MultipleSrc(1), bind(&primitive, Arg::MultipleSrc(1), Some(&[1.0, 1.0, 0.5, 0.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[3.0, 4.0, 4.0, 4.0]);
}

#[test]
fn reorder_prefers_direct_copy_for_identical_layouts() {
    let h = Harness::new();
    let same = ReorderDesc::new(md(&[2, 3], FormatTag::Nc), md(&[2, 3], FormatTag::Nc)).unwrap();
    assert_eq!(
        h.resolve(same, PrimitiveAttr::new()).unwrap().impl_name(),
        "direct_copy"
    );

    let transposed =
        ReorderDesc::new(md(&[1, 2, 1, 2], FormatTag::Nchw), md(&[1, 2, 1, 2], FormatTag::Nhwc))
            .unwrap();
    let primitive = h.resolve(transposed, PrimitiveAttr::new()).unwrap();
    assert_eq!(primitive.impl_name(), "ref:any");

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(&dst.read_f32(), &[1.0, 2.0, 3.0, 4.0]);
    let bytes = dst.read_bytes();
    let physical: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|raw| f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect();
    assert_eq!(physical, vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn quantizing_reorder_scales_and_shifts() {
    let h = Harness::new();
    let desc = ReorderDesc::new(
        md(&[1, 2], FormatTag::Nc),
        MemoryDesc::new(&[1, 2], DataType::S8, FormatTag::Nc).unwrap(),
    )
    .unwrap();
    let attr = PrimitiveAttr::new()
        .with_output_scales(0, vec![2.0])
        .unwrap()
        .with_zero_point(Arg::Dst, 1);
    let primitive = h.resolve(desc, attr).unwrap();
    assert_eq!(primitive.impl_name(), "ref:any");

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.2, -3.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_eq!(dst.read_f32(), vec![3.0, -5.0]);
}

fn random_values(rng: &mut StdRng, count: usize) -> Vec<f32> {
    (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

#[test]
fn conv_gemm_matches_direct_kernel_on_random_data() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut rng = StdRng::seed_from_u64(7);
    let conv = |src_tag| {
        ConvolutionDesc::new(
            PropKind::ForwardInference,
            ConvAlg::Direct,
            md(&[2, 3, 5, 5], src_tag),
            md(&[4, 3, 3, 3], FormatTag::OIHW),
            Some(md(&[4], FormatTag::X)),
            md(&[2, 4, 3, 3], FormatTag::Nchw),
            &[2, 2],
            &[0, 0],
            &[1, 1],
            &[1, 1],
        )
    };
    let src = random_values(&mut rng, 2 * 3 * 5 * 5);
    let weights = random_values(&mut rng, 4 * 3 * 3 * 3);
    let bias = random_values(&mut rng, 4);

    let mut outputs = Vec::new();
    for (tag, expected_impl) in [(FormatTag::Nchw, "gemm:f32"), (FormatTag::Nhwc, "ref:direct")] {
        let primitive = h.resolve(conv(tag)?, PrimitiveAttr::new())?;
        assert_eq!(primitive.impl_name(), expected_impl);
        let dst = bind(&primitive, Arg::Dst, None);
        let args = ExecArgs::new()
            .with(Arg::Src, bind(&primitive, Arg::Src, Some(&src)))
            .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&weights)))
            .with(Arg::Bias, bind(&primitive, Arg::Bias, Some(&bias)))
            .with(Arg::Dst, dst.clone());
        h.run(&primitive, &args)?;
        outputs.push(dst.read_f32());
    }
    assert_close(&outputs[0], &outputs[1]);
    Ok(())
}

#[test]
fn weighted_ops_decline_unlisted_type_combinations() {
    let h = Harness::new();
    let typed = |dims: &[usize], data_type| MemoryDesc::new(dims, data_type, FormatTag::Nc).unwrap();
    let matmul = |src, weights, dst| {
        MatmulDesc::new(typed(&[2, 3], src), typed(&[3, 2], weights), None, typed(&[2, 2], dst))
            .unwrap()
    };

    for (src, weights, dst) in [
        (DataType::F16, DataType::Bf16, DataType::U8),
        (DataType::S32, DataType::F32, DataType::S8),
        (DataType::F32, DataType::S8, DataType::F32),
    ] {
        let err = h.resolve(matmul(src, weights, dst), PrimitiveAttr::new()).unwrap_err();
        assert!(err.is_unimplemented(), "{src}x{weights}->{dst}: {err}");
    }

    let primitive = h
        .resolve(matmul(DataType::Bf16, DataType::Bf16, DataType::F32), PrimitiveAttr::new())
        .unwrap();
    assert_eq!(primitive.impl_name(), "ref:any");

    let conv = ConvolutionDesc::new(
        PropKind::ForwardInference,
        ConvAlg::Direct,
        md(&[1, 1, 3, 3], FormatTag::Nchw),
        MemoryDesc::new(&[1, 1, 2, 2], DataType::U8, FormatTag::OIHW).unwrap(),
        None,
        MemoryDesc::new(&[1, 1, 2, 2], DataType::Bf16, FormatTag::Nchw).unwrap(),
        &[1, 1],
        &[0, 0],
        &[0, 0],
        &[0, 0],
    )
    .unwrap();
    let err = h.resolve(conv, PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented(), "{err}");
}

fn pointwise_conv_into_blocked_dst(prop_kind: PropKind, bias: MemoryDesc) -> ConvolutionDesc {
    ConvolutionDesc::new(
        prop_kind,
        ConvAlg::Direct,
        md(&[1, 1, 2, 2], FormatTag::Nchw),
        md(&[3, 1, 1, 1], FormatTag::OIHW),
        Some(bias),
        md(&[1, 3, 2, 2], FormatTag::NChw8c),
        &[1, 1],
        &[0, 0],
        &[0, 0],
        &[0, 0],
    )
    .unwrap()
}

#[test]
fn conv_bias_is_padded_like_blocked_dst_channels() {
    let h = Harness::new();
    let any_bias = || MemoryDesc::any(&[3], DataType::F32).unwrap();

    let primitive = h
        .resolve(
            pointwise_conv_into_blocked_dst(PropKind::ForwardInference, any_bias()),
            PrimitiveAttr::new(),
        )
        .unwrap();
    assert_eq!(primitive.impl_name(), "gemm:f32");
    let bias_md = primitive.pd().arg_md(Arg::Bias);
    assert_eq!(bias_md.dims(), &[3]);
    assert_eq!(bias_md.padded_dims(), &[8]);

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&[1.0, 2.0, 3.0, 4.0])))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&[1.0, 2.0, 3.0])))
        .with(Arg::Bias, bind(&primitive, Arg::Bias, Some(&[10.0, 20.0, 30.0])))
        .with(Arg::Dst, dst.clone());
    h.run(&primitive, &args).unwrap();
    assert_close(
        &dst.read_f32(),
        &[11.0, 12.0, 13.0, 14.0, 22.0, 24.0, 26.0, 28.0, 33.0, 36.0, 39.0, 42.0],
    );

    let backward = h
        .resolve(
            pointwise_conv_into_blocked_dst(PropKind::BackwardWeights, any_bias()),
            PrimitiveAttr::new(),
        )
        .unwrap();
    assert_eq!(backward.pd().arg_md(Arg::DiffBias).padded_dims(), &[8]);

    let fixed_bias = pointwise_conv_into_blocked_dst(PropKind::ForwardInference, md(&[3], FormatTag::X));
    let err = h.resolve(fixed_bias, PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented(), "{err}");
}

#[test]
fn zero_extent_descriptors_resolve_to_noop_for_every_kind() {
    let h = Harness::new();
    let descs: Vec<OpDesc> = vec![
        ConvolutionDesc::new(
            PropKind::ForwardInference,
            ConvAlg::Direct,
            md(&[0, 1, 3, 3], FormatTag::Nchw),
            md(&[1, 1, 2, 2], FormatTag::OIHW),
            None,
            md(&[0, 1, 2, 2], FormatTag::Nchw),
            &[1, 1],
            &[0, 0],
            &[0, 0],
            &[0, 0],
        )
        .unwrap()
        .into(),
        MatmulDesc::new(
            md(&[0, 3], FormatTag::Nc),
            md(&[3, 2], FormatTag::Nc),
            None,
            md(&[0, 2], FormatTag::Nc),
        )
        .unwrap()
        .into(),
        BatchNormDesc::new_forward(
            PropKind::ForwardInference,
            md(&[0, 2, 1, 1], FormatTag::Nchw),
            1e-5,
            BatchNormFlags::default(),
        )
        .unwrap()
        .into(),
        PoolingDesc::new(
            PropKind::ForwardInference,
            PoolingAlg::Max,
            md(&[0, 1, 4, 4], FormatTag::Nchw),
            md(&[0, 1, 2, 2], FormatTag::Nchw),
            &[2, 2],
            &[2, 2],
            &[0, 0],
            &[0, 0],
        )
        .unwrap()
        .into(),
        ReductionDesc::new(
            ReductionAlg::Sum,
            md(&[0, 2], FormatTag::Nc),
            md(&[0, 1], FormatTag::Nc),
        )
        .unwrap()
        .into(),
        ConcatDesc::new(None, 1, vec![md(&[0, 2], FormatTag::Nc), md(&[0, 3], FormatTag::Nc)])
            .unwrap()
            .into(),
        SumDesc::new(None, &[1.0, 1.0], vec![md(&[0, 2], FormatTag::Nc), md(&[0, 2], FormatTag::Nc)])
            .unwrap()
            .into(),
        ReorderDesc::new(md(&[0, 2], FormatTag::Nc), md(&[0, 2], FormatTag::Cn))
            .unwrap()
            .into(),
    ];
    assert_eq!(descs.len(), 8);

    for desc in descs {
        let kind = desc.kind();
        let primitive = h.resolve(desc, PrimitiveAttr::new()).unwrap();
        assert_eq!(primitive.impl_name(), prim_rs::ZERO_DIM_IMPL_NAME, "{kind}");
        h.run(&primitive, &ExecArgs::new()).unwrap();
    }
}

#[test]
fn user_scratchpad_must_be_passed_by_the_caller() {
    let h = Harness::new();
    let attr = PrimitiveAttr::new().with_scratchpad_mode(ScratchpadMode::User);
    let primitive = h
        .resolve(conv_3x3_by_2x2(PropKind::ForwardInference, FormatTag::Nchw, true), attr)
        .unwrap();
    assert_eq!(primitive.impl_name(), "gemm:f32");
    let size = primitive.pd().scratchpad_size();
    assert!(size > 0);

    let dst = bind(&primitive, Arg::Dst, None);
    let args = ExecArgs::new()
        .with(Arg::Src, bind(&primitive, Arg::Src, Some(&IMAGE)))
        .with(Arg::Weights, bind(&primitive, Arg::Weights, Some(&[1.0; 4])))
        .with(Arg::Bias, bind(&primitive, Arg::Bias, Some(&[0.5])))
        .with(Arg::Dst, dst.clone());
    let stream = SyncStream::new();
    let err = primitive.execute(&stream, &args).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);

    let scratchpad = Memory::new(&MemoryDesc::new(&[size], DataType::U8, FormatTag::X).unwrap()).unwrap();
    let args = args.with(Arg::Scratchpad, scratchpad);
    primitive.execute(&stream, &args).unwrap();
    assert_close(&dst.read_f32(), &[12.5, 16.5, 24.5, 28.5]);
    assert_eq!(stream.scratchpad_capacity(), 0);
}
