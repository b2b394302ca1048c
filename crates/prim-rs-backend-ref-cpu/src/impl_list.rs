//! Priority-ordered candidate lists of the CPU engine.
//!
//! Earlier entries are tried first. Parallel kernels are listed ahead of their single-threaded
//! reference fallbacks and are compiled out where rayon has no thread pool.

use prim_rs::desc::{DataType, OpKind};
use prim_rs::primitive::{CandidateImpl, ImplementationRegistry};

use crate::kernels::{batch_norm, concat, conv, matmul, pooling, reduction, reorder, sum};

static CONVOLUTION: &[CandidateImpl] = &[
    #[cfg(not(target_family = "wasm"))]
    conv::GEMM_F32,
    conv::REF,
];

static BATCH_NORMALIZATION: &[CandidateImpl] = &[batch_norm::REF_FWD, batch_norm::REF_BWD];

static MATMUL: &[CandidateImpl] = &[
    #[cfg(not(target_family = "wasm"))]
    matmul::GEMM_F32,
    matmul::REF,
];

static POOLING: &[CandidateImpl] = &[pooling::REF_FWD, pooling::REF_BWD];

static REDUCTION: &[CandidateImpl] = &[reduction::REF];

static CONCAT: &[CandidateImpl] = &[concat::SIMPLE, concat::REF];

static SUM: &[CandidateImpl] = &[sum::REF];

static REORDER: &[CandidateImpl] = &[reorder::DIRECT_COPY, reorder::REF];

const REORDER_SOURCES: [DataType; 6] = [
    DataType::F32,
    DataType::Bf16,
    DataType::F16,
    DataType::S32,
    DataType::S8,
    DataType::U8,
];

/// Builds the registry shared by every CPU engine instance.
pub(crate) fn build_registry() -> ImplementationRegistry {
    let mut registry = ImplementationRegistry::new("cpu")
        .with_candidates(OpKind::Convolution, CONVOLUTION)
        .with_candidates(OpKind::BatchNormalization, BATCH_NORMALIZATION)
        .with_candidates(OpKind::Matmul, MATMUL)
        .with_candidates(OpKind::Pooling, POOLING)
        .with_candidates(OpKind::Reduction, REDUCTION)
        .with_candidates(OpKind::Concat, CONCAT)
        .with_candidates(OpKind::Sum, SUM)
        .with_type_pair(DataType::F32, DataType::F32, REORDER);
    for src in REORDER_SOURCES {
        registry = registry.with_type_pair(src, DataType::Undef, REORDER);
    }
    log::debug!("built cpu implementation registry #{}", registry.id());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[CandidateImpl]) -> Vec<&'static str> {
        list.iter().map(CandidateImpl::name).collect()
    }

    #[test]
    fn every_kind_has_candidates() {
        let registry = build_registry();
        for kind in OpKind::ALL {
            if kind == OpKind::Reorder {
                continue;
            }
            assert!(!registry.get_candidates(kind).is_empty(), "{kind} has no candidates");
        }
        for src in REORDER_SOURCES {
            let list = registry.get_type_pair_candidates(src, DataType::S8);
            assert_eq!(names(list), ["direct_copy", "ref:any"]);
        }
        assert!(registry.get_type_pair_candidates(DataType::Undef, DataType::F32).is_empty());
    }

    #[cfg(not(target_family = "wasm"))]
    #[test]
    fn parallel_kernels_come_first() {
        let registry = build_registry();
        assert_eq!(
            names(registry.get_candidates(OpKind::Convolution)),
            ["gemm:f32", "ref:direct"]
        );
        assert_eq!(names(registry.get_candidates(OpKind::Matmul)), ["gemm:f32", "ref:any"]);
    }
}
