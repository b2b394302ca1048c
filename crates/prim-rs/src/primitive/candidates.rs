//! Static candidate lists and the per-engine implementation registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::kernel::Kernel;
use super::pd::{PdInit, PrimitiveDesc};
use crate::desc::{DataType, OpDesc, OpKind};
use crate::error::PrimResult;

/// Capability predicate plus descriptor finalization. Returns `Unimplemented` to decline.
pub type InitFn = fn(&mut PdInit<'_>) -> PrimResult<()>;

/// Builds the executable kernel for an accepted descriptor.
pub type CreateFn = fn(&Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>>;

/// One entry of a priority-ordered candidate list.
#[derive(Clone, Copy)]
pub struct CandidateImpl {
    name: &'static str,
    init: InitFn,
    create: CreateFn,
}

impl CandidateImpl {
    pub const fn new(name: &'static str, init: InitFn, create: CreateFn) -> Self {
        Self { name, init, create }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn init(&self, init: &mut PdInit<'_>) -> PrimResult<()> {
        (self.init)(init)
    }

    pub(crate) fn create(&self, pd: &Arc<PrimitiveDesc>) -> PrimResult<Box<dyn Kernel>> {
        (self.create)(pd)
    }
}

impl fmt::Debug for CandidateImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CandidateImpl").field(&self.name).finish()
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Candidate lists of one engine, fixed once built.
///
/// Lists are ordered by priority. Type-pair keyed lists serve operators whose best implementation
/// depends on the (source, destination) element types; a lookup falls back to `(src, Undef)` and
/// yields an empty list when neither key matches.
pub struct ImplementationRegistry {
    id: u64,
    name: &'static str,
    lists: HashMap<OpKind, &'static [CandidateImpl]>,
    type_pairs: HashMap<(DataType, DataType), &'static [CandidateImpl]>,
}

impl ImplementationRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            name,
            lists: HashMap::new(),
            type_pairs: HashMap::new(),
        }
    }

    pub fn with_candidates(mut self, kind: OpKind, candidates: &'static [CandidateImpl]) -> Self {
        self.lists.insert(kind, candidates);
        self
    }

    /// Registers the list used for reorders from `src` to `dst`. `dst == Undef` is the
    /// catch-all for `src`.
    pub fn with_type_pair(
        mut self,
        src: DataType,
        dst: DataType,
        candidates: &'static [CandidateImpl],
    ) -> Self {
        self.type_pairs.insert((src, dst), candidates);
        self
    }

    /// Identity distinguishing cache entries of different registries.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get_candidates(&self, kind: OpKind) -> &'static [CandidateImpl] {
        self.lists.get(&kind).copied().unwrap_or(&[])
    }

    pub fn get_type_pair_candidates(&self, src: DataType, dst: DataType) -> &'static [CandidateImpl] {
        self.type_pairs
            .get(&(src, dst))
            .or_else(|| self.type_pairs.get(&(src, DataType::Undef)))
            .copied()
            .unwrap_or(&[])
    }

    /// Candidates for `desc`, dispatching reorders by element-type pair.
    pub fn candidates_for(&self, desc: &OpDesc) -> &'static [CandidateImpl] {
        match desc.type_pair() {
            Some((src, dst)) => self.get_type_pair_candidates(src, dst),
            None => self.get_candidates(desc.kind()),
        }
    }
}

impl fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kinds", &self.lists.len())
            .field("type_pairs", &self.type_pairs.len())
            .finish()
    }
}
