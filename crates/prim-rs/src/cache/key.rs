use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::desc::{OpDesc, OpKind, PrimitiveAttr};
use crate::engine::{EngineKind, EngineRef};
use crate::hashing::KeyDigest;
use crate::primitive::PrimitiveDesc;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Identity of the forward primitive a backward resolution was paired with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HintKey {
    impl_name: &'static str,
    desc: OpDesc,
}

/// Value-equality key of the primitive cache.
///
/// Two keys are equal when they describe the same operation, attributes, implementation list
/// and thread context. The owning thread and generation travel with the key so that
/// [`update_entry`](super::PrimitiveCache::update_entry) can tell whether the entry it finds is
/// the one this key inserted; neither takes part in equality.
#[derive(Clone)]
pub struct CacheKey {
    kind: OpKind,
    desc: Arc<OpDesc>,
    attr: Arc<PrimitiveAttr>,
    engine_kind: EngineKind,
    registry_id: u64,
    hint: Option<HintKey>,
    nthreads: usize,
    digest: u64,
    owner: ThreadId,
    generation: u64,
}

impl CacheKey {
    pub fn new(
        desc: Arc<OpDesc>,
        attr: Arc<PrimitiveAttr>,
        engine: &EngineRef,
        hint: Option<&Arc<PrimitiveDesc>>,
    ) -> Self {
        Self::with_registry(
            desc,
            attr,
            engine.kind(),
            engine.implementation_registry().id(),
            hint,
        )
    }

    /// Key for an explicit implementation list, bypassing engine lookup.
    pub fn with_registry(
        desc: Arc<OpDesc>,
        attr: Arc<PrimitiveAttr>,
        engine_kind: EngineKind,
        registry_id: u64,
        hint: Option<&Arc<PrimitiveDesc>>,
    ) -> Self {
        let kind = desc.kind();
        let hint = hint.map(|pd| HintKey {
            impl_name: pd.impl_name(),
            desc: pd.op_desc().clone(),
        });
        let nthreads = rayon::current_num_threads();
        let digest = KeyDigest::new()
            .field(&kind)
            .mix(desc.fingerprint())
            .field(&*attr)
            .field(&engine_kind)
            .mix(registry_id)
            .field(&hint)
            .mix(nthreads as u64)
            .finish();
        Self {
            kind,
            desc,
            attr,
            engine_kind,
            registry_id,
            hint,
            nthreads,
            digest,
            owner: thread::current().id(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn desc(&self) -> &Arc<OpDesc> {
        &self.desc
    }

    pub fn attr(&self) -> &Arc<PrimitiveAttr> {
        &self.attr
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
            && self.kind == other.kind
            && self.engine_kind == other.engine_kind
            && self.registry_id == other.registry_id
            && self.nthreads == other.nthreads
            && (Arc::ptr_eq(&self.desc, &other.desc) || self.desc == other.desc)
            && (Arc::ptr_eq(&self.attr, &other.attr) || self.attr == other.attr)
            && self.hint == other.hint
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.digest);
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("kind", &self.kind)
            .field("registry_id", &self.registry_id)
            .field("digest", &format_args!("{:016x}", self.digest))
            .field("generation", &self.generation)
            .finish()
    }
}
