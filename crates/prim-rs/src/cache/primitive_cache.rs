//! Thread-safe, capacity-bounded LRU map from [`CacheKey`] to resolved primitives.
//!
//! A miss inserts a pending slot under the write lock and resolves outside it; concurrent
//! callers with the same key find the slot and block until the resolving thread fills it, so a
//! key is resolved at most once while its entry stays resident. Failed or stale results are
//! removed from the map before anyone else can be handed them again; waiters on a slot whose
//! resolver ran out of memory or panicked make their own attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::ThreadId;

use lru::LruCache;
use serde::Serialize;

use super::key::CacheKey;
use crate::desc::{OpDesc, PrimitiveAttr};
use crate::error::{PrimResult, PrimitiveError, Status};
use crate::primitive::Primitive;
use crate::profiling;

type Resolution = PrimResult<Arc<Primitive>>;

/// One-shot rendezvous between the resolving thread and same-key waiters.
struct Slot {
    state: Mutex<Option<Resolution>>,
    ready: Condvar,
    abandoned: AtomicBool,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
            abandoned: AtomicBool::new(false),
        })
    }

    /// Fails the slot because its resolver unwound.
    fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.fulfill(Err(PrimitiveError::execution(
            "primitive resolution panicked",
        )));
    }

    /// Whether a waiter handed `err` should resolve the key itself instead of returning it.
    fn failed_transiently(&self, err: &PrimitiveError) -> bool {
        err.status() == Status::OutOfMemory || self.abandoned.load(Ordering::Acquire)
    }

    fn is_filled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    fn fulfill(&self, result: Resolution) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Resolution {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone();
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn peek(&self) -> Option<Resolution> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// `true` once filled with a failure or with a primitive whose engine is gone.
    fn is_invalidated(&self) -> bool {
        match self.peek() {
            Some(Ok(primitive)) => !primitive.is_valid(),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

struct CacheEntry {
    slot: Arc<Slot>,
    owner: ThreadId,
    generation: u64,
    desc: Arc<OpDesc>,
    attr: Arc<PrimitiveAttr>,
}

struct CacheInner {
    capacity: usize,
    entries: LruCache<CacheKey, CacheEntry>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    bypasses: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64, event: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        profiling::cache_event(event);
    }
}

/// Point-in-time copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub bypasses: u64,
}

enum Lookup {
    Bypass,
    /// `pending` when the slot was still being resolved; its entry is promoted once filled.
    Hit { slot: Arc<Slot>, pending: bool },
    Miss(Arc<Slot>),
}

/// Removes and fails a pending entry if the supplier unwinds.
struct PendingGuard<'a> {
    cache: &'a PrimitiveCache,
    key: &'a CacheKey,
    slot: &'a Arc<Slot>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.remove_slot(self.key, self.slot);
            self.slot.abandon();
        }
    }
}

pub struct PrimitiveCache {
    inner: RwLock<CacheInner>,
    counters: CacheCounters,
}

impl PrimitiveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                capacity,
                entries: LruCache::unbounded(),
            }),
            counters: CacheCounters::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict_down_to(&self, inner: &mut CacheInner, target: usize) {
        while inner.entries.len() > target {
            match inner.entries.pop_lru() {
                Some((key, _)) => {
                    log::trace!("primitive cache evicted {key:?}");
                    CacheCounters::bump(&self.counters.evictions, "primitive_cache.evict");
                }
                None => break,
            }
        }
    }

    fn lookup_or_reserve(&self, key: &CacheKey) -> Lookup {
        if self.read().capacity == 0 {
            return Lookup::Bypass;
        }
        let mut inner = self.write();
        if inner.capacity == 0 {
            return Lookup::Bypass;
        }
        if let Some(entry) = inner.entries.peek(key) {
            let slot = Arc::clone(&entry.slot);
            let pending = !slot.is_filled();
            if !pending {
                inner.entries.promote(key);
            }
            return Lookup::Hit { slot, pending };
        }
        let target = inner.capacity - 1;
        self.evict_down_to(&mut inner, target);
        let slot = Slot::new();
        inner.entries.put(
            key.clone(),
            CacheEntry {
                slot: Arc::clone(&slot),
                owner: key.owner(),
                generation: key.generation(),
                desc: Arc::clone(key.desc()),
                attr: Arc::clone(key.attr()),
            },
        );
        Lookup::Miss(slot)
    }

    /// Returns the cached primitive for `key`, resolving it with `supplier` on a miss.
    ///
    /// With capacity zero the cache is bypassed and `supplier` runs on every call.
    pub fn get_or_add<F>(&self, key: &CacheKey, supplier: F) -> PrimResult<Arc<Primitive>>
    where
        F: FnOnce() -> PrimResult<Arc<Primitive>>,
    {
        let slot = loop {
            match self.lookup_or_reserve(key) {
                Lookup::Bypass => {
                    CacheCounters::bump(&self.counters.bypasses, "primitive_cache.bypass");
                    return supplier();
                }
                Lookup::Hit { slot, pending } => match slot.wait() {
                    Ok(primitive) if primitive.is_valid() => {
                        if pending {
                            self.promote_slot(key, &slot);
                        }
                        CacheCounters::bump(&self.counters.hits, "primitive_cache.hit");
                        return Ok(primitive);
                    }
                    Ok(_) => {
                        self.remove_if_invalidated(key);
                    }
                    Err(err) if slot.failed_transiently(&err) => {
                        log::debug!("primitive cache retrying {key:?} after {err}");
                    }
                    Err(err) => return Err(err),
                },
                Lookup::Miss(slot) => break slot,
            }
        };
        self.populate(key, &slot, supplier)
    }

    fn populate<F>(&self, key: &CacheKey, slot: &Arc<Slot>, supplier: F) -> Resolution
    where
        F: FnOnce() -> Resolution,
    {
        CacheCounters::bump(&self.counters.misses, "primitive_cache.miss");
        let mut guard = PendingGuard {
            cache: self,
            key,
            slot,
            armed: true,
        };
        let result = supplier();
        guard.armed = false;
        drop(guard);

        match &result {
            Ok(primitive) => {
                slot.fulfill(Ok(Arc::clone(primitive)));
                self.promote_slot(key, slot);
                self.update_entry(key, primitive);
            }
            Err(err) => {
                self.remove_slot(key, slot);
                slot.fulfill(Err(err.clone()));
                log::debug!("primitive cache dropped failed resolution {key:?}: {err}");
            }
        }
        result
    }

    /// Removes the entry for `key` only if it still holds `slot`.
    fn remove_slot(&self, key: &CacheKey, slot: &Arc<Slot>) {
        let mut inner = self.write();
        let ours = inner
            .entries
            .peek(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot));
        if ours {
            inner.entries.pop(key);
        }
    }

    /// Marks the entry for `key` most recently used if it still holds `slot`.
    fn promote_slot(&self, key: &CacheKey, slot: &Arc<Slot>) {
        let mut inner = self.write();
        let ours = inner
            .entries
            .peek(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot));
        if ours {
            inner.entries.promote(key);
        }
    }

    /// Looks `key` up without resolving. Only completed, valid entries are returned and promoted.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Primitive>> {
        let mut inner = self.write();
        let slot = Arc::clone(&inner.entries.peek(key)?.slot);
        match slot.peek() {
            Some(Ok(primitive)) if primitive.is_valid() => {
                inner.entries.promote(key);
                Some(primitive)
            }
            _ => None,
        }
    }

    /// Drops the entry for `key` when it holds a failure or a primitive whose engine is gone.
    /// Returns whether an entry was removed.
    pub fn remove_if_invalidated(&self, key: &CacheKey) -> bool {
        let mut inner = self.write();
        let invalidated = inner
            .entries
            .peek(key)
            .is_some_and(|entry| entry.slot.is_invalidated());
        if invalidated {
            inner.entries.pop(key);
            CacheCounters::bump(&self.counters.invalidations, "primitive_cache.invalidate");
            log::debug!("primitive cache purged invalidated entry {key:?}");
        }
        invalidated
    }

    /// Re-points the entry's descriptor and attributes at `primitive`'s own copies.
    ///
    /// A no-op unless the resident entry was inserted through this very key (same owning thread
    /// and generation); an entry that was evicted, or replaced by another insertion for an equal
    /// key, is left alone.
    pub fn update_entry(&self, key: &CacheKey, primitive: &Primitive) {
        let mut inner = self.write();
        let Some(entry) = inner.entries.peek_mut(key) else {
            return;
        };
        if entry.owner != key.owner() || entry.generation != key.generation() {
            return;
        }
        entry.desc = Arc::clone(primitive.pd().original_desc());
        entry.attr = Arc::clone(primitive.pd().attr());
    }

    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    /// Changes the capacity, evicting least-recently-used entries that no longer fit.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.write();
        let previous = inner.capacity;
        inner.capacity = capacity;
        self.evict_down_to(&mut inner, capacity);
        log::info!("primitive cache capacity {previous} -> {capacity}");
    }

    pub fn size(&self) -> usize {
        self.read().entries.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.read().entries.contains(key)
    }

    /// Descriptor currently recorded for `key`'s entry.
    pub fn cached_descriptor(&self, key: &CacheKey) -> Option<Arc<OpDesc>> {
        self.read()
            .entries
            .peek(key)
            .map(|entry| Arc::clone(&entry.desc))
    }

    pub fn cached_attr(&self, key: &CacheKey) -> Option<Arc<PrimitiveAttr>> {
        self.read()
            .entries
            .peek(key)
            .map(|entry| Arc::clone(&entry.attr))
    }

    /// Keys from most to least recently used.
    pub fn recency_order(&self) -> Vec<CacheKey> {
        self.read().entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
        }
    }
}
