//! Primitive cache: memoized resolution keyed by descriptor value.

mod config;
mod key;
mod primitive_cache;

use once_cell::sync::Lazy;

pub use config::PrimitiveCacheConfig;
pub use key::CacheKey;
pub use primitive_cache::{CacheStats, PrimitiveCache};

use crate::error::{PrimResult, PrimitiveError};

static GLOBAL_CACHE: Lazy<PrimitiveCache> = Lazy::new(|| {
    let config = PrimitiveCacheConfig::from_env();
    log::info!("primitive cache initialised with capacity {}", config.capacity);
    PrimitiveCache::new(config.capacity)
});

/// Process-wide cache used by [`resolve_primitive_descriptor`](crate::resolve_primitive_descriptor).
pub fn global_cache() -> &'static PrimitiveCache {
    &GLOBAL_CACHE
}

/// Sets the capacity of the global cache; zero disables caching. Negative values are rejected.
pub fn set_primitive_cache_capacity(capacity: i64) -> PrimResult<()> {
    let capacity = usize::try_from(capacity).map_err(|_| {
        PrimitiveError::invalid_arguments(format!(
            "primitive cache capacity must be non-negative, got {capacity}"
        ))
    })?;
    global_cache().set_capacity(capacity);
    Ok(())
}

pub fn get_primitive_cache_capacity() -> usize {
    global_cache().capacity()
}

pub fn get_primitive_cache_size() -> usize {
    global_cache().size()
}

pub fn primitive_cache_stats() -> CacheStats {
    global_cache().stats()
}
