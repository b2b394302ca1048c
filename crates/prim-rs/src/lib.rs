//! Primitive-descriptor resolution, caching and execution dispatch.
//!
//! A caller describes an operation with an [`OpDesc`] and [`PrimitiveAttr`], then resolves it
//! against an [`Engine`]: the engine's implementation registry is walked in priority order and
//! the first candidate that accepts the descriptor yields an executable [`Primitive`]. Resolved
//! primitives are memoized in a process-wide LRU cache keyed by descriptor value.

pub use linkme;

pub mod cache;
pub mod desc;
pub mod engine;
mod env;
pub mod error;
pub mod exec;
pub mod hashing;
pub mod memory;
pub mod primitive;
pub mod profiling;
pub mod resolve;
pub mod stream;

pub use cache::{
    get_primitive_cache_capacity, get_primitive_cache_size, primitive_cache_stats,
    set_primitive_cache_capacity, CacheKey, CacheStats, PrimitiveCache, PrimitiveCacheConfig,
};
pub use desc::{Arg, ArgUsage, DataType, FormatTag, MemoryDesc, OpDesc, OpKind, PrimitiveAttr};
pub use engine::{Engine, EngineKind, EngineRef};
pub use env::DEFAULT_PRIMITIVE_CACHE_CAPACITY;
pub use error::{PrimResult, PrimitiveError, Status};
pub use exec::execute;
pub use memory::Memory;
pub use primitive::{ExecArgs, Primitive, PrimitiveDesc};
pub use resolve::{resolve_primitive_descriptor, resolve_uncached, ZERO_DIM_IMPL_NAME};
pub use stream::{Stream, SyncStream};
