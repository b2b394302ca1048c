#![cfg(feature = "profiler")]


use std::sync::Arc;

use prim_rs::desc::{Arg, PrimitiveAttr};
use prim_rs::primitive::ExecArgs;
use prim_rs::{profiling, resolve_uncached, CacheKey, Memory, PrimitiveCache};
use stub_engine::{matmul, plain, StubEngine, ACCEPT_ONLY};

#[test]
fn resolve_execute_and_cache_events_are_tabulated() {
    profiling::reset();

    let engine = StubEngine::with_matmul(ACCEPT_ONLY);
    let desc = matmul(2);
    let attr = Arc::new(PrimitiveAttr::new());
    let cache = PrimitiveCache::new(4);
    let key = CacheKey::new(Arc::clone(&desc), Arc::clone(&attr), &engine, None);
    for _ in 0..2 {
        cache
            .get_or_add(&key, || resolve_uncached(&desc, &attr, &engine, None))
            .unwrap();
    }

    let primitive = resolve_uncached(&desc, &attr, &engine, None).unwrap();
    let args = ExecArgs::new()
        .with(Arg::Src, Memory::new(&plain(&[2, 2])).unwrap())
        .with(Arg::Weights, Memory::new(&plain(&[2, 2])).unwrap())
        .with(Arg::Dst, Memory::new(&plain(&[2, 2])).unwrap());
    let stream = engine.create_stream().unwrap();
    for _ in 0..3 {
        primitive.execute(stream.as_ref(), &args).unwrap();
    }

    let tables = profiling::take_tables().expect("expected profiler tables");
    let resolve_row = tables
        .resolves
        .iter()
        .find(|row| row.name == "matmul (stub:accept)")
        .expect("expected a resolve row");
    assert_eq!(resolve_row.calls, 2);

    let execute_row = tables
        .executions
        .iter()
        .find(|row| row.name == "matmul (stub:accept)")
        .expect("expected an execute row");
    assert_eq!(execute_row.calls, 3);
    assert!(execute_row.incl_ms >= execute_row.excl_ms);

    let calls_of = |name: &str| {
        tables
            .caches
            .iter()
            .find(|row| row.name == name)
            .map_or(0, |row| row.calls)
    };
    assert_eq!(calls_of("primitive_cache.miss"), 1);
    assert_eq!(calls_of("primitive_cache.hit"), 1);

    let json = serde_json::to_string(&tables).unwrap();
    assert!(json.contains("stub:accept"));
    assert!(profiling::take_tables().is_none());
}
