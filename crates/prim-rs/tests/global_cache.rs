
use std::sync::{Arc, Mutex};

use prim_rs::desc::PrimitiveAttr;
use prim_rs::{
    get_primitive_cache_capacity, get_primitive_cache_size, resolve_primitive_descriptor,
    set_primitive_cache_capacity, Status,
};
use stub_engine::{matmul, StubEngine, ACCEPT_ONLY};

// Tests in this file share the process-wide cache.
static GLOBAL: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn negative_capacity_is_rejected() {
    let _guard = lock();
    let before = get_primitive_cache_capacity();
    let err = set_primitive_cache_capacity(-1).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    assert_eq!(get_primitive_cache_capacity(), before);
}

#[test]
fn resolution_is_memoized_until_caching_is_disabled() {
    let _guard = lock();
    let before = get_primitive_cache_capacity();
    let engine = StubEngine::with_matmul(ACCEPT_ONLY);
    let attr = PrimitiveAttr::new();

    set_primitive_cache_capacity(8).unwrap();
    let first = resolve_primitive_descriptor(&matmul(5), &attr, &engine, None).unwrap();
    let second = resolve_primitive_descriptor(&matmul(5), &attr, &engine, None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(get_primitive_cache_size() >= 1);

    set_primitive_cache_capacity(0).unwrap();
    assert_eq!(get_primitive_cache_size(), 0);
    let third = resolve_primitive_descriptor(&matmul(5), &attr, &engine, None).unwrap();
    let fourth = resolve_primitive_descriptor(&matmul(5), &attr, &engine, None).unwrap();
    assert!(!Arc::ptr_eq(&third, &fourth));
    assert_eq!(get_primitive_cache_size(), 0);

    set_primitive_cache_capacity(before as i64).unwrap();
}

#[test]
fn cached_resolution_survives_the_callers_descriptor() {
    let _guard = lock();
    let before = get_primitive_cache_capacity();
    set_primitive_cache_capacity(8).unwrap();
    let engine = StubEngine::with_matmul(ACCEPT_ONLY);

    let primitive = {
        let desc = matmul(6);
        let attr = PrimitiveAttr::new();
        resolve_primitive_descriptor(&desc, &attr, &engine, None).unwrap()
    };
    let again = resolve_primitive_descriptor(&matmul(6), &PrimitiveAttr::new(), &engine, None)
        .unwrap();
    assert!(Arc::ptr_eq(&primitive, &again));
    assert_eq!(**primitive.pd().original_desc(), *matmul(6));

    set_primitive_cache_capacity(before as i64).unwrap();
}
