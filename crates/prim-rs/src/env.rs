use std::env;
use std::sync::OnceLock;

/// Capacity used when `PRIMRS_PRIMITIVE_CACHE_CAPACITY` is unset or unparsable.
pub const DEFAULT_PRIMITIVE_CACHE_CAPACITY: usize = 1024;

static PRIMRS_VERBOSE: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_capacity(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok()
}

/// Initial primitive cache capacity, read once when the global cache is first touched.
pub(crate) fn primitive_cache_capacity() -> usize {
    match env::var("PRIMRS_PRIMITIVE_CACHE_CAPACITY") {
        Ok(value) if !value.trim().is_empty() => match parse_capacity(&value) {
            Some(capacity) => capacity,
            None => {
                log::warn!(
                    "ignoring PRIMRS_PRIMITIVE_CACHE_CAPACITY={value:?}; using {DEFAULT_PRIMITIVE_CACHE_CAPACITY}"
                );
                DEFAULT_PRIMITIVE_CACHE_CAPACITY
            }
        },
        _ => DEFAULT_PRIMITIVE_CACHE_CAPACITY,
    }
}

/// Promotes per-resolution/per-execution logging from `debug` to `info`.
pub(crate) fn verbose_enabled() -> bool {
    *PRIMRS_VERBOSE.get_or_init(|| match env::var("PRIMRS_VERBOSE") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
