use serde::{Deserialize, Serialize};

use crate::env::{self, DEFAULT_PRIMITIVE_CACHE_CAPACITY};
use crate::error::{PrimResult, PrimitiveError};

/// Settings of the process-wide primitive cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveCacheConfig {
    /// Maximum number of resident entries; zero disables caching.
    pub capacity: usize,
}

impl Default for PrimitiveCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_PRIMITIVE_CACHE_CAPACITY,
        }
    }
}

impl PrimitiveCacheConfig {
    /// Reads `PRIMRS_PRIMITIVE_CACHE_CAPACITY`, falling back to the default.
    pub fn from_env() -> Self {
        Self {
            capacity: env::primitive_cache_capacity(),
        }
    }

    pub fn from_json(text: &str) -> PrimResult<Self> {
        serde_json::from_str(text).map_err(|err| {
            PrimitiveError::invalid_arguments(format!("invalid primitive cache config: {err}"))
        })
    }
}
