//! Structural fingerprints of descriptors and cache keys.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Hash of `value` under the std hasher; stable within one process.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Order-sensitive fold of per-field fingerprints, FNV-1a over their little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDigest(u64);

impl KeyDigest {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self(Self::OFFSET)
    }

    /// Mixes in an already computed 64-bit fingerprint.
    pub fn mix(self, part: u64) -> Self {
        let state = part
            .to_le_bytes()
            .iter()
            .fold(self.0, |state, byte| (state ^ u64::from(*byte)).wrapping_mul(Self::PRIME));
        Self(state)
    }

    pub fn field<T: Hash + ?Sized>(self, value: &T) -> Self {
        self.mix(hash_value(value))
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for KeyDigest {
    fn default() -> Self {
        Self::new()
    }
}
