//! Scratchpad booking and per-execution granting.
//!
//! Candidates book named regions while initializing; the total is reported through the resolved
//! descriptor. At execution time a [`ScratchpadGrantor`] slices the stream- or caller-provided
//! buffer into those regions, so resolved handles never own per-call mutable state.

use serde::Serialize;

use crate::error::{PrimResult, PrimitiveError};

/// Alignment, in bytes, of every booked region.
pub const SCRATCHPAD_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ScratchpadKey {
    /// im2col column buffer of a gemm-based convolution.
    ConvColumns,
    /// Per-channel partial statistics.
    BatchNormStats,
    /// f32 accumulator of reductions and n-ary sums.
    Accumulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScratchpadEntry {
    pub key: ScratchpadKey,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScratchpadRegistry {
    entries: Vec<ScratchpadEntry>,
    size: usize,
}

impl ScratchpadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Books `bytes` under `key`. Booking zero bytes is a no-op; booking a key twice is a
    /// programming error reported as `InvalidArguments`.
    pub fn book(&mut self, key: ScratchpadKey, bytes: usize) -> PrimResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        if self.entries.iter().any(|entry| entry.key == key) {
            return Err(PrimitiveError::invalid_arguments(format!(
                "scratchpad key {key:?} booked twice"
            )));
        }
        let offset = self.size.next_multiple_of(SCRATCHPAD_ALIGNMENT);
        let end = offset.checked_add(bytes).ok_or_else(|| {
            PrimitiveError::out_of_memory("booking scratchpad", bytes)
        })?;
        self.entries.push(ScratchpadEntry {
            key,
            offset,
            size: bytes,
        });
        self.size = end;
        Ok(())
    }

    /// Total bytes required, including alignment gaps.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: ScratchpadKey) -> Option<&ScratchpadEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn entries(&self) -> &[ScratchpadEntry] {
        &self.entries
    }
}

/// Hands out the booked regions of a concrete scratch buffer.
pub struct ScratchpadGrantor<'a> {
    registry: &'a ScratchpadRegistry,
    buffer: &'a mut [u8],
}

impl<'a> ScratchpadGrantor<'a> {
    pub fn new(registry: &'a ScratchpadRegistry, buffer: &'a mut [u8]) -> PrimResult<Self> {
        if buffer.len() < registry.size() {
            return Err(PrimitiveError::invalid_arguments(format!(
                "scratchpad holds {} bytes, {} required",
                buffer.len(),
                registry.size()
            )));
        }
        Ok(Self { registry, buffer })
    }

    /// Mutable view of the region booked under `key`.
    pub fn get(&mut self, key: ScratchpadKey) -> PrimResult<&mut [u8]> {
        let entry = self.registry.entry(key).ok_or_else(|| {
            PrimitiveError::execution(format!("scratchpad key {key:?} was never booked"))
        })?;
        Ok(&mut self.buffer[entry.offset..entry.offset + entry.size])
    }
}
