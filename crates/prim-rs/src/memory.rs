//! Host buffers bound to a [`MemoryDesc`].

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use half::{bf16, f16};

use crate::desc::{DataType, MemoryDesc};
use crate::error::{PrimResult, PrimitiveError};

/// Engine-allocated storage for one operand. Clones share the same buffer.
#[derive(Clone)]
pub struct Memory {
    desc: MemoryDesc,
    buffer: Arc<RwLock<Vec<u8>>>,
}

impl Memory {
    /// Allocates a zero-filled buffer large enough for `desc`.
    pub fn new(desc: &MemoryDesc) -> PrimResult<Self> {
        if desc.is_any() {
            return Err(PrimitiveError::invalid_arguments(
                "cannot allocate memory for a descriptor with format any",
            ));
        }
        let bytes = desc.size();
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| PrimitiveError::out_of_memory("allocating memory", bytes))?;
        buffer.resize(bytes, 0);
        Ok(Self {
            desc: desc.clone(),
            buffer: Arc::new(RwLock::new(buffer)),
        })
    }

    /// Allocates `desc` and fills its logical elements, in row-major index order, from `values`.
    pub fn from_f32(desc: &MemoryDesc, values: &[f32]) -> PrimResult<Self> {
        let memory = Self::new(desc)?;
        memory.write_f32(values)?;
        Ok(memory)
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    pub fn len_bytes(&self) -> usize {
        self.read_bytes().len()
    }

    pub fn read_bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.buffer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_bytes(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buffer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `true` when both handles refer to the same buffer.
    pub fn shares_buffer(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Logical elements converted to `f32`, in row-major index order.
    pub fn read_f32(&self) -> Vec<f32> {
        let bytes = self.read_bytes();
        let data_type = self.desc.data_type();
        element_offsets(&self.desc)
            .into_iter()
            .map(|offset| load_f32(&bytes, data_type, offset))
            .collect()
    }

    /// Stores `values` into the logical elements; padding is left untouched.
    pub fn write_f32(&self, values: &[f32]) -> PrimResult<()> {
        let offsets = element_offsets(&self.desc);
        if offsets.len() != values.len() {
            return Err(PrimitiveError::invalid_arguments(format!(
                "expected {} values for {}, got {}",
                offsets.len(),
                self.desc,
                values.len()
            )));
        }
        let data_type = self.desc.data_type();
        let mut bytes = self.write_bytes();
        for (offset, value) in offsets.into_iter().zip(values) {
            store_f32(&mut bytes, data_type, offset, *value);
        }
        Ok(())
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("desc", &format_args!("{}", self.desc))
            .field("bytes", &self.len_bytes())
            .finish()
    }
}

/// Physical element offset of every logical index of `desc`, in row-major index order.
pub fn element_offsets(desc: &MemoryDesc) -> Vec<usize> {
    let nelems = desc.nelems(false);
    if nelems == 0 || desc.blocking().is_none() {
        return Vec::new();
    }
    let dims = desc.dims();
    let mut index = vec![0usize; dims.len()];
    let mut offsets = Vec::with_capacity(nelems);
    for _ in 0..nelems {
        offsets.push(desc.offset(&index));
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    offsets
}

/// Reads element `offset` of a buffer holding `data_type` values, widened to `f32`.
pub fn load_f32(bytes: &[u8], data_type: DataType, offset: usize) -> f32 {
    let size = data_type.size_in_bytes();
    let start = offset * size;
    let Some(raw) = bytes.get(start..start + size) else {
        return 0.0;
    };
    match data_type {
        DataType::F32 => f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
        DataType::S32 => i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as f32,
        DataType::Bf16 => bf16::from_ne_bytes([raw[0], raw[1]]).to_f32(),
        DataType::F16 => f16::from_ne_bytes([raw[0], raw[1]]).to_f32(),
        DataType::S8 => f32::from(raw[0] as i8),
        DataType::U8 => f32::from(raw[0]),
        DataType::Undef => 0.0,
    }
}

/// Writes `value` into element `offset`, rounding and saturating for integer types.
pub fn store_f32(bytes: &mut [u8], data_type: DataType, offset: usize, value: f32) {
    let size = data_type.size_in_bytes();
    let start = offset * size;
    let Some(raw) = bytes.get_mut(start..start + size) else {
        return;
    };
    match data_type {
        DataType::F32 => raw.copy_from_slice(&value.to_ne_bytes()),
        DataType::S32 => raw.copy_from_slice(&(value.round_ties_even() as i32).to_ne_bytes()),
        DataType::Bf16 => raw.copy_from_slice(&bf16::from_f32(value).to_ne_bytes()),
        DataType::F16 => raw.copy_from_slice(&f16::from_f32(value).to_ne_bytes()),
        DataType::S8 => raw[0] = (value.round_ties_even() as i8) as u8,
        DataType::U8 => raw[0] = value.round_ties_even() as u8,
        DataType::Undef => {}
    }
}
