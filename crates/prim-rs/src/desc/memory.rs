//! Memory descriptors: logical dims, element type and physical layout of an operand.
//!
//! A descriptor whose format is [`Format::Any`] is a request for the resolved implementation to
//! pick a layout. Resolution fills it in on its own copy; caller descriptors are never mutated.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{PrimResult, PrimitiveError};

/// Upper bound on tensor rank accepted by descriptor constructors.
pub const MAX_NDIMS: usize = 12;

/// Inline storage for dims, strides and other per-axis metadata.
pub type Dims = SmallVec<[usize; 6]>;

/// Element types understood by descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Undef,
    F32,
    Bf16,
    F16,
    S32,
    S8,
    U8,
}

impl DataType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F32 | DataType::S32 => 4,
            DataType::Bf16 | DataType::F16 => 2,
            DataType::S8 | DataType::U8 => 1,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::S32 | DataType::S8 | DataType::U8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::Bf16 | DataType::F16)
    }

    /// Low-precision integer types that accumulate into `s32`.
    pub fn is_int8(self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Undef => "undef",
            DataType::F32 => "f32",
            DataType::Bf16 => "bf16",
            DataType::F16 => "f16",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Named layouts. Plain tags list axes from outermost to innermost; the `NC*c` tags additionally
/// block the channel axis, padding it up to the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatTag {
    Undef,
    Any,
    X,
    Nc,
    Cn,
    Ncw,
    Nwc,
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
    NChw8c,
    NChw16c,
}

impl FormatTag {
    pub const OI: FormatTag = FormatTag::Nc;
    pub const IO: FormatTag = FormatTag::Cn;
    pub const OIHW: FormatTag = FormatTag::Nchw;
    pub const GOIHW: FormatTag = FormatTag::Ncdhw;

    fn layout(self) -> Option<(&'static [usize], Option<InnerBlock>)> {
        let block = |size| Some(InnerBlock { axis: 1, size });
        match self {
            FormatTag::Undef | FormatTag::Any => None,
            FormatTag::X => Some((&[0], None)),
            FormatTag::Nc => Some((&[0, 1], None)),
            FormatTag::Cn => Some((&[1, 0], None)),
            FormatTag::Ncw => Some((&[0, 1, 2], None)),
            FormatTag::Nwc => Some((&[0, 2, 1], None)),
            FormatTag::Nchw => Some((&[0, 1, 2, 3], None)),
            FormatTag::Nhwc => Some((&[0, 2, 3, 1], None)),
            FormatTag::Ncdhw => Some((&[0, 1, 2, 3, 4], None)),
            FormatTag::Ndhwc => Some((&[0, 2, 3, 4, 1], None)),
            FormatTag::NChw8c => Some((&[0, 1, 2, 3], block(8))),
            FormatTag::NChw16c => Some((&[0, 1, 2, 3], block(16))),
        }
    }

    pub fn ndims(self) -> Option<usize> {
        self.layout().map(|(perm, _)| perm.len())
    }

    /// Plain channel-first tag for the given rank.
    pub fn plain_for_ndims(ndims: usize) -> FormatTag {
        match ndims {
            1 => FormatTag::X,
            2 => FormatTag::Nc,
            3 => FormatTag::Ncw,
            4 => FormatTag::Nchw,
            5 => FormatTag::Ncdhw,
            _ => FormatTag::Undef,
        }
    }

    /// Plain channel-last tag for the given rank.
    pub fn channels_last_for_ndims(ndims: usize) -> FormatTag {
        match ndims {
            1 => FormatTag::X,
            2 => FormatTag::Nc,
            3 => FormatTag::Nwc,
            4 => FormatTag::Nhwc,
            5 => FormatTag::Ndhwc,
            _ => FormatTag::Undef,
        }
    }
}

/// A single blocked axis stored innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InnerBlock {
    pub axis: usize,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockingDesc {
    /// Stride of each axis in elements, measured in units of its outer (per-block) index.
    pub strides: Dims,
    pub inner_block: Option<InnerBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Undef,
    Any,
    Blocked(BlockingDesc),
}

/// Logical shape, element type and layout of a single operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryDesc {
    dims: Dims,
    padded_dims: Dims,
    data_type: DataType,
    format: Format,
}

impl Default for MemoryDesc {
    fn default() -> Self {
        Self::zero()
    }
}

impl MemoryDesc {
    /// Descriptor of an absent operand (e.g. no bias).
    pub fn zero() -> Self {
        Self {
            dims: Dims::new(),
            padded_dims: Dims::new(),
            data_type: DataType::Undef,
            format: Format::Undef,
        }
    }

    /// Descriptor whose layout is left to the resolved implementation.
    pub fn any(dims: &[usize], data_type: DataType) -> PrimResult<Self> {
        Self::new(dims, data_type, FormatTag::Any)
    }

    pub fn new(dims: &[usize], data_type: DataType, tag: FormatTag) -> PrimResult<Self> {
        if dims.is_empty() || dims.len() > MAX_NDIMS {
            return Err(PrimitiveError::invalid_arguments(format!(
                "memory descriptor rank {} outside 1..={MAX_NDIMS}",
                dims.len()
            )));
        }
        if data_type == DataType::Undef {
            return Err(PrimitiveError::invalid_arguments(
                "memory descriptor requires a data type",
            ));
        }
        let md = Self {
            dims: Dims::from_slice(dims),
            padded_dims: Dims::from_slice(dims),
            data_type,
            format: Format::Any,
        }
        .checked()?;
        match tag {
            FormatTag::Any => Ok(md),
            FormatTag::Undef => Err(PrimitiveError::invalid_arguments(
                "memory descriptor format tag is undefined",
            )),
            tag => md.with_format_tag(tag),
        }
    }

    /// Plain descriptor with caller-provided strides (in elements).
    pub fn with_strides(dims: &[usize], data_type: DataType, strides: &[usize]) -> PrimResult<Self> {
        if strides.len() != dims.len() {
            return Err(PrimitiveError::invalid_arguments(format!(
                "{} strides given for rank {}",
                strides.len(),
                dims.len()
            )));
        }
        let mut md = Self::any(dims, data_type)?;
        md.format = Format::Blocked(BlockingDesc {
            strides: Dims::from_slice(strides),
            inner_block: None,
        });
        md.checked()
    }

    /// Same logical dims stored with `padded_dims`, laid out in this descriptor's plain layout
    /// (channel-first when still `any`).
    pub fn with_padded_dims(&self, padded_dims: &[usize]) -> PrimResult<Self> {
        if padded_dims.len() != self.ndims()
            || padded_dims.iter().zip(&self.dims).any(|(&padded, &dim)| padded < dim)
        {
            return Err(PrimitiveError::invalid_arguments(format!(
                "padded dims {padded_dims:?} do not cover {self}"
            )));
        }
        let ndims = self.ndims();
        let tag = if self.is_any() {
            FormatTag::plain_for_ndims(ndims)
        } else {
            [
                FormatTag::plain_for_ndims(ndims),
                FormatTag::channels_last_for_ndims(ndims),
            ]
            .into_iter()
            .find(|&tag| tag != FormatTag::Undef && self.matches_tag(tag))
            .ok_or_else(|| {
                PrimitiveError::invalid_arguments(format!("cannot pad blocked descriptor {self}"))
            })?
        };
        let unpadded = Self {
            dims: self.dims.clone(),
            padded_dims: Dims::from_slice(padded_dims),
            data_type: self.data_type,
            format: Format::Any,
        };
        unpadded.with_format_tag(tag)
    }

    /// Materialises `tag` as a concrete blocked layout over this descriptor's dims.
    pub fn with_format_tag(&self, tag: FormatTag) -> PrimResult<Self> {
        let (perm, inner_block) = tag.layout().ok_or_else(|| {
            PrimitiveError::invalid_arguments(format!("format tag {tag:?} has no layout"))
        })?;
        if perm.len() != self.ndims() {
            return Err(PrimitiveError::invalid_arguments(format!(
                "format tag {tag:?} expects rank {}, descriptor has rank {}",
                perm.len(),
                self.ndims()
            )));
        }

        let overflow = || self.overflow();
        let mut padded_dims = self.padded_dims.clone();
        if let Some(block) = inner_block {
            padded_dims[block.axis] = padded_dims[block.axis]
                .div_ceil(block.size)
                .checked_mul(block.size)
                .ok_or_else(overflow)?;
        }

        let mut strides: Dims = SmallVec::from_elem(0, self.ndims());
        let mut stride = inner_block.map_or(1, |block| block.size);
        for &axis in perm.iter().rev() {
            strides[axis] = stride;
            let outer = match inner_block {
                Some(block) if block.axis == axis => padded_dims[axis] / block.size,
                _ => padded_dims[axis],
            };
            stride = stride.checked_mul(outer.max(1)).ok_or_else(overflow)?;
        }

        Self {
            dims: self.dims.clone(),
            padded_dims,
            data_type: self.data_type,
            format: Format::Blocked(BlockingDesc {
                strides,
                inner_block,
            }),
        }
        .checked()
    }

    fn overflow(&self) -> PrimitiveError {
        PrimitiveError::invalid_arguments(format!(
            "dims {:?} of {} overflow the address space",
            self.padded_dims.as_slice(),
            self.data_type
        ))
    }

    /// Rejects descriptors whose element count or storage size does not fit in `usize`.
    fn checked(self) -> PrimResult<Self> {
        let elems = checked_product(&self.padded_dims)
            .and_then(|elems| elems.checked_mul(self.data_type.size_in_bytes()));
        match (elems, self.storage_bytes()) {
            (Some(_), Some(_)) => Ok(self),
            _ => Err(self.overflow()),
        }
    }

    /// Bytes spanned by the layout, `None` on overflow.
    fn storage_bytes(&self) -> Option<usize> {
        let Some(blocking) = self.blocking() else {
            return Some(0);
        };
        if self.is_zero() || self.has_zero_dim() {
            return Some(0);
        }
        let block_elems = blocking.inner_block.map_or(1, |block| block.size);
        let mut max_offset = 0usize;
        for axis in 0..self.ndims() {
            let outer = match blocking.inner_block {
                Some(block) if block.axis == axis => self.padded_dims[axis] / block.size,
                _ => self.padded_dims[axis],
            };
            let span = outer.saturating_sub(1).checked_mul(blocking.strides[axis])?;
            max_offset = max_offset.checked_add(span)?;
        }
        max_offset
            .checked_add(block_elems)?
            .checked_mul(self.data_type.size_in_bytes())
    }

    /// Replaces a [`Format::Any`] layout with `tag`; concrete layouts are left untouched.
    pub fn init_format_if_any(&mut self, tag: FormatTag) -> PrimResult<()> {
        if self.is_any() {
            *self = self.with_format_tag(tag)?;
        }
        Ok(())
    }

    /// Same layout with a different element type.
    pub fn with_data_type(&self, data_type: DataType) -> Self {
        Self {
            data_type,
            ..self.clone()
        }
    }

    /// Same dims and element type with the layout reset to [`Format::Any`].
    pub fn to_any(&self) -> Self {
        Self {
            dims: self.dims.clone(),
            padded_dims: self.dims.clone(),
            data_type: self.data_type,
            format: Format::Any,
        }
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn padded_dims(&self) -> &[usize] {
        &self.padded_dims
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn blocking(&self) -> Option<&BlockingDesc> {
        match &self.format {
            Format::Blocked(blocking) => Some(blocking),
            _ => None,
        }
    }

    /// Absent operand.
    pub fn is_zero(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn is_any(&self) -> bool {
        matches!(self.format, Format::Any)
    }

    pub fn has_zero_dim(&self) -> bool {
        self.dims.iter().any(|&dim| dim == 0)
    }

    pub fn is_plain(&self) -> bool {
        self.blocking()
            .is_some_and(|blocking| blocking.inner_block.is_none())
    }

    pub fn nelems(&self, with_padding: bool) -> usize {
        if self.is_zero() {
            return 0;
        }
        let dims = if with_padding {
            &self.padded_dims
        } else {
            &self.dims
        };
        checked_product(dims).unwrap_or(usize::MAX)
    }

    /// Number of bytes a buffer for this descriptor must hold. Zero for absent operands,
    /// zero-dim operands and descriptors without a concrete layout.
    pub fn size(&self) -> usize {
        self.storage_bytes().unwrap_or(usize::MAX)
    }

    pub fn is_dense(&self) -> bool {
        self.blocking().is_some()
            && self.size() == self.nelems(true) * self.data_type.size_in_bytes()
    }

    /// Element offset of a logical index.
    pub fn offset(&self, index: &[usize]) -> usize {
        let Some(blocking) = self.blocking() else {
            return 0;
        };
        let mut offset = 0;
        for (axis, &idx) in index.iter().enumerate() {
            match blocking.inner_block {
                Some(block) if block.axis == axis => {
                    offset += (idx / block.size) * blocking.strides[axis] + idx % block.size;
                }
                _ => offset += idx * blocking.strides[axis],
            }
        }
        offset
    }

    pub fn matches_tag(&self, tag: FormatTag) -> bool {
        match self.with_format_tag(tag) {
            Ok(expected) => expected.format == self.format,
            Err(_) => false,
        }
    }

    /// Same dims and layout, ignoring element type.
    pub fn similar_to(&self, other: &MemoryDesc) -> bool {
        self.dims == other.dims && self.padded_dims == other.padded_dims && self.format == other.format
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("undef::");
        }
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        let layout = match &self.format {
            Format::Undef => "undef".to_string(),
            Format::Any => "any".to_string(),
            Format::Blocked(blocking) => {
                let strides = blocking
                    .strides
                    .iter()
                    .map(|stride| stride.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                match blocking.inner_block {
                    Some(block) => format!("blocked[{strides}]:{}b{}", block.axis, block.size),
                    None => format!("blocked[{strides}]"),
                }
            }
        };
        write!(f, "{}:{layout}:{dims}", self.data_type)
    }
}

fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn nhwc_strides_are_channel_innermost() {
        let md = MemoryDesc::new(&[2, 3, 4, 5], DataType::F32, FormatTag::Nhwc).unwrap();
        let blocking = md.blocking().unwrap();
        assert_eq!(blocking.strides.as_slice(), &[60, 1, 15, 3]);
        assert_eq!(md.size(), 2 * 3 * 4 * 5 * 4);
        assert!(md.matches_tag(FormatTag::Nhwc));
        assert!(!md.matches_tag(FormatTag::Nchw));
    }

    #[test]
    fn blocked_layout_pads_channels() {
        let md = MemoryDesc::new(&[1, 3, 2, 2], DataType::F32, FormatTag::NChw8c).unwrap();
        assert_eq!(md.padded_dims(), &[1, 8, 2, 2]);
        assert_eq!(md.nelems(false), 12);
        assert_eq!(md.nelems(true), 32);
        assert_eq!(md.size(), 32 * 4);
        assert_eq!(md.offset(&[0, 2, 1, 1]), 3 * 8 + 2);
    }

    #[test]
    fn zero_dim_descriptor_has_no_storage() {
        let md = MemoryDesc::new(&[0, 3], DataType::F32, FormatTag::Nc).unwrap();
        assert!(md.has_zero_dim());
        assert_eq!(md.size(), 0);
        assert!(!md.is_zero());
    }

    #[test]
    fn any_format_has_no_size_until_resolved() {
        let md = MemoryDesc::any(&[4, 4], DataType::S8).unwrap();
        assert!(md.is_any());
        assert_eq!(md.size(), 0);
        let resolved = md.with_format_tag(FormatTag::Nc).unwrap();
        assert_eq!(resolved.size(), 16);
    }

    #[test]
    fn oversized_dims_are_invalid_arguments() {
        let huge = 1usize << 40;
        let err = MemoryDesc::new(&[huge, huge], DataType::F32, FormatTag::Nc).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArguments);
        assert!(MemoryDesc::any(&[huge, huge], DataType::F32).is_err());
        // Fits as an element count but not once multiplied by the element size.
        assert!(MemoryDesc::new(&[usize::MAX / 2], DataType::F32, FormatTag::X).is_err());
        assert!(MemoryDesc::with_strides(&[2, 2], DataType::F32, &[usize::MAX, 1]).is_err());
        let channels = MemoryDesc::any(&[1, usize::MAX - 2, 1, 1], DataType::U8).unwrap();
        assert!(channels.with_format_tag(FormatTag::NChw16c).is_err());
    }

    #[test]
    fn padded_vector_keeps_logical_extent() {
        let bias = MemoryDesc::any(&[3], DataType::F32).unwrap();
        let padded = bias.with_padded_dims(&[8]).unwrap();
        assert_eq!(padded.dims(), &[3]);
        assert_eq!(padded.padded_dims(), &[8]);
        assert!(padded.matches_tag(FormatTag::X));
        assert_eq!(padded.size(), 8 * 4);
        assert!(bias.with_padded_dims(&[2]).is_err());
    }

    #[test]
    fn rejects_rank_mismatched_tag() {
        let md = MemoryDesc::any(&[4, 4], DataType::F32).unwrap();
        assert!(md.with_format_tag(FormatTag::Nchw).is_err());
    }
}
