use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use derive_more::{Deref, Display, From};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    layout::{Block, ChannelBlocked, Format},
    num::DataType,
};

/// Maximum number of axes a descriptor can carry.
pub const MAX_DIMS: usize = 12;

#[derive(Debug, Error)]
pub enum DescError {
    #[error("descriptor has no axes; use `Desc::undef` for an undefined descriptor")]
    Undefined,
    #[error("descriptor rank {0} exceeds the maximum of {MAX_DIMS}")]
    Rank(usize),
    #[error("dims {0} contain a zero extent")]
    Empty(Dims),
    #[error("data type {0} is not supported")]
    Type(DataType),
    #[error("format {format} expects rank {expected}, got dims {dims}")]
    Format {
        format: Format,
        expected: usize,
        dims: Dims,
    },
    #[error("descriptor already has the concrete format {0}")]
    Concrete(Format),
    #[error("raw descriptor is malformed: {0}")]
    Raw(&'static str),
    #[error("buffer size of {format} with dims {dims} overflows")]
    Overflow { format: Format, dims: Dims },
}

/// Extents of a tensor, one per axis.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Dims(Arc<[usize]>);

impl From<Vec<usize>> for Dims {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Dims {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Dims {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl Dims {
    /// Converts into a fixed-size array if the rank is exactly `N`.
    #[inline]
    pub fn to_array<const N: usize>(&self) -> Option<[usize; N]> {
        self.0.as_ref().try_into().ok()
    }
}

/// Shape, element type and layout of a tensor, independent of any storage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Desc {
    dims: Dims,
    r#type: DataType,
    format: Format,
}

impl std::fmt::Display for Desc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}{}", self.format, self.r#type, self.dims)
    }
}

impl Desc {
    /// Creates a descriptor, rejecting anything that cannot describe live storage.
    pub fn new(
        dims: impl Into<Dims>,
        r#type: DataType,
        format: Format,
    ) -> Result<Self, DescError> {
        let dims = dims.into();
        match dims.len() {
            0 => return Err(DescError::Undefined),
            len if len > MAX_DIMS => return Err(DescError::Rank(len)),
            _ => {}
        }
        if dims.contains(&0) {
            return Err(DescError::Empty(dims));
        }
        if !r#type.is_supported() {
            return Err(DescError::Type(r#type));
        }
        if matches!(format, Format::Undef) {
            return Err(DescError::Undefined);
        }
        if let Some(expected) = format.rank().filter(|&rank| rank != dims.len()) {
            return Err(DescError::Format {
                format,
                expected,
                dims,
            });
        }
        if format
            .checked_size(&dims)
            .and_then(|size| size.checked_mul(r#type.size()))
            .is_none()
        {
            return Err(DescError::Overflow { format, dims });
        }
        Ok(Self {
            dims,
            r#type,
            format,
        })
    }

    /// Creates an `f32` descriptor.
    #[inline]
    pub fn f32(dims: impl Into<Dims>, format: Format) -> Result<Self, DescError> {
        Self::new(dims, DataType::F32, format)
    }

    /// An `f32` activation descriptor `[1, channels, height, width]` in the `nChwKc` format of `block`.
    #[inline]
    pub fn activation(
        block: Block,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self, DescError> {
        Self::f32([1, channels, height, width], block.activations())
    }

    /// The rank-0 descriptor. Never backs live storage.
    #[inline]
    pub fn undef() -> Self {
        Self::default()
    }

    /// Assigns a concrete format to a descriptor created with [`Format::Any`].
    pub fn with_format(self, format: Format) -> Result<Self, DescError> {
        match self.format {
            Format::Any => Self::new(self.dims, self.r#type, format),
            Format::Undef => Err(DescError::Undefined),
            concrete => Err(DescError::Concrete(concrete)),
        }
    }

    #[inline]
    pub fn is_undef(&self) -> bool {
        self.dims.is_empty()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Number of elements of the backing buffer, including layout padding.
    #[inline]
    pub fn size(&self) -> usize {
        self.format.size(&self.dims)
    }

    /// Size of the backing buffer in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.size() * self.r#type.size()
    }

    /// Linear address of a logical coordinate. See [`Format::offset`].
    #[inline]
    pub fn offset(&self, index: &[usize]) -> usize {
        self.format.offset(&self.dims, index)
    }

    /// The blocked geometry of a single-image `nChwKc` descriptor.
    pub fn channel_blocked(&self) -> Option<ChannelBlocked> {
        let block = self.format.block()?;
        match (self.format.is_activation(), self.dims.to_array()) {
            (true, Some([1, c, h, w])) => Some(ChannelBlocked::new(block, c, h, w)),
            _ => None,
        }
    }

    /// Converts into the fixed-size raw record. Fails if an extent does not fit in `i32`.
    pub fn raw(&self) -> Result<MemoryDesc, DescError> {
        let mut raw = MemoryDesc::zeroed();
        raw.ndims = self.dims.len() as i32;
        for (x, &d) in raw.dims.iter_mut().zip(self.dims.iter()) {
            *x = i32::try_from(d).map_err(|_| DescError::Raw("extent exceeds i32::MAX"))?;
        }
        raw.data_type = self.r#type.raw();
        Ok(raw)
    }

    /// Builds a descriptor from a raw record. The record carries no layout, so `format` supplies it.
    pub fn from_raw(raw: &MemoryDesc, format: Format) -> Result<Self, DescError> {
        let ndims = usize::try_from(raw.ndims).map_err(|_| DescError::Raw("negative ndims"))?;
        if ndims > MAX_DIMS {
            return Err(DescError::Rank(ndims));
        }
        let r#type =
            DataType::from_raw(raw.data_type).ok_or(DescError::Raw("unknown data type tag"))?;
        if ndims == 0 && r#type == DataType::Undef {
            return Ok(Self::undef());
        }
        let dims: Vec<usize> = raw.dims[..ndims]
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<Result<_, _>>()
            .map_err(|_| DescError::Raw("negative extent"))?;
        Self::new(dims, r#type, format)
    }
}

/// Raw memory descriptor record, laid out for C callers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryDesc {
    pub ndims: i32,
    pub dims: [i32; MAX_DIMS],
    pub data_type: i32,
}

unsafe impl Zeroable for MemoryDesc {}
unsafe impl Pod for MemoryDesc {}

#[cfg(test)]
mod tests {
    use super::{Desc, DescError, Dims, MAX_DIMS, MemoryDesc};
    use crate::loom::{
        layout::{Block, Format},
        num::DataType,
    };

    #[test]
    fn test_desc_rejects() {
        assert!(matches!(
            Desc::new([1, 8, 2, 2], DataType::U8, Format::NChw8c),
            Err(DescError::Type(DataType::U8))
        ));
        assert!(matches!(
            Desc::f32([1, 8, 2], Format::NChw8c),
            Err(DescError::Format { expected: 4, .. })
        ));
        assert!(matches!(
            Desc::f32(vec![1; MAX_DIMS + 1], Format::Blocked),
            Err(DescError::Rank(13))
        ));
        assert!(matches!(
            Desc::f32(Vec::new(), Format::Blocked),
            Err(DescError::Undefined)
        ));
        assert!(matches!(
            Desc::f32([1, 0, 2, 2], Format::NChw8c),
            Err(DescError::Empty(_))
        ));
        assert!(matches!(
            Desc::f32([4], Format::Undef),
            Err(DescError::Undefined)
        ));
    }

    #[test]
    fn test_desc_size() -> Result<(), DescError> {
        let desc = Desc::activation(Block::K8, 3, 2, 2)?;
        assert_eq!(desc.size(), 8 * 2 * 2);
        assert_eq!(desc.data_size(), 8 * 2 * 2 * 4);
        assert_ne!(desc.size(), 3 * 2 * 2);

        let desc = Desc::f32([5, 5, 3, 3], Format::OIhw16i16o)?;
        assert_eq!(desc.size(), 16 * 16 * 9);

        let geometry = Desc::activation(Block::K16, 20, 4, 6)?
            .channel_blocked()
            .expect("single image activation");
        assert_eq!((geometry.k, geometry.blocks), (16, 2));

        let batched = Desc::f32([2, 8, 4, 4], Format::NChw8c)?;
        assert!(batched.channel_blocked().is_none());
        Ok(())
    }

    #[test]
    fn test_with_format() -> Result<(), DescError> {
        let desc = Desc::f32([1, 3, 4, 4], Format::Any)?;
        assert_eq!(desc.size(), 0);
        let desc = desc.with_format(Format::NChw16c)?;
        assert_eq!(desc.size(), 16 * 16);
        assert!(matches!(
            desc.with_format(Format::NChw8c),
            Err(DescError::Concrete(Format::NChw16c))
        ));
        assert!(Desc::undef().is_undef());
        assert_eq!(Desc::undef().rank(), 0);
        Ok(())
    }

    #[test]
    fn test_raw() -> Result<(), DescError> {
        let desc = Desc::f32([5, 5, 3, 3], Format::Oihw)?;
        let raw = desc.raw()?;
        assert_eq!(raw.ndims, 4);
        assert_eq!(&raw.dims[..5], &[5, 5, 3, 3, 0]);
        assert_eq!(raw.data_type, 1);
        assert_eq!(Desc::from_raw(&raw, Format::Oihw)?, desc);

        let bytes = bytemuck::bytes_of(&raw);
        assert_eq!(bytes.len(), (2 + MAX_DIMS) * 4);

        let undef = Desc::from_raw(&MemoryDesc::default(), Format::Undef)?;
        assert!(undef.is_undef());

        let mut broken = raw;
        broken.dims[1] = -1;
        assert!(matches!(
            Desc::from_raw(&broken, Format::Oihw),
            Err(DescError::Raw(_))
        ));
        broken.ndims = 13;
        assert!(matches!(
            Desc::from_raw(&broken, Format::Oihw),
            Err(DescError::Rank(13))
        ));
        Ok(())
    }

    #[test]
    fn test_raw_overflow() -> Result<(), DescError> {
        let raw = MemoryDesc {
            ndims: MAX_DIMS as i32,
            dims: [i32::MAX; MAX_DIMS],
            data_type: DataType::F32.raw(),
        };
        assert!(matches!(
            Desc::from_raw(&raw, Format::Blocked),
            Err(DescError::Overflow { .. })
        ));
        assert!(matches!(
            Desc::f32([1, usize::MAX, 2, 2], Format::NChw8c),
            Err(DescError::Overflow { .. })
        ));

        let wide = Desc::f32([1usize << 31], Format::X)?;
        assert!(matches!(wide.raw(), Err(DescError::Raw(_))));
        Ok(())
    }

    #[test]
    fn test_dims_display() {
        let dims = Dims::from([1, 8, 2, 2]);
        assert_eq!(dims.to_string(), "[1, 8, 2, 2]");
        assert_eq!(dims.to_array(), Some([1, 8, 2, 2]));
        assert_eq!(dims.to_array::<3>(), None);
    }
}
