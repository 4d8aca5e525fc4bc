use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of a tensor. Discriminants match the tags of the raw descriptor record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum DataType {
    #[default]
    #[display("undef")]
    Undef = 0,
    #[display("f32")]
    F32 = 1,
    #[display("s32")]
    S32 = 2,
    #[display("s16")]
    S16 = 4,
    #[display("s8")]
    S8 = 5,
    #[display("u8")]
    U8 = 6,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Undef => 0,
            DataType::F32 => 4,
            DataType::S32 => 4,
            DataType::S16 => 2,
            DataType::S8 => 1,
            DataType::U8 => 1,
        }
    }

    /// Returns `true` if tensors of this type can be allocated and computed on.
    pub const fn is_supported(self) -> bool {
        matches!(self, DataType::F32)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self as i32
    }

    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DataType::Undef),
            1 => Some(DataType::F32),
            2 => Some(DataType::S32),
            4 => Some(DataType::S16),
            5 => Some(DataType::S8),
            6 => Some(DataType::U8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DataType;

    #[test]
    fn test_raw_tags() {
        for r#type in [
            DataType::Undef,
            DataType::F32,
            DataType::S32,
            DataType::S16,
            DataType::S8,
            DataType::U8,
        ] {
            assert_eq!(DataType::from_raw(r#type.raw()), Some(r#type));
        }
        assert_eq!(DataType::from_raw(3), None);
        assert_eq!(DataType::F32.raw(), 1);
        assert!(DataType::F32.is_supported());
        assert!(!DataType::U8.is_supported());
    }
}
