//! Payload element types
//!
//! Every dataset is generic over one [`DataElement`]. The trait ties a Rust
//! type to its [`DataType`] tag and defines how a stored value becomes a
//! unit-buffer float.

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::schema::DataType;

/// Scalar that can be stored in a dataset payload
pub trait DataElement: Pod + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// Tag recorded in descriptors and snapshots
    const DATA_TYPE: DataType;

    /// Value as written into a unit buffer
    fn to_unit(self) -> f32;

    /// Decode a little-endian byte payload
    fn decode(bytes: &[u8]) -> Result<Vec<Self>> {
        let size = std::mem::size_of::<Self>();
        if bytes.len() % size != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} payload of {} bytes is not a multiple of {size}",
                Self::DATA_TYPE,
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

macro_rules! impl_direct_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl DataElement for $ty {
                const DATA_TYPE: DataType = DataType::$tag;

                #[inline]
                fn to_unit(self) -> f32 {
                    self as f32
                }
            }
        )*
    };
}

impl_direct_element!(
    u32 => UInt,
    i32 => Int,
    i64 => LLInt,
    u64 => ULLInt,
    f32 => Float,
    f64 => Double,
);

impl DataElement for u8 {
    const DATA_TYPE: DataType = DataType::UChar;

    #[inline]
    fn to_unit(self) -> f32 {
        f32::from(self) * (1.0 / 256.0)
    }
}

impl DataElement for i8 {
    const DATA_TYPE: DataType = DataType::Char;

    #[inline]
    fn to_unit(self) -> f32 {
        f32::from(self) * (1.0 / 128.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_scaling() {
        assert_eq!(128u8.to_unit(), 0.5);
        assert_eq!((-64i8).to_unit(), -0.5);
        assert_eq!(255u8.to_unit(), 255.0 / 256.0);
    }

    #[test]
    fn test_direct_conversion() {
        assert_eq!(7u32.to_unit(), 7.0);
        assert_eq!((-3i64).to_unit(), -3.0);
        assert_eq!(0.25f64.to_unit(), 0.25);
        assert_eq!(<f32 as DataElement>::DATA_TYPE, DataType::Float);
    }

    #[test]
    fn test_decode_unaligned() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::cast_slice(&[1.5f32, -2.0]));
        let values = f32::decode(&bytes[1..]).unwrap();
        assert_eq!(values, vec![1.5, -2.0]);
    }

    #[test]
    fn test_decode_bad_length() {
        assert!(u32::decode(&[0, 1, 2]).is_err());
    }
}
