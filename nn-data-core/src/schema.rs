//! Dataset descriptors: element types, attribute bits and dimensions

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Element type of a dataset's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit unsigned integer
    UInt,

    /// 32-bit signed integer
    Int,

    /// 64-bit signed integer
    LLInt,

    /// 64-bit unsigned integer
    ULLInt,

    /// 32-bit floating point
    Float,

    /// 64-bit floating point
    Double,

    /// Packed 8-bit RGB pixels
    RGB8,

    /// Packed 16-bit RGB pixels
    RGB16,

    /// 8-bit unsigned integer, scaled by 1/256 on input
    UChar,

    /// 8-bit signed integer, scaled by 1/128 on input
    Char,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::UChar | DataType::Char => 1,
            DataType::UInt | DataType::Int | DataType::Float => 4,
            DataType::LLInt | DataType::ULLInt | DataType::Double => 8,
            DataType::RGB8 => 3,
            DataType::RGB16 => 6,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Bitset of dataset attributes
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u32 {
        /// Only nonzero entries are stored
        const SPARSE = 0x1;
        /// Stored entries carry no values, presence means 1
        const BOOLEAN = 0x2;
        /// Compressed payload
        const COMPRESSED = 0x4;
        /// Recurrent (sequence) data
        const RECURRENT = 0x8;
        /// Mutable payload
        const MUTABLE = 0x10;
        /// Absent sparse entries contribute nothing to error or delta
        const SPARSE_IGNORE_ZERO = 0x20;
        /// Examples map through an index into unique rows
        const INDEXED = 0x40;
        /// Each example carries a weight
        const WEIGHTED = 0x80;
    }
}

impl Attributes {
    /// No attributes: dense, direct, unweighted
    pub const NONE: Attributes = Attributes::empty();

    /// Attributes the factory can build
    pub const SUPPORTED: Attributes = Attributes::SPARSE
        .union(Attributes::BOOLEAN)
        .union(Attributes::SPARSE_IGNORE_ZERO)
        .union(Attributes::INDEXED)
        .union(Attributes::WEIGHTED);

    const NAMES: [(Attributes, &'static str); 8] = [
        (Self::SPARSE, "Sparse"),
        (Self::BOOLEAN, "Boolean"),
        (Self::COMPRESSED, "Compressed"),
        (Self::RECURRENT, "Recurrent"),
        (Self::MUTABLE, "Mutable"),
        (Self::SPARSE_IGNORE_ZERO, "SparseIgnoreZero"),
        (Self::INDEXED, "Indexed"),
        (Self::WEIGHTED, "Weighted"),
    ];

    /// Shorthand for `contains(SPARSE)`
    pub const fn is_sparse(self) -> bool {
        self.contains(Self::SPARSE)
    }

    /// Shorthand for `contains(BOOLEAN)`
    pub const fn is_boolean(self) -> bool {
        self.contains(Self::BOOLEAN)
    }

    /// Shorthand for `contains(INDEXED)`
    pub const fn is_indexed(self) -> bool {
        self.contains(Self::INDEXED)
    }

    /// Shorthand for `contains(WEIGHTED)`
    pub const fn is_weighted(self) -> bool {
        self.contains(Self::WEIGHTED)
    }

    /// Shorthand for `contains(SPARSE_IGNORE_ZERO)`
    pub const fn ignores_zero(self) -> bool {
        self.contains(Self::SPARSE_IGNORE_ZERO)
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::NONE
    }
}

// Stored as the raw integer so unknown bits survive a round trip and are
// rejected by validation instead of by the decoder
impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attributes({self})")
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Dense");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        Ok(())
    }
}

/// Shape of one example
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Number of meaningful axes, 1 to 3
    pub dimensions: u32,
    /// Extent along x
    pub width: usize,
    /// Extent along y
    pub height: usize,
    /// Extent along z
    pub length: usize,
}

impl Dimensions {
    /// One-dimensional shape
    pub fn new_1d(width: usize) -> Self {
        Self { dimensions: 1, width, height: 1, length: 1 }
    }

    /// Two-dimensional shape
    pub fn new_2d(width: usize, height: usize) -> Self {
        Self { dimensions: 2, width, height, length: 1 }
    }

    /// Three-dimensional shape
    pub fn new_3d(width: usize, height: usize, length: usize) -> Self {
        Self { dimensions: 3, width, height, length }
    }

    /// Flat element count per example, saturating on overflow
    pub fn stride(&self) -> usize {
        self.checked_stride().unwrap_or(usize::MAX)
    }

    /// Flat element count per example, `None` if it overflows
    pub fn checked_stride(&self) -> Option<usize> {
        self.width.checked_mul(self.height)?.checked_mul(self.length)
    }

    /// Flat offset of `(x, y, z)` within an example
    pub fn offset(&self, x: usize, y: usize, z: usize) -> Result<usize> {
        if x >= self.width || y >= self.height || z >= self.length {
            return Err(Error::OutOfBounds(format!(
                "({x}, {y}, {z}) outside {}x{}x{}",
                self.width, self.height, self.length
            )));
        }
        Ok(x + self.width * (y + self.height * z))
    }

    fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.dimensions) {
            return Err(Error::InvalidArgument(format!(
                "dimension count must be 1 to 3, got {}",
                self.dimensions
            )));
        }
        match self.checked_stride() {
            None => Err(Error::InvalidArgument(format!(
                "dimensions {}x{}x{} overflow",
                self.width, self.height, self.length
            ))),
            Some(0) => Err(Error::InvalidArgument("dimensions must be nonzero".into())),
            Some(_) => Ok(()),
        }
    }
}

/// Everything the factory needs to build a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Dataset name
    pub name: String,

    /// Element type
    pub data_type: DataType,

    /// Attribute bits
    pub attributes: Attributes,

    /// Shape of one example
    pub dimensions: Dimensions,

    /// Number of examples
    pub examples: usize,

    /// Number of distinct stored rows for indexed datasets, defaults to `examples`
    #[serde(default)]
    pub unique_examples: Option<usize>,

    /// Fraction of stored entries for sparse datasets, in (0, 1]
    pub sparse_density: f32,
}

impl DatasetDescriptor {
    /// Dense descriptor with a one-dimensional shape
    pub fn dense(name: impl Into<String>, data_type: DataType, width: usize, examples: usize) -> Self {
        Self {
            name: name.into(),
            data_type,
            attributes: Attributes::NONE,
            dimensions: Dimensions::new_1d(width),
            examples,
            unique_examples: None,
            sparse_density: 1.0,
        }
    }

    /// Sparse descriptor with a one-dimensional shape
    pub fn sparse(
        name: impl Into<String>,
        data_type: DataType,
        width: usize,
        examples: usize,
        sparse_density: f32,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            attributes: Attributes::SPARSE,
            dimensions: Dimensions::new_1d(width),
            examples,
            unique_examples: None,
            sparse_density,
        }
    }

    /// Add attribute bits
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes |= attributes;
        self
    }

    /// Set the number of unique rows
    #[must_use]
    pub fn with_unique_examples(mut self, unique_examples: usize) -> Self {
        self.unique_examples = Some(unique_examples);
        self
    }

    /// Distinct stored rows
    pub fn unique_examples(&self) -> usize {
        self.unique_examples.unwrap_or(self.examples)
    }

    /// Capacity of the sparse entry arrays
    pub fn sparse_data_size(&self) -> usize {
        let dense = self.unique_examples() as f64 * self.dimensions.stride() as f64;
        (dense * f64::from(self.sparse_density)).ceil() as usize
    }

    /// Smallest number of bytes a snapshot of this descriptor holds, `None` on overflow
    ///
    /// Counts every payload array at its allocated length: dense rows, or
    /// sparse offsets plus the full entry capacity, and the index and weights.
    pub fn payload_bytes(&self) -> Option<usize> {
        let unique = self.unique_examples();
        let mut bytes = if self.attributes.is_sparse() {
            let entries = self.sparse_data_size();
            let values = if self.attributes.is_boolean() { 0 } else { self.data_type.size() };
            unique
                .checked_mul(16)?
                .checked_add(entries.checked_mul(4 + values)?)?
        } else {
            unique
                .checked_mul(self.dimensions.checked_stride()?)?
                .checked_mul(self.data_type.size())?
        };
        if self.attributes.is_indexed() {
            bytes = bytes.checked_add(self.examples.checked_mul(4)?)?;
        }
        if self.attributes.is_weighted() {
            bytes = bytes.checked_add(self.examples.checked_mul(4)?)?;
        }
        Some(bytes)
    }

    /// Whether the factory can build a dataset from this descriptor
    pub fn is_supported(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check attributes, type and sizes, reporting the first problem found
    pub fn validate(&self) -> Result<()> {
        let unsupported = self.attributes.difference(Attributes::SUPPORTED);
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedAttributes(format!(
                "{} (dataset {})",
                unsupported, self.name
            )));
        }
        let sparse_only = Attributes::BOOLEAN | Attributes::SPARSE_IGNORE_ZERO;
        if !self.attributes.is_sparse() && !(self.attributes & sparse_only).is_empty() {
            return Err(Error::UnsupportedAttributes(format!(
                "{} requires Sparse (dataset {})",
                self.attributes & sparse_only,
                self.name
            )));
        }
        if matches!(self.data_type, DataType::RGB8 | DataType::RGB16) {
            return Err(Error::UnsupportedDataType(format!(
                "{} (dataset {})",
                self.data_type, self.name
            )));
        }
        self.dimensions.validate()?;
        let unique = self.unique_examples();
        if unique > self.examples || (unique == 0 && self.examples > 0) {
            return Err(Error::InvalidArgument(format!(
                "unique example count {unique} incompatible with {} examples",
                self.examples
            )));
        }
        if unique != self.examples && !self.attributes.is_indexed() {
            return Err(Error::InvalidArgument(format!(
                "dataset {} has {unique} unique rows for {} examples but is not indexed",
                self.name, self.examples
            )));
        }
        if self.attributes.is_sparse()
            && !(self.sparse_density > 0.0 && self.sparse_density <= 1.0)
        {
            return Err(Error::InvalidArgument(format!(
                "sparse density must be in (0, 1], got {}",
                self.sparse_density
            )));
        }
        if self.payload_bytes().is_none() {
            return Err(Error::InvalidArgument(format!(
                "payload of {} rows x {} features overflows (dataset {})",
                unique,
                self.dimensions.stride(),
                self.name
            )));
        }
        Ok(())
    }
}
