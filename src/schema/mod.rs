//! Schema Module
//!
//! Types describing the logical and physical shape of an array.
//!
//! ## Responsibilities
//! - Scalar datatypes, cell multiplicity and compressors per attribute
//! - Dimensions, domain and (for dense arrays) tile extents
//! - Cell order / tile order and the global order they induce
//! - Validation of every schema invariant before anything touches disk
//!
//! The same [`ArraySchema`] represents dense arrays, sparse arrays and keyed
//! metadata stores; see [`SchemaKind`].

mod array_schema;
pub mod order;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileError};

pub use array_schema::{ArraySchema, ArraySchemaBuilder, Attribute, Dimension, SchemaKind};
pub(crate) use array_schema::check_object_name;

/// Name of the implicit coordinates attribute of arrays
pub const COORDS: &str = "__coords";

/// Name of the implicit key attribute of metadata stores
pub const KEY: &str = "__key";

/// Size in bytes of one entry of a variable-length offsets buffer
pub const OFFSET_SIZE: usize = std::mem::size_of::<u64>();

// =============================================================================
// Datatype
// =============================================================================

/// Scalar type of attribute values and coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Char,
}

impl Datatype {
    /// Size of one value in bytes
    pub fn size(self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 | Datatype::Char => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// Whether the type can carry coordinates
    pub fn is_integer(self) -> bool {
        !matches!(self, Datatype::Float32 | Datatype::Float64 | Datatype::Char)
    }

    /// Inclusive range of values representable as coordinates
    pub(crate) fn coordinate_range(self) -> Option<(i64, i64)> {
        match self {
            Datatype::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Datatype::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Datatype::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Datatype::Int64 => Some((i64::MIN, i64::MAX)),
            Datatype::UInt8 => Some((0, u8::MAX as i64)),
            Datatype::UInt16 => Some((0, u16::MAX as i64)),
            Datatype::UInt32 => Some((0, u32::MAX as i64)),
            Datatype::UInt64 => Some((0, i64::MAX)),
            _ => None,
        }
    }

    /// The value written into dense cells that no fragment covers
    pub fn empty_value(self) -> Vec<u8> {
        match self {
            Datatype::Int8 => i8::MAX.to_le_bytes().to_vec(),
            Datatype::Int16 => i16::MAX.to_le_bytes().to_vec(),
            Datatype::Int32 => i32::MAX.to_le_bytes().to_vec(),
            Datatype::Int64 => i64::MAX.to_le_bytes().to_vec(),
            Datatype::UInt8 => u8::MAX.to_le_bytes().to_vec(),
            Datatype::UInt16 => u16::MAX.to_le_bytes().to_vec(),
            Datatype::UInt32 => u32::MAX.to_le_bytes().to_vec(),
            Datatype::UInt64 => u64::MAX.to_le_bytes().to_vec(),
            Datatype::Float32 => f32::MAX.to_le_bytes().to_vec(),
            Datatype::Float64 => f64::MAX.to_le_bytes().to_vec(),
            Datatype::Char => vec![i8::MAX as u8],
        }
    }

    /// Decode one little-endian integer of this type
    pub(crate) fn decode_coordinate(self, bytes: &[u8]) -> i64 {
        let mut buf = [0u8; 8];
        let n = self.size();
        buf[..n].copy_from_slice(&bytes[..n]);
        match self {
            Datatype::Int8 => bytes[0] as i8 as i64,
            Datatype::Int16 => i16::from_le_bytes([buf[0], buf[1]]) as i64,
            Datatype::Int32 => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64,
            Datatype::UInt8 => bytes[0] as i64,
            Datatype::UInt16 => u16::from_le_bytes([buf[0], buf[1]]) as i64,
            Datatype::UInt32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64,
            // Int64/UInt64 domains are validated to fit in i64
            _ => i64::from_le_bytes(buf),
        }
    }

    /// Append one coordinate encoded as this type
    pub(crate) fn encode_coordinate(self, value: i64, out: &mut Vec<u8>) {
        let bytes = value.to_le_bytes();
        out.extend_from_slice(&bytes[..self.size()]);
    }
}

// =============================================================================
// Layout / Compressor / Cell multiplicity
// =============================================================================

/// Linearization of multi-dimensional coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    RowMajor,
    ColMajor,
    /// Hilbert space-filling curve (sparse cell order only)
    Hilbert,
}

/// Per-tile compression kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compressor {
    None,
    Gzip,
    Zstd,
}

/// Number of values per cell for one attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellValNum {
    Fixed(u32),
    Var,
}

impl CellValNum {
    pub fn is_var(self) -> bool {
        matches!(self, CellValNum::Var)
    }
}

// =============================================================================
// Subarray
// =============================================================================

/// Hyper-rectangle of inclusive `[low, high]` ranges, one per dimension
pub type Subarray = Vec<(i64, i64)>;

/// Number of cells inside a hyper-rectangle, `InvalidArgument` if it does
/// not fit a `u64`
pub(crate) fn rect_cell_count(rect: &[(i64, i64)]) -> Result<u64> {
    rect.iter().try_fold(1u64, |count, &(lo, hi)| {
        let len = u64::try_from(hi as i128 - lo as i128 + 1).ok();
        len.and_then(|len| count.checked_mul(len)).ok_or_else(|| {
            TileError::InvalidArgument(format!("{:?} holds more than 2^64 cells", rect))
        })
    })
}

/// Intersection of two hyper-rectangles, `None` if disjoint
pub(crate) fn rect_intersection(a: &[(i64, i64)], b: &[(i64, i64)]) -> Option<Subarray> {
    a.iter()
        .zip(b)
        .map(|(&(alo, ahi), &(blo, bhi))| {
            let lo = alo.max(blo);
            let hi = ahi.min(bhi);
            (lo <= hi).then_some((lo, hi))
        })
        .collect()
}

/// Whether `coords` lies inside `rect`
pub(crate) fn rect_contains(rect: &[(i64, i64)], coords: &[i64]) -> bool {
    rect.iter()
        .zip(coords)
        .all(|(&(lo, hi), &c)| c >= lo && c <= hi)
}
