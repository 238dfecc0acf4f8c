//! Fragment Module
//!
//! A fragment is an immutable snapshot of the cells written by one write
//! session (or one consolidation run).
//!
//! ## Tile File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Tile 0 (compressed with the column's compressor)        │
//! ├─────────────────────────────────────────────────────────┤
//! │ Tile 1                                                  │
//! │ ... one entry per tile, located via the book-keeping    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! Variable-size columns keep two series: `<name>.tdb` holds per-cell `u64`
//! offsets relative to the start of the matching value tile in `<name>_var.tdb`.

mod cursor;
mod reader;
mod writer;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TileError};
use crate::schema::{Subarray, OFFSET_SIZE};

pub(crate) use cursor::FragmentCursor;
pub use reader::FragmentReader;
pub use writer::FragmentWriter;

// =============================================================================
// Shared Constants (used by writer, reader, cursor)
// =============================================================================

/// Magic bytes identifying a book-keeping record
pub(crate) const BOOK_KEEPING_MAGIC: &[u8; 4] = b"TSBK";

/// Book-keeping file inside every fragment directory
pub(crate) const BOOK_KEEPING_FILE: &str = "__book_keeping.tdb";

const FRAGMENT_PREFIX: &str = "__frag_";
const TEMP_PREFIX: &str = ".__tmp_frag_";

// =============================================================================
// Fragment Identity
// =============================================================================

/// Creation-order identity of a fragment.
///
/// Fragments order by `(seq, gen)`. Writes take a fresh `seq` with `gen` 0;
/// a consolidated fragment takes the `seq` of the newest fragment it absorbed
/// and bumps `gen`, so anything written later still sorts after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentId {
    pub seq: u64,
    pub gen: u32,
}

impl FragmentId {
    /// Directory name of a published fragment
    pub fn dir_name(&self) -> String {
        format!("{}{:012}_{:04}", FRAGMENT_PREFIX, self.seq, self.gen)
    }

    /// Directory name while the fragment is being built
    pub(crate) fn temp_dir_name(&self) -> String {
        format!("{}{:012}_{:04}", TEMP_PREFIX, self.seq, self.gen)
    }

    /// "__frag_000000000042_0001" → Some(FragmentId { seq: 42, gen: 1 })
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(FRAGMENT_PREFIX)?;
        let (seq, gen) = rest.split_once('_')?;
        Some(Self {
            seq: seq.parse().ok()?,
            gen: gen.parse().ok()?,
        })
    }

    /// Whether a directory entry is a leftover in-progress fragment
    pub(crate) fn is_temp_name(name: &str) -> bool {
        name.starts_with(TEMP_PREFIX)
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

// =============================================================================
// Book-keeping
// =============================================================================

/// Per-fragment record of cell counts and tile boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookKeeping {
    /// Total cells in the fragment
    pub cell_num: u64,
    /// Bounding box of all cells (arrays only)
    pub non_empty_domain: Option<Subarray>,
    /// One entry per tile, shared by every column
    pub tiles: Vec<TileInfo>,
    /// One entry per stored column, in column order
    pub columns: Vec<ColumnTiles>,
}

/// Logical description of one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileInfo {
    pub cell_num: u64,
    /// Minimum bounding rectangle of the tile's coordinates (arrays only)
    pub mbr: Option<Subarray>,
    /// Dense tiles: the clipped space tile and the rank of the first cell
    pub dense: Option<DenseTile>,
}

/// Placement of a dense tile: its cells are `cell_num` consecutive cells of
/// `rect` in cell order, starting at rank `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseTile {
    pub rect: Subarray,
    pub start: u64,
}

/// Physical tile locations of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnTiles {
    pub name: String,
    pub tiles: Vec<TileLocation>,
    /// Value tiles of variable-size columns (empty otherwise)
    pub var_tiles: Vec<TileLocation>,
}

/// Where one compressed tile lives in its file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileLocation {
    pub offset: u64,
    pub size: u64,
    pub raw_size: u64,
    pub crc: u32,
}

/// File names holding a column's tiles
pub(crate) fn column_files(name: &str) -> (String, String) {
    (format!("{}.tdb", name), format!("{}_var.tdb", name))
}

// =============================================================================
// Decoded Tiles
// =============================================================================

/// One decoded tile of one column
#[derive(Debug, Clone)]
pub(crate) struct Tile {
    pub data: Bytes,
    pub var: Option<Bytes>,
}

impl Tile {
    /// Bytes of the `idx`-th cell of the tile
    pub fn cell(&self, idx: usize, cell_size: Option<usize>) -> Result<Bytes> {
        match (cell_size, &self.var) {
            (Some(size), _) => {
                let start = idx * size;
                if start + size > self.data.len() {
                    return Err(out_of_range(idx));
                }
                Ok(self.data.slice(start..start + size))
            }
            (None, Some(var)) => {
                let offset_at = |i: usize| -> Option<usize> {
                    let bytes = self.data.get(i * OFFSET_SIZE..(i + 1) * OFFSET_SIZE)?;
                    let mut buf = [0u8; OFFSET_SIZE];
                    buf.copy_from_slice(bytes);
                    Some(u64::from_le_bytes(buf) as usize)
                };
                let start = offset_at(idx).ok_or_else(|| out_of_range(idx))?;
                let end = offset_at(idx + 1).unwrap_or(var.len());
                if start > end || end > var.len() {
                    return Err(TileError::Corruption(format!(
                        "bad offsets [{}, {}) in a value tile of {} bytes",
                        start,
                        end,
                        var.len()
                    )));
                }
                Ok(var.slice(start..end))
            }
            (None, None) => Err(TileError::Corruption(
                "variable-size column without a value tile".to_string(),
            )),
        }
    }
}

fn out_of_range(idx: usize) -> TileError {
    TileError::Corruption(format!("cell {} is outside its tile", idx))
}
