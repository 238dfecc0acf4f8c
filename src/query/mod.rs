//! Query Module
//!
//! The buffer read/write protocol every access path (handles, iterators,
//! asynchronous requests, consolidation) is built on.
//!
//! ## Responsibilities
//! - Identify cells by their position in global order ([`CellId`])
//! - Merge the cell streams of all fragments, newest fragment winning
//! - Fill caller buffers with whole cells and remember where each column stopped
//! - Validate write buffers and cut them into tiles
//!
//! ## Read Path
//! ```text
//!  FragmentCursor (newest) ─┐
//!  FragmentCursor          ─┼──► CellMerger ──► ReadState ──► caller buffers
//!  FragmentCursor (oldest) ─┤    (min-heap,      (per-column
//!  DenseFill (dense only)  ─┘     dedup)          cursors)
//! ```

pub(crate) mod merge;
pub(crate) mod read_state;
pub(crate) mod write_state;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::schema::{rect_contains, rect_intersection, ArraySchema, Subarray};
use crate::storage::{FragmentReader, TileInfo};

pub(crate) use merge::CellMerger;
pub(crate) use read_state::ReadState;
pub(crate) use write_state::WriteSession;

/// Outcome of one read call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Buffers were filled; more cells remain
    Incomplete,
    /// The next cell of at least one attribute did not fit; call again to resume
    Overflow,
    /// Every cell of the selection has been returned
    Complete,
}

// =============================================================================
// Cell Identity
// =============================================================================

/// Position of a cell in global order
///
/// Array cells compare by their order key (then coordinates); metadata cells
/// compare by key bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CellId {
    Point { order: Vec<i64>, coords: Vec<i64> },
    Key(Vec<u8>),
}

impl CellId {
    pub fn point(schema: &ArraySchema, coords: Vec<i64>) -> Self {
        CellId::Point {
            order: schema.order_key(&coords),
            coords,
        }
    }

    pub fn coords(&self) -> Option<&[i64]> {
        match self {
            CellId::Point { coords, .. } => Some(coords),
            CellId::Key(_) => None,
        }
    }
}

/// Bytes of the coordinates / key column for a cell
pub(crate) fn cell_id_bytes(schema: &ArraySchema, id: &CellId) -> Bytes {
    match id {
        CellId::Point { coords, .. } => {
            let mut out = Vec::with_capacity(schema.coords_size());
            for &c in coords {
                schema.coords_type().encode_coordinate(c, &mut out);
            }
            Bytes::from(out)
        }
        CellId::Key(key) => Bytes::copy_from_slice(key),
    }
}

/// Which cells a read visits
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Selection {
    /// Array cells inside a hyper-rectangle
    Region(Subarray),
    /// One metadata key (stored bytes, terminator included)
    Key(Vec<u8>),
    /// Every cell
    Everything,
}

impl Selection {
    pub fn matches(&self, id: &CellId) -> bool {
        match (self, id) {
            (Selection::Everything, _) => true,
            (Selection::Region(region), CellId::Point { coords, .. }) => {
                rect_contains(region, coords)
            }
            (Selection::Key(wanted), CellId::Key(key)) => wanted == key,
            _ => false,
        }
    }

    /// Whether a tile may hold selected cells
    pub fn may_touch(&self, tile: &TileInfo) -> bool {
        match (self, &tile.mbr) {
            (Selection::Region(region), Some(mbr)) => rect_intersection(region, mbr).is_some(),
            _ => true,
        }
    }

    /// Whether nothing at or after `id` (in one sorted stream) can match
    pub fn is_past(&self, id: &CellId) -> bool {
        match (self, id) {
            (Selection::Key(wanted), CellId::Key(key)) => key > wanted,
            _ => false,
        }
    }
}

// =============================================================================
// Cell Sources
// =============================================================================

/// A stream of cells in global order, one of the inputs of a merge
pub(crate) trait CellSource: Send {
    /// Cell the source is positioned on, `None` once exhausted
    fn current(&self) -> Option<&CellId>;

    /// Value of one stored attribute column for the current cell
    fn value(&mut self, column: usize) -> Result<Bytes>;

    /// Move to the next selected cell
    fn advance(&mut self) -> Result<()>;
}

/// Cursors over every fragment that may hold selected cells, newest first,
/// followed by the empty-cell filler for dense reads.
pub(crate) fn build_sources(
    schema: &Arc<ArraySchema>,
    fragments: &[Arc<FragmentReader>],
    selection: &Selection,
) -> Result<Vec<Box<dyn CellSource>>> {
    let mut sources: Vec<Box<dyn CellSource>> = Vec::with_capacity(fragments.len() + 1);

    for fragment in fragments {
        if let (Selection::Region(region), Some(domain)) = (selection, fragment.non_empty_domain()) {
            if rect_intersection(region, domain).is_none() {
                continue;
            }
        }
        let cursor = crate::storage::fragment::FragmentCursor::new(
            fragment.clone(),
            selection.clone(),
        )?;
        sources.push(Box::new(cursor));
    }

    if schema.is_dense() {
        if let Selection::Region(region) = selection {
            sources.push(Box::new(merge::DenseFill::new(schema.clone(), region)));
        }
    }
    Ok(sources)
}
