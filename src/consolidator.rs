//! Consolidation
//!
//! Merges every fragment of an array (or metadata store) into one.
//!
//! ## Algorithm
//! ```text
//! snapshot F1..Fn ──► CellMerger (newest wins) ──► FragmentWriter (temp dir)
//!                                                        │
//!                                                        ▼ finish (rename)
//!                        FragmentManager::replace(F1..Fn, merged)  ◄── swap
//! ```
//!
//! Readers holding the old snapshot keep reading the old fragments; their
//! directories go away when the last such reader drops them. A failure before
//! the swap leaves only a temp directory behind, which is discarded.

use std::sync::Arc;

use crate::error::Result;
use crate::query::{build_sources, CellMerger, Selection};
use crate::schema::{rect_cell_count, ArraySchema, Subarray};
use crate::storage::{FragmentReader, FragmentWriter};
use crate::storage_manager::ArrayEntry;

/// Outcome of one consolidation run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidationStats {
    /// Fragments merged (0 when there was nothing to do)
    pub merged_fragments: usize,
    /// Cells in the resulting fragment
    pub cell_num: u64,
}

/// Merge every current fragment of `entry` into one
pub(crate) fn consolidate(entry: &ArrayEntry) -> Result<ConsolidationStats> {
    // One consolidation per array at a time
    let _guard = entry.consolidating.lock();

    let snapshot = entry.fragments.snapshot();
    if snapshot.len() <= 1 {
        tracing::debug!(
            "Nothing to consolidate in '{}' ({} fragments)",
            entry.name,
            snapshot.len()
        );
        return Ok(ConsolidationStats {
            merged_fragments: 0,
            cell_num: snapshot.first().map(|f| f.cell_num()).unwrap_or(0),
        });
    }

    let ids: Vec<_> = snapshot.iter().map(|f| f.id()).collect();
    tracing::info!("Consolidating {} fragments of '{}'", ids.len(), entry.name);

    let schema = entry.schema.clone();
    let mut writer = entry.fragments.new_consolidation_writer(&ids)?;
    let written = if schema.is_dense() {
        write_dense(&schema, &snapshot, &mut writer)
    } else {
        write_sorted(&schema, &snapshot, &mut writer)
    };
    if let Err(e) = written {
        tracing::error!("Consolidation of '{}' failed: {}", entry.name, e);
        writer.abort()?;
        return Err(e);
    }

    let cell_num = writer.cell_num();
    let merged = if cell_num == 0 {
        writer.abort()?;
        None
    } else {
        Some(writer)
    };
    entry.fragments.replace(&ids, merged)?;

    tracing::info!(
        "Consolidated '{}': {} fragments into one of {} cells",
        entry.name,
        ids.len(),
        cell_num
    );
    Ok(ConsolidationStats {
        merged_fragments: ids.len(),
        cell_num,
    })
}

/// Sparse and metadata: merged cells in global order, cut every `capacity`
fn write_sorted(
    schema: &Arc<ArraySchema>,
    snapshot: &[Arc<FragmentReader>],
    writer: &mut FragmentWriter,
) -> Result<()> {
    let columns = schema.stored_columns();
    let sources = build_sources(schema, snapshot, &Selection::Everything)?;
    let mut merger = CellMerger::new(schema.clone(), sources, columns);
    let keyed = schema.is_keyed();

    while let Some(cell) = merger.next_cell()? {
        let values: Vec<&[u8]> = cell.values.iter().map(|v| v.as_ref()).collect();
        let coords = if keyed { None } else { cell.id.coords() };
        writer.append_cell(&values, coords)?;
        if writer.tile_cell_num() >= schema.capacity() {
            writer.cut_tile()?;
        }
    }
    writer.cut_tile()
}

/// Dense: the bounding box of all fragments, filled tile by tile
fn write_dense(
    schema: &Arc<ArraySchema>,
    snapshot: &[Arc<FragmentReader>],
    writer: &mut FragmentWriter,
) -> Result<()> {
    let bbox = match bounding_box(snapshot) {
        Some(bbox) => bbox,
        None => return Ok(()),
    };

    let columns = schema.stored_columns();
    let sources = build_sources(schema, snapshot, &Selection::Region(bbox.clone()))?;
    let mut merger = CellMerger::new(schema.clone(), sources, columns);

    for rect in schema.tile_rects(&bbox) {
        let cells = rect_cell_count(&rect)?;
        writer.begin_dense_tile(rect, 0);
        for _ in 0..cells {
            let cell = match merger.next_cell()? {
                Some(cell) => cell,
                None => break,
            };
            let values: Vec<&[u8]> = cell.values.iter().map(|v| v.as_ref()).collect();
            writer.append_cell(&values, None)?;
        }
        writer.cut_tile()?;
    }
    Ok(())
}

/// Smallest box holding every fragment's non-empty domain
fn bounding_box(snapshot: &[Arc<FragmentReader>]) -> Option<Subarray> {
    let mut bbox: Option<Subarray> = None;
    for domain in snapshot.iter().filter_map(|f| f.non_empty_domain()) {
        match &mut bbox {
            Some(bbox) => {
                for (range, &(lo, hi)) in bbox.iter_mut().zip(domain) {
                    range.0 = range.0.min(lo);
                    range.1 = range.1.max(hi);
                }
            }
            None => bbox = Some(domain.clone()),
        }
    }
    bbox
}
