//! Multi-way merge of fragment cell streams
//!
//! Sources are ordered newest first. The heap always yields the smallest
//! cell; on equal cells the newest source wins and every older copy of the
//! same cell is discarded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::schema::order::GlobalCells;
use crate::schema::{ArraySchema, Subarray};

use super::{cell_id_bytes, CellId, CellSource};

/// One winning cell with the values of the requested columns
#[derive(Debug, Clone)]
pub(crate) struct MergedCell {
    pub id: CellId,
    pub values: Vec<Bytes>,
}

struct HeapEntry {
    id: CellId,
    /// Index into the sources (lower = newer)
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap, we want the smallest cell and,
    // among equal cells, the newest source.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .id
            .cmp(&self.id)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges any number of sorted cell sources into one deduplicated stream
pub(crate) struct CellMerger {
    schema: Arc<ArraySchema>,
    sources: Vec<Box<dyn CellSource>>,
    heap: BinaryHeap<HeapEntry>,
    /// Columns whose values are returned, in caller order
    columns: Vec<usize>,
}

impl CellMerger {
    pub fn new(
        schema: Arc<ArraySchema>,
        sources: Vec<Box<dyn CellSource>>,
        columns: Vec<usize>,
    ) -> Self {
        let heap = sources
            .iter()
            .enumerate()
            .filter_map(|(source, s)| {
                s.current().map(|id| HeapEntry {
                    id: id.clone(),
                    source,
                })
            })
            .collect();
        Self {
            schema,
            sources,
            heap,
            columns,
        }
    }

    /// Next winning cell, `None` once every source is exhausted
    pub fn next_cell(&mut self) -> Result<Option<MergedCell>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };

        let coords_column = self.schema.coords_column();
        let mut values = Vec::with_capacity(self.columns.len());
        for &column in &self.columns {
            let value = if column == coords_column {
                cell_id_bytes(&self.schema, &top.id)
            } else {
                self.sources[top.source].value(column)?
            };
            values.push(value);
        }

        // Discard older copies of the same cell
        while self.heap.peek().map(|e| e.id == top.id).unwrap_or(false) {
            if let Some(shadowed) = self.heap.pop() {
                self.step(shadowed.source, &top.id)?;
            }
        }
        self.step(top.source, &top.id)?;

        Ok(Some(MergedCell { id: top.id, values }))
    }

    /// Advance a source past `id` and put it back on the heap
    fn step(&mut self, source: usize, id: &CellId) -> Result<()> {
        let src = &mut self.sources[source];
        src.advance()?;
        // Repeated cells inside one fragment collapse onto the first
        while src.current() == Some(id) {
            src.advance()?;
        }
        if let Some(next) = src.current() {
            self.heap.push(HeapEntry {
                id: next.clone(),
                source,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Dense Fill
// =============================================================================

/// Every cell of a dense region carrying the attributes' empty values.
/// Placed last among the sources so any written cell shadows it.
pub(crate) struct DenseFill {
    schema: Arc<ArraySchema>,
    cells: GlobalCells,
    current: Option<CellId>,
}

impl DenseFill {
    pub fn new(schema: Arc<ArraySchema>, region: &Subarray) -> Self {
        let mut cells = schema.global_cells(region);
        let current = cells.next().map(|c| CellId::point(&schema, c));
        Self {
            schema,
            cells,
            current,
        }
    }
}

impl CellSource for DenseFill {
    fn current(&self) -> Option<&CellId> {
        self.current.as_ref()
    }

    fn value(&mut self, column: usize) -> Result<Bytes> {
        match self.schema.attributes().get(column) {
            Some(attr) => Ok(Bytes::copy_from_slice(&attr.fill_value)),
            None => Err(crate::error::TileError::InvalidArgument(format!(
                "column {} has no fill value",
                column
            ))),
        }
    }

    fn advance(&mut self) -> Result<()> {
        self.current = self.cells.next().map(|c| CellId::point(&self.schema, c));
        Ok(())
    }
}
