//! Buffer write protocol
//!
//! A write call is validated in full before any cell reaches the fragment
//! under construction, so a rejected call leaves the fragment untouched.
//!
//! ## Tiling
//! - Dense: cells fill the handle's subarray in global order; a tile ends at
//!   every space-tile boundary.
//! - Sparse: a tile ends every `capacity` cells; cells are sorted by global
//!   order within the tile.
//! - Metadata: cells are buffered in a sorted [`MemTable`] and sealed into a
//!   fragment once the buffer limit is reached.

use std::sync::Arc;

use crate::error::{Result, TileError};
use crate::memtable::MemTable;
use crate::schema::{
    rect_cell_count, rect_contains, ArraySchema, SchemaKind, Subarray, OFFSET_SIZE,
};
use crate::storage::{FragmentManager, FragmentWriter};

// =============================================================================
// Batch Parsing
// =============================================================================

/// One validated write call
#[derive(Debug)]
pub(crate) struct Batch<'a> {
    pub cell_num: usize,
    /// Per stored column (column order), per cell
    pub values: Vec<Vec<&'a [u8]>>,
    /// Decoded coordinates per cell (sparse arrays)
    pub coords: Vec<Vec<i64>>,
}

/// Validate caller buffers and split them into cells
///
/// `columns` are the selected columns in slot order; `keys` is the flat
/// NUL-terminated key buffer of metadata writes.
pub(crate) fn parse_batch<'a>(
    schema: &ArraySchema,
    columns: &[usize],
    buffers: &[&'a [u8]],
    keys: Option<&'a [u8]>,
) -> Result<Batch<'a>> {
    let key_column = schema.is_keyed().then(|| schema.coords_column());
    let expected: usize = columns
        .iter()
        .filter(|&&c| Some(c) != key_column)
        .map(|&c| if schema.column_is_var(c) { 2 } else { 1 })
        .sum();
    if buffers.len() != expected {
        return Err(TileError::BufferMismatch(format!(
            "expected {} buffers, got {}",
            expected,
            buffers.len()
        )));
    }

    let mut values: Vec<Vec<&[u8]>> = vec![Vec::new(); schema.stored_columns().len()];
    let mut cell_num: Option<usize> = None;
    let mut slot = 0;

    for &column in columns {
        let name = schema.column_name(column);
        let cells = if Some(column) == key_column {
            split_keys(keys.unwrap_or(&[]))?
        } else if schema.column_is_var(column) {
            let cells = split_var(
                name,
                buffers[slot],
                buffers[slot + 1],
                schema.column_datatype(column).size(),
            )?;
            slot += 2;
            cells
        } else {
            let size = schema.column_cell_size(column).unwrap_or(1);
            let cells = split_fixed(name, buffers[slot], size)?;
            slot += 1;
            cells
        };

        match cell_num {
            Some(n) if n != cells.len() => {
                return Err(TileError::BufferMismatch(format!(
                    "attribute '{}' has {} cells, expected {}",
                    name,
                    cells.len(),
                    n
                )))
            }
            _ => cell_num = Some(cells.len()),
        }
        values[column] = cells;
    }

    let cell_num = cell_num.unwrap_or(0);
    let mut coords = Vec::new();
    if !schema.is_dense() && !schema.is_keyed() {
        let domain = schema.domain();
        let size = schema.coords_type().size();
        for cell in &values[schema.coords_column()] {
            let c: Vec<i64> = cell
                .chunks_exact(size)
                .map(|b| schema.coords_type().decode_coordinate(b))
                .collect();
            if !rect_contains(&domain, &c) {
                return Err(TileError::InvalidArgument(format!(
                    "coordinates {:?} outside the domain of '{}'",
                    c,
                    schema.name()
                )));
            }
            coords.push(c);
        }
    }

    Ok(Batch {
        cell_num,
        values,
        coords,
    })
}

fn split_fixed<'a>(name: &str, buf: &'a [u8], size: usize) -> Result<Vec<&'a [u8]>> {
    if buf.is_empty() {
        return Err(TileError::EmptyBuffer(format!("attribute '{}'", name)));
    }
    if buf.len() % size != 0 {
        return Err(TileError::BufferMismatch(format!(
            "attribute '{}': {} bytes is not a multiple of the cell size {}",
            name,
            buf.len(),
            size
        )));
    }
    Ok(buf.chunks_exact(size).collect())
}

fn split_var<'a>(
    name: &str,
    offsets: &[u8],
    buf: &'a [u8],
    value_size: usize,
) -> Result<Vec<&'a [u8]>> {
    if offsets.is_empty() {
        return Err(TileError::EmptyBuffer(format!("offsets of attribute '{}'", name)));
    }
    if offsets.len() % OFFSET_SIZE != 0 {
        return Err(TileError::BufferMismatch(format!(
            "offsets of attribute '{}': {} bytes is not a multiple of {}",
            name,
            offsets.len(),
            OFFSET_SIZE
        )));
    }

    let starts: Vec<usize> = offsets
        .chunks_exact(OFFSET_SIZE)
        .map(|b| {
            let mut raw = [0u8; OFFSET_SIZE];
            raw.copy_from_slice(b);
            u64::from_le_bytes(raw) as usize
        })
        .collect();
    if starts[0] != 0 {
        return Err(TileError::BufferMismatch(format!(
            "offsets of attribute '{}' must start at 0",
            name
        )));
    }

    let mut cells = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(buf.len());
        if start > end || end > buf.len() || (end - start) % value_size != 0 {
            return Err(TileError::BufferMismatch(format!(
                "attribute '{}': offset {} does not delimit a whole cell",
                name, i
            )));
        }
        cells.push(&buf[start..end]);
    }
    Ok(cells)
}

/// Split a flat buffer of NUL-terminated keys; each key keeps its terminator
fn split_keys(keys: &[u8]) -> Result<Vec<&[u8]>> {
    if keys.is_empty() {
        return Err(TileError::EmptyBuffer("metadata keys".to_string()));
    }
    if keys.last() != Some(&0) {
        return Err(TileError::BufferMismatch(
            "metadata keys must be NUL-terminated".to_string(),
        ));
    }

    let mut cells = Vec::new();
    let mut start = 0;
    for (i, &b) in keys.iter().enumerate() {
        if b == 0 {
            if i == start {
                return Err(TileError::InvalidArgument("empty metadata key".to_string()));
            }
            cells.push(&keys[start..=i]);
            start = i + 1;
        }
    }
    Ok(cells)
}

// =============================================================================
// Write Session
// =============================================================================

/// Cell waiting for its sparse tile to be cut
struct PendingCell {
    order: Vec<i64>,
    coords: Vec<i64>,
    values: Vec<Vec<u8>>,
}

/// Position of a dense write inside its subarray
struct DenseCursor {
    /// Space tiles of the subarray, clipped, in tile order
    rects: Vec<Subarray>,
    rect: usize,
    /// Rank of the next cell inside `rects[rect]`
    rank: u64,
    remaining: u64,
}

enum Tiling {
    Dense(DenseCursor),
    Sparse(Vec<PendingCell>),
    Keyed {
        table: MemTable,
        /// Sealed fragments waiting for the next sync
        sealed: Vec<FragmentWriter>,
    },
}

/// Fragment under construction for one write handle
pub(crate) struct WriteSession {
    schema: Arc<ArraySchema>,
    /// Selected columns, in slot order
    columns: Vec<usize>,
    writer: Option<FragmentWriter>,
    tiling: Tiling,
    metadata_limit: usize,
    /// Set after an I/O failure; the session accepts nothing afterwards
    poisoned: bool,
}

impl WriteSession {
    /// Start a session. Writes must select every attribute, plus the
    /// coordinates of sparse arrays (or the key of metadata stores).
    pub fn new(
        schema: Arc<ArraySchema>,
        columns: Vec<usize>,
        subarray: &[(i64, i64)],
        metadata_limit: usize,
    ) -> Result<Self> {
        let coords = schema.coords_column();
        if schema.is_dense() && columns.contains(&coords) {
            return Err(TileError::InvalidArgument(format!(
                "dense array '{}' takes no '{}' buffer",
                schema.name(),
                schema.coords_name()
            )));
        }
        for column in schema.stored_columns() {
            if !columns.contains(&column) {
                return Err(TileError::InvalidArgument(format!(
                    "write to '{}' must select '{}'",
                    schema.name(),
                    schema.column_name(column)
                )));
            }
        }

        let tiling = if schema.is_dense() {
            let remaining = rect_cell_count(subarray)?;
            Tiling::Dense(DenseCursor {
                rects: schema.tile_rects(subarray).collect(),
                rect: 0,
                rank: 0,
                remaining,
            })
        } else if schema.is_keyed() {
            Tiling::Keyed {
                table: MemTable::new(),
                sealed: Vec::new(),
            }
        } else {
            Tiling::Sparse(Vec::new())
        };

        Ok(Self {
            schema,
            columns,
            writer: None,
            tiling,
            metadata_limit,
            poisoned: false,
        })
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Validate and append one write call
    pub fn write(
        &mut self,
        fragments: &FragmentManager,
        buffers: &[&[u8]],
        keys: Option<&[u8]>,
    ) -> Result<()> {
        self.check_usable()?;
        let batch = parse_batch(&self.schema, &self.columns, buffers, keys)?;

        if let Tiling::Dense(cursor) = &self.tiling {
            if batch.cell_num as u64 > cursor.remaining {
                return Err(TileError::BufferMismatch(format!(
                    "{} cells exceed the {} cells left in the subarray",
                    batch.cell_num, cursor.remaining
                )));
            }
        }

        let result = self.apply(fragments, &batch);
        self.poison_on_failure(result)
    }

    /// Publish everything written so far and continue in a fresh fragment
    pub fn sync(&mut self, fragments: &FragmentManager) -> Result<()> {
        self.check_usable()?;
        let result = self.seal_and_publish(fragments);
        self.poison_on_failure(result)
    }

    /// fsync the already-cut tiles of one column
    pub fn sync_column(&mut self, column: usize) -> Result<()> {
        self.check_usable()?;
        if !self.columns.contains(&column) {
            return Err(TileError::InvalidArgument(format!(
                "'{}' is not selected",
                self.schema.column_name(column)
            )));
        }
        let result = match &mut self.writer {
            Some(writer) => writer.sync_column(column),
            None => Ok(()),
        };
        self.poison_on_failure(result)
    }

    /// Publish the final fragment
    pub fn finalize(&mut self, fragments: &FragmentManager) -> Result<()> {
        self.sync(fragments)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(TileError::InvalidHandle(format!(
                "write session on '{}' failed earlier",
                self.schema.name()
            )));
        }
        Ok(())
    }

    fn poison_on_failure(&mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if e.is_io_failure() {
                tracing::error!("Write to '{}' failed: {}", self.schema.name(), e);
                self.poisoned = true;
                self.writer = None;
                if let Tiling::Keyed { sealed, .. } = &mut self.tiling {
                    sealed.clear();
                }
            }
        }
        result
    }

    fn writer(&mut self, fragments: &FragmentManager) -> Result<&mut FragmentWriter> {
        if self.writer.is_none() {
            self.writer = Some(fragments.new_writer()?);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| TileError::InvalidHandle("no fragment under construction".to_string()))
    }

    fn apply(&mut self, fragments: &FragmentManager, batch: &Batch<'_>) -> Result<()> {
        match self.schema.kind() {
            SchemaKind::Dense => {
                let mut row: Vec<&[u8]> = Vec::with_capacity(batch.values.len());
                for cell in 0..batch.cell_num {
                    row.clear();
                    row.extend(batch.values.iter().map(|v| v[cell]));
                    self.append_dense(fragments, &row)?;
                }
            }
            SchemaKind::Sparse => {
                for cell in 0..batch.cell_num {
                    let coords = batch.coords[cell].clone();
                    let pending_cell = PendingCell {
                        order: self.schema.order_key(&coords),
                        coords,
                        values: batch.values.iter().map(|v| v[cell].to_vec()).collect(),
                    };
                    let tile_full = match &mut self.tiling {
                        Tiling::Sparse(pending) => {
                            pending.push(pending_cell);
                            pending.len() as u64 >= self.schema.capacity()
                        }
                        _ => false,
                    };
                    if tile_full {
                        self.flush_pending(fragments)?;
                    }
                }
            }
            SchemaKind::Keyed => {
                let key_column = self.schema.coords_column();
                let mut full = false;
                if let Tiling::Keyed { table, .. } = &self.tiling {
                    for cell in 0..batch.cell_num {
                        let values = batch.values[..key_column]
                            .iter()
                            .map(|v| v[cell].to_vec())
                            .collect();
                        table.put(batch.values[key_column][cell].to_vec(), values);
                    }
                    full = table.should_seal(self.metadata_limit);
                }
                if full {
                    self.seal_table(fragments)?;
                }
            }
        }
        Ok(())
    }

    fn append_dense(&mut self, fragments: &FragmentManager, row: &[&[u8]]) -> Result<()> {
        let Tiling::Dense(cursor) = &self.tiling else {
            return Ok(());
        };
        let rect = cursor.rects.get(cursor.rect).cloned().ok_or_else(|| {
            TileError::BufferMismatch("write exceeds the subarray".to_string())
        })?;
        let rank = cursor.rank;

        let writer = self.writer(fragments)?;
        if !writer.has_dense_tile() {
            writer.begin_dense_tile(rect.clone(), rank);
        }
        writer.append_cell(row, None)?;

        let tile_done = rank + 1 == rect_cell_count(&rect)?;
        if tile_done {
            writer.cut_tile()?;
        }
        if let Tiling::Dense(cursor) = &mut self.tiling {
            cursor.remaining -= 1;
            if tile_done {
                cursor.rect += 1;
                cursor.rank = 0;
            } else {
                cursor.rank += 1;
            }
        }
        Ok(())
    }

    /// Sort the pending sparse cells into one tile and write it
    fn flush_pending(&mut self, fragments: &FragmentManager) -> Result<()> {
        let Tiling::Sparse(pending) = &mut self.tiling else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut cells = std::mem::take(pending);

        // Stable sort, then keep the last write of repeated coordinates
        cells.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.coords.cmp(&b.coords)));
        let mut tile: Vec<PendingCell> = Vec::with_capacity(cells.len());
        for cell in cells {
            match tile.last_mut() {
                Some(last) if last.coords == cell.coords => *last = cell,
                _ => tile.push(cell),
            }
        }

        let writer = self.writer(fragments)?;
        for cell in &tile {
            let row: Vec<&[u8]> = cell.values.iter().map(Vec::as_slice).collect();
            writer.append_cell(&row, Some(&cell.coords))?;
        }
        writer.cut_tile()
    }

    /// Seal the metadata buffer into a fragment (published on the next sync)
    fn seal_table(&mut self, fragments: &FragmentManager) -> Result<()> {
        let Tiling::Keyed { table, sealed } = &mut self.tiling else {
            return Ok(());
        };
        if table.is_empty() {
            return Ok(());
        }

        let mut writer = fragments.new_writer()?;
        let capacity = self.schema.capacity();
        for (key, values) in table.drain() {
            let mut row: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
            row.push(&key);
            writer.append_cell(&row, None)?;
            if writer.tile_cell_num() >= capacity {
                writer.cut_tile()?;
            }
        }
        tracing::debug!(
            "Sealed {} metadata cells of '{}'",
            writer.cell_num(),
            self.schema.name()
        );
        sealed.push(writer);
        Ok(())
    }

    fn seal_and_publish(&mut self, fragments: &FragmentManager) -> Result<()> {
        match self.schema.kind() {
            SchemaKind::Dense => {}
            SchemaKind::Sparse => self.flush_pending(fragments)?,
            SchemaKind::Keyed => {
                self.seal_table(fragments)?;
                if let Tiling::Keyed { sealed, .. } = &mut self.tiling {
                    for writer in sealed.drain(..) {
                        fragments.publish(writer)?;
                    }
                }
                return Ok(());
            }
        }

        if let Some(writer) = self.writer.take() {
            if writer.cell_num() > 0 {
                fragments.publish(writer)?;
            } else {
                writer.abort()?;
            }
        }
        Ok(())
    }
}
