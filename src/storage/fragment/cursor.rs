//! Fragment Cursor
//!
//! Sequential iteration over the selected cells of one fragment, in the
//! order they are stored (global order).

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TileError};
use crate::query::{CellId, CellSource, Selection};
use crate::schema::order::coords_at;

use super::{FragmentReader, Tile, TileInfo};

/// Cursor over one fragment
///
/// Tiles whose bounding box misses the selection are skipped without being
/// loaded. Decoded tiles are cached per column until the cursor leaves them.
pub(crate) struct FragmentCursor {
    fragment: Arc<FragmentReader>,
    selection: Selection,
    /// Current tile index
    tile: usize,
    /// Current cell index within the tile
    cell: u64,
    /// Decoded tiles of the current tile index, per stored column
    loaded: Vec<Option<Tile>>,
    current: Option<CellId>,
}

impl FragmentCursor {
    /// Create a cursor positioned on the first selected cell
    pub fn new(fragment: Arc<FragmentReader>, selection: Selection) -> Result<Self> {
        let columns = fragment.schema().stored_columns().len();
        let mut cursor = Self {
            fragment,
            selection,
            tile: 0,
            cell: 0,
            loaded: vec![None; columns],
            current: None,
        };
        cursor.seek()?;
        Ok(cursor)
    }

    /// Move forward from (tile, cell) to the first selected cell
    fn seek(&mut self) -> Result<()> {
        let fragment = self.fragment.clone();
        let tiles = fragment.tiles();

        loop {
            let Some(info) = tiles.get(self.tile) else {
                self.current = None;
                return Ok(());
            };

            if self.cell >= info.cell_num || (self.cell == 0 && !self.selection.may_touch(info)) {
                self.next_tile();
                continue;
            }

            let id = self.cell_id(info)?;
            if self.selection.is_past(&id) {
                self.tile = tiles.len();
                continue;
            }
            if self.selection.matches(&id) {
                self.current = Some(id);
                return Ok(());
            }
            self.cell += 1;
        }
    }

    fn next_tile(&mut self) {
        self.tile += 1;
        self.cell = 0;
        self.loaded.iter_mut().for_each(|t| *t = None);
    }

    /// Identity of the cell at (tile, cell)
    fn cell_id(&mut self, info: &TileInfo) -> Result<CellId> {
        let schema = self.fragment.schema().clone();

        if let Some(dense) = &info.dense {
            let coords = coords_at(&dense.rect, schema.cell_order(), dense.start + self.cell);
            return Ok(CellId::point(&schema, coords));
        }

        let column = schema.coords_column();
        let bytes = self.load(column)?;
        if schema.is_keyed() {
            return Ok(CellId::Key(bytes.to_vec()));
        }

        let size = schema.coords_type().size();
        if bytes.len() != schema.coords_size() {
            return Err(TileError::Corruption(format!(
                "fragment {}: coordinates of {} bytes, expected {}",
                self.fragment.id(),
                bytes.len(),
                schema.coords_size()
            )));
        }
        let coords = bytes
            .chunks_exact(size)
            .map(|c| schema.coords_type().decode_coordinate(c))
            .collect();
        Ok(CellId::point(&schema, coords))
    }

    /// Bytes of one column for the cell at (tile, cell), loading the tile if needed
    fn load(&mut self, column: usize) -> Result<Bytes> {
        if column >= self.loaded.len() {
            return Err(TileError::InvalidArgument(format!(
                "column {} is not stored",
                column
            )));
        }
        if self.loaded[column].is_none() {
            self.loaded[column] = Some(self.fragment.load_tile(column, self.tile)?);
        }
        let cell_size = self.fragment.schema().column_cell_size(column);
        match &self.loaded[column] {
            Some(tile) => tile.cell(self.cell as usize, cell_size),
            None => Err(TileError::Corruption("tile vanished from cache".to_string())),
        }
    }
}

impl CellSource for FragmentCursor {
    fn current(&self) -> Option<&CellId> {
        self.current.as_ref()
    }

    fn value(&mut self, column: usize) -> Result<Bytes> {
        self.load(column)
    }

    fn advance(&mut self) -> Result<()> {
        if self.current.is_none() {
            return Ok(());
        }
        self.cell += 1;
        self.seek()
    }
}
