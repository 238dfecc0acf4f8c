//! Fragment Writer
//!
//! Appends cells to per-column tile buffers, compresses each tile as it is
//! cut, and publishes the finished fragment with a single directory rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SyncStrategy;
use crate::error::{Result, TileError};
use crate::schema::{ArraySchema, Compressor, Subarray};
use crate::storage::record::{sync_dir, write_record};
use crate::storage::compress;

use super::{
    column_files, BookKeeping, ColumnTiles, DenseTile, FragmentId, TileInfo, TileLocation,
    BOOK_KEEPING_FILE, BOOK_KEEPING_MAGIC,
};

/// Builder for one new fragment
///
/// Cells are appended with [`append_cell`](Self::append_cell); the caller
/// decides where tiles end by calling [`cut_tile`](Self::cut_tile).
/// Nothing is visible to readers until [`finish`](Self::finish) renames the
/// temp directory into place. Dropping an unfinished writer removes it.
pub struct FragmentWriter {
    id: FragmentId,
    /// Directory the fragment is built in
    temp_dir: PathBuf,
    /// Directory the fragment is published as
    final_dir: PathBuf,
    schema: Arc<ArraySchema>,
    columns: Vec<ColumnWriter>,
    /// Finished tiles
    tiles: Vec<TileInfo>,
    /// Cells in the tile being built
    tile_cells: u64,
    /// Bounding box of the tile being built
    tile_mbr: Option<Subarray>,
    /// Placement of the dense tile being built
    dense_tile: Option<DenseTile>,
    cell_num: u64,
    sync_strategy: SyncStrategy,
    finished: bool,
}

/// Tile series of one column
struct ColumnWriter {
    name: String,
    compressor: Compressor,
    cell_size: Option<usize>,
    file: BufWriter<File>,
    var_file: Option<BufWriter<File>>,
    /// Current tile contents (fixed values, or offsets for var columns)
    buf: Vec<u8>,
    /// Current value tile of var columns
    var_buf: Vec<u8>,
    offset: u64,
    var_offset: u64,
    tiles: Vec<TileLocation>,
    var_tiles: Vec<TileLocation>,
}

impl FragmentWriter {
    /// Create the temp directory and one file per column
    pub fn create(
        array_dir: &Path,
        id: FragmentId,
        schema: Arc<ArraySchema>,
        sync_strategy: SyncStrategy,
    ) -> Result<Self> {
        let temp_dir = array_dir.join(id.temp_dir_name());
        let final_dir = array_dir.join(id.dir_name());
        fs::create_dir_all(&temp_dir)?;

        let mut columns = Vec::new();
        for column in schema.stored_columns() {
            let name = schema.column_name(column).to_string();
            let cell_size = schema.column_cell_size(column);
            let (file_name, var_name) = column_files(&name);

            let file = BufWriter::new(create_file(&temp_dir.join(file_name))?);
            let var_file = match cell_size {
                None => Some(BufWriter::new(create_file(&temp_dir.join(var_name))?)),
                Some(_) => None,
            };

            columns.push(ColumnWriter {
                name,
                compressor: schema.column_compressor(column),
                cell_size,
                file,
                var_file,
                buf: Vec::new(),
                var_buf: Vec::new(),
                offset: 0,
                var_offset: 0,
                tiles: Vec::new(),
                var_tiles: Vec::new(),
            });
        }

        Ok(Self {
            id,
            temp_dir,
            final_dir,
            schema,
            columns,
            tiles: Vec::new(),
            tile_cells: 0,
            tile_mbr: None,
            dense_tile: None,
            cell_num: 0,
            sync_strategy,
            finished: false,
        })
    }

    /// Append one cell. `values` holds one entry per stored column, in column
    /// order; `coords` feeds the tile's bounding box.
    pub fn append_cell(&mut self, values: &[&[u8]], coords: Option<&[i64]>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(TileError::BufferMismatch(format!(
                "expected {} column values, got {}",
                self.columns.len(),
                values.len()
            )));
        }

        for (column, value) in self.columns.iter_mut().zip(values) {
            match column.cell_size {
                Some(_) => column.buf.extend_from_slice(value),
                None => {
                    column
                        .buf
                        .extend_from_slice(&(column.var_buf.len() as u64).to_le_bytes());
                    column.var_buf.extend_from_slice(value);
                }
            }
        }

        if let Some(coords) = coords {
            match &mut self.tile_mbr {
                Some(mbr) => {
                    for (range, &c) in mbr.iter_mut().zip(coords) {
                        range.0 = range.0.min(c);
                        range.1 = range.1.max(c);
                    }
                }
                None => self.tile_mbr = Some(coords.iter().map(|&c| (c, c)).collect()),
            }
        }

        self.tile_cells += 1;
        self.cell_num += 1;
        Ok(())
    }

    /// Declare the placement of the dense tile about to be filled
    pub fn begin_dense_tile(&mut self, rect: Subarray, start: u64) {
        self.dense_tile = Some(DenseTile { rect, start });
    }

    /// Whether a dense tile placement is currently open
    pub fn has_dense_tile(&self) -> bool {
        self.dense_tile.is_some()
    }

    /// Compress and write out the current tile of every column
    pub fn cut_tile(&mut self) -> Result<()> {
        if self.tile_cells == 0 {
            return Ok(());
        }

        for column in &mut self.columns {
            column.flush_tile()?;
        }

        let mbr = self.tile_mbr.take();
        let dense = self.dense_tile.take();
        self.tiles.push(TileInfo {
            cell_num: self.tile_cells,
            mbr: mbr.or_else(|| dense.as_ref().map(|d| d.rect.clone())),
            dense,
        });
        self.tile_cells = 0;
        Ok(())
    }

    /// Flush and fsync the tiles of one column that have already been cut
    pub fn sync_column(&mut self, column: usize) -> Result<()> {
        let column = self.columns.get_mut(column).ok_or_else(|| {
            TileError::InvalidArgument(format!("column {} is not stored", column))
        })?;
        column.file.flush()?;
        column.file.get_ref().sync_all()?;
        if let Some(var_file) = &mut column.var_file {
            var_file.flush()?;
            var_file.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Cut the pending tile, write the book-keeping record and publish the
    /// fragment by renaming its directory into place.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.cut_tile()?;

        let durable = self.sync_strategy == SyncStrategy::EveryFragment;
        let mut columns = Vec::with_capacity(self.columns.len());
        for column in self.columns.drain(..) {
            columns.push(column.close(durable)?);
        }

        let non_empty_domain = self
            .tiles
            .iter()
            .filter_map(|t| t.mbr.as_ref())
            .fold(None, |acc: Option<Subarray>, mbr| {
                Some(match acc {
                    None => mbr.clone(),
                    Some(acc) => acc
                        .iter()
                        .zip(mbr)
                        .map(|(&(alo, ahi), &(blo, bhi))| (alo.min(blo), ahi.max(bhi)))
                        .collect(),
                })
            });

        let book = BookKeeping {
            cell_num: self.cell_num,
            non_empty_domain: if self.schema.is_keyed() { None } else { non_empty_domain },
            tiles: std::mem::take(&mut self.tiles),
            columns,
        };
        write_record(
            &self.temp_dir.join(BOOK_KEEPING_FILE),
            BOOK_KEEPING_MAGIC,
            &book,
            durable,
        )?;

        fs::rename(&self.temp_dir, &self.final_dir)?;
        if durable {
            if let Some(parent) = self.final_dir.parent() {
                sync_dir(parent)?;
            }
        }
        self.finished = true;

        tracing::debug!(
            "Published fragment {} ({} cells, {} tiles)",
            self.id,
            book.cell_num,
            book.tiles.len()
        );
        Ok(self.final_dir.clone())
    }

    /// Discard the fragment
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        fs::remove_dir_all(&self.temp_dir)?;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> FragmentId {
        self.id
    }

    /// Cells appended so far
    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    /// Cells in the tile being built
    pub fn tile_cell_num(&self) -> u64 {
        self.tile_cells
    }
}

impl Drop for FragmentWriter {
    fn drop(&mut self) {
        if !self.finished && self.temp_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.temp_dir) {
                tracing::warn!(
                    "Failed to remove unfinished fragment {}: {}",
                    self.temp_dir.display(),
                    e
                );
            }
        }
    }
}

impl ColumnWriter {
    /// Compress the current tile(s) and append them to the column files
    fn flush_tile(&mut self) -> Result<()> {
        let location = write_tile(&mut self.file, &mut self.offset, self.compressor, &self.buf)?;
        self.tiles.push(location);
        self.buf.clear();

        if let Some(var_file) = &mut self.var_file {
            let location =
                write_tile(var_file, &mut self.var_offset, self.compressor, &self.var_buf)?;
            self.var_tiles.push(location);
            self.var_buf.clear();
        }
        Ok(())
    }

    fn close(mut self, durable: bool) -> Result<ColumnTiles> {
        self.file.flush()?;
        if durable {
            self.file.get_ref().sync_all()?;
        }
        if let Some(var_file) = &mut self.var_file {
            var_file.flush()?;
            if durable {
                var_file.get_ref().sync_all()?;
            }
        }
        Ok(ColumnTiles {
            name: self.name,
            tiles: self.tiles,
            var_tiles: self.var_tiles,
        })
    }
}

fn write_tile(
    file: &mut BufWriter<File>,
    offset: &mut u64,
    compressor: Compressor,
    raw: &[u8],
) -> Result<TileLocation> {
    let packed = compress(compressor, raw)?;
    file.write_all(&packed)?;

    let location = TileLocation {
        offset: *offset,
        size: packed.len() as u64,
        raw_size: raw.len() as u64,
        crc: crc32fast::hash(&packed),
    };
    *offset += packed.len() as u64;
    Ok(location)
}

fn create_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?)
}
