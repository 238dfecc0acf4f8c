//! Fragment Reader
//!
//! Opens a published fragment, keeps its book-keeping in memory and loads
//! individual tiles on demand.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TileError};
use crate::schema::{ArraySchema, Subarray};
use crate::storage::decompress;
use crate::storage::record::read_record;

use super::{
    column_files, BookKeeping, FragmentId, Tile, TileInfo, TileLocation, BOOK_KEEPING_FILE,
    BOOK_KEEPING_MAGIC,
};

/// Read access to one immutable fragment
///
/// Shared between readers as `Arc<FragmentReader>`. Once a consolidation has
/// superseded the fragment it is marked obsolete, and its directory is
/// removed when the last reader lets go of it.
#[derive(Debug)]
pub struct FragmentReader {
    id: FragmentId,
    dir: PathBuf,
    schema: Arc<ArraySchema>,
    book: BookKeeping,
    /// Tile files per stored column, opened only while a tile loads
    files: Vec<ColumnFiles>,
    obsolete: AtomicBool,
}

#[derive(Debug)]
struct ColumnFiles {
    data: PathBuf,
    var: Option<PathBuf>,
}

impl FragmentReader {
    /// Open a fragment directory and load its book-keeping
    pub fn open(dir: &Path, id: FragmentId, schema: Arc<ArraySchema>) -> Result<Self> {
        let book: BookKeeping = read_record(&dir.join(BOOK_KEEPING_FILE), BOOK_KEEPING_MAGIC)?;

        let columns = schema.stored_columns();
        if book.columns.len() != columns.len() {
            return Err(TileError::Corruption(format!(
                "fragment {} stores {} columns, schema has {}",
                id,
                book.columns.len(),
                columns.len()
            )));
        }

        let mut files = Vec::with_capacity(columns.len());
        for (&column, tiles) in columns.iter().zip(&book.columns) {
            if tiles.tiles.len() != book.tiles.len() {
                return Err(TileError::Corruption(format!(
                    "fragment {}: column '{}' has {} tiles, expected {}",
                    id,
                    tiles.name,
                    tiles.tiles.len(),
                    book.tiles.len()
                )));
            }
            let (data_name, var_name) = column_files(schema.column_name(column));
            let data = existing_file(dir.join(data_name))?;
            let var = if schema.column_is_var(column) {
                Some(existing_file(dir.join(var_name))?)
            } else {
                None
            };
            files.push(ColumnFiles { data, var });
        }

        tracing::debug!(
            "Opened fragment {} ({} cells, {} tiles)",
            id,
            book.cell_num,
            book.tiles.len()
        );

        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            schema,
            book,
            files,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Load and decode one tile of one stored column
    pub(crate) fn load_tile(&self, column: usize, tile: usize) -> Result<Tile> {
        let tiles = self.book.columns.get(column).ok_or_else(|| {
            TileError::InvalidArgument(format!("column {} is not stored", column))
        })?;
        let location = tiles.tiles.get(tile).ok_or_else(|| {
            TileError::Corruption(format!("fragment {} has no tile {}", self.id, tile))
        })?;
        let compressor = self.schema.column_compressor(column);

        let files = &self.files[column];
        let data = read_tile(&files.data, location)?;
        let data = decompress(compressor, &data, location.raw_size as usize)?;

        let var = match (&files.var, tiles.var_tiles.get(tile)) {
            (Some(path), Some(location)) => {
                let raw = read_tile(path, location)?;
                Some(Bytes::from(decompress(
                    compressor,
                    &raw,
                    location.raw_size as usize,
                )?))
            }
            (None, _) => None,
            (Some(_), None) => {
                return Err(TileError::Corruption(format!(
                    "fragment {}: missing value tile {} of '{}'",
                    self.id, tile, tiles.name
                )))
            }
        };

        Ok(Tile {
            data: Bytes::from(data),
            var,
        })
    }

    /// Flag the fragment for deletion once no reader holds it
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub fn book_keeping(&self) -> &BookKeeping {
        &self.book
    }

    pub fn cell_num(&self) -> u64 {
        self.book.cell_num
    }

    pub fn tiles(&self) -> &[TileInfo] {
        &self.book.tiles
    }

    pub fn non_empty_domain(&self) -> Option<&Subarray> {
        self.book.non_empty_domain.as_ref()
    }

    /// Whether the fragment stores dense tiles
    pub fn is_dense(&self) -> bool {
        self.book.tiles.iter().any(|t| t.dense.is_some())
    }
}

impl Drop for FragmentReader {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::SeqCst) {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::debug!("Removed obsolete fragment {}", self.id),
            Err(e) => tracing::warn!("Failed to remove obsolete fragment {}: {}", self.id, e),
        }
    }
}

fn existing_file(path: PathBuf) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(TileError::Corruption(format!(
            "missing tile file {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Read one compressed tile and verify its checksum
fn read_tile(path: &Path, location: &TileLocation) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; location.size as usize];
    file.seek(SeekFrom::Start(location.offset))?;
    file.read_exact(&mut buf)?;

    if crc32fast::hash(&buf) != location.crc {
        return Err(TileError::Corruption(format!(
            "tile checksum mismatch at offset {}",
            location.offset
        )));
    }
    Ok(buf)
}
