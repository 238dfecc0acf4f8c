//! Storage Manager
//!
//! The façade every caller goes through: it owns the workspace, the
//! per-array state and the asynchronous I/O pool.
//!
//! ## Responsibilities
//! - Create and describe arrays and metadata stores
//! - Open handles (one writer, many readers per array)
//! - Run consolidation
//! - Directory bookkeeping that keeps open handles honest: deleting, moving
//!   or clearing an object invalidates every handle opened on it
//!
//! ## Registry
//! ```text
//! StorageManager
//!   ├── workspace/               filesystem root
//!   ├── pool: AioPool            shared by every handle
//!   └── registry: name ──► ArrayEntry { schema, FragmentManager,
//!                                       writer flag, generation }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aio::AioPool;
use crate::array::{Array, ArrayMode};
use crate::config::{Config, SyncStrategy};
use crate::consolidator::{self, ConsolidationStats};
use crate::error::{Result, TileError};
use crate::iterator::ArrayIterator;
use crate::metadata::{Metadata, MetadataIterator};
use crate::schema::{check_object_name, ArraySchema, Subarray};
use crate::storage::record::{load_schema, save_schema, sync_dir};
use crate::storage::{FragmentId, FragmentManager};

/// What a workspace directory holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirType {
    Array,
    Metadata,
    /// The workspace root
    Workspace,
    /// Anything else (plain directory, missing path)
    None,
}

/// Summary of one published fragment
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentInfo {
    pub id: FragmentId,
    pub cell_num: u64,
    pub tile_num: usize,
    pub non_empty_domain: Option<Subarray>,
}

/// Shared state of one open array or metadata store
pub(crate) struct ArrayEntry {
    pub name: String,
    pub schema: Arc<ArraySchema>,
    pub fragments: FragmentManager,
    /// A write handle is open
    pub writer_open: AtomicBool,
    /// Bumped whenever the object is deleted, moved or cleared
    pub generation: AtomicU64,
    /// Held for the duration of a consolidation
    pub consolidating: Mutex<()>,
}

/// Entry point of the engine
///
/// ## Concurrency:
/// - `registry`: Protected by Mutex (only held while resolving a name)
/// - Array state lives in `ArrayEntry` and is shared with open handles
/// - All methods use `&self`
pub struct StorageManager {
    config: Config,
    registry: Mutex<HashMap<String, Arc<ArrayEntry>>>,
    pool: Arc<AioPool>,
}

impl StorageManager {
    /// Open (or create) a workspace
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Make sure the workspace exists
        fs::create_dir_all(&config.workspace)?;

        // Step 2: Start the asynchronous I/O workers
        let pool = Arc::new(AioPool::new(config.aio_workers)?);

        tracing::info!(
            "Opened workspace {} ({} AIO workers)",
            config.workspace.display(),
            pool.size()
        );
        Ok(Self {
            config,
            registry: Mutex::new(HashMap::new()),
            pool,
        })
    }

    /// Open with default config at the given path
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().workspace(path).build();
        Self::open(config)
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    /// Persist a new array schema
    pub fn array_create(&self, schema: &ArraySchema) -> Result<()> {
        if schema.is_keyed() {
            return Err(TileError::InvalidSchema(format!(
                "'{}' is a metadata schema; use metadata_create",
                schema.name()
            )));
        }
        self.create(schema)
    }

    /// Schema of an existing array
    pub fn array_schema(&self, name: &str) -> Result<Arc<ArraySchema>> {
        Ok(self.entry(name, false)?.schema.clone())
    }

    /// Open a handle on an array
    ///
    /// An empty `attributes` list selects every attribute (plus `__coords`
    /// for sparse arrays); a missing `subarray` means the whole domain.
    pub fn array_init(
        &self,
        name: &str,
        mode: ArrayMode,
        subarray: Option<&[(i64, i64)]>,
        attributes: &[&str],
    ) -> Result<Array> {
        let entry = self.entry(name, false)?;
        self.open_handle(entry, mode, subarray, attributes)
    }

    /// Merge all fragments of an array into one
    pub fn array_consolidate(&self, name: &str) -> Result<ConsolidationStats> {
        let entry = self.entry(name, false)?;
        consolidator::consolidate(&entry)
    }

    /// Finalize a handle
    pub fn array_finalize(&self, array: Array) -> Result<()> {
        array.finalize()
    }

    /// Publish what a write handle wrote so far
    pub fn array_sync(&self, array: &Array) -> Result<()> {
        array.sync()
    }

    /// Flush one attribute's cut tiles to stable storage
    pub fn array_sync_attribute(&self, array: &Array, attribute: &str) -> Result<()> {
        array.sync_attribute(attribute)
    }

    /// Open a read handle and wrap it in an iterator
    pub fn array_iterator_init(
        &self,
        name: &str,
        subarray: Option<&[(i64, i64)]>,
        attributes: &[&str],
    ) -> Result<ArrayIterator> {
        self.array_init(name, ArrayMode::Read, subarray, attributes)?
            .iter()
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Persist a new metadata schema
    pub fn metadata_create(&self, schema: &ArraySchema) -> Result<()> {
        if !schema.is_keyed() {
            return Err(TileError::InvalidSchema(format!(
                "'{}' is an array schema; use array_create",
                schema.name()
            )));
        }
        self.create(schema)
    }

    /// Schema of an existing metadata store
    pub fn metadata_schema(&self, name: &str) -> Result<Arc<ArraySchema>> {
        Ok(self.entry(name, true)?.schema.clone())
    }

    /// Open a handle on a metadata store
    pub fn metadata_init(&self, name: &str, mode: ArrayMode, attributes: &[&str]) -> Result<Metadata> {
        let entry = self.entry(name, true)?;
        Ok(Metadata::new(self.open_handle(entry, mode, None, attributes)?))
    }

    pub fn metadata_consolidate(&self, name: &str) -> Result<ConsolidationStats> {
        let entry = self.entry(name, true)?;
        consolidator::consolidate(&entry)
    }

    pub fn metadata_finalize(&self, metadata: Metadata) -> Result<()> {
        metadata.finalize()
    }

    pub fn metadata_sync(&self, metadata: &Metadata) -> Result<()> {
        metadata.sync()
    }

    /// Open a read handle on a metadata store and iterate every key
    pub fn metadata_iterator_init(&self, name: &str, attributes: &[&str]) -> Result<MetadataIterator> {
        self.metadata_init(name, ArrayMode::Read, attributes)?.iter()
    }

    // =========================================================================
    // Directory Bookkeeping
    // =========================================================================

    /// What `path` (workspace-relative, "" for the root) holds
    pub fn dir_type(&self, path: &str) -> DirType {
        if path.is_empty() {
            return DirType::Workspace;
        }
        let dir = self.config.workspace.join(path);
        match load_schema(&dir) {
            Ok(Some(schema)) if schema.is_keyed() => DirType::Metadata,
            Ok(Some(_)) => DirType::Array,
            _ => DirType::None,
        }
    }

    /// Children of a workspace directory with their types, sorted by name
    pub fn ls(&self, path: &str) -> Result<Vec<(String, DirType)>> {
        let dir = self.config.workspace.join(path);
        if !dir.is_dir() {
            return Err(TileError::NotFound(format!("directory '{}'", path)));
        }
        if !matches!(self.dir_type(path), DirType::Workspace | DirType::None) {
            return Err(TileError::InvalidArgument(format!(
                "'{}' is an array or metadata store, not a directory",
                path
            )));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || name.starts_with("__") || name.starts_with('.') {
                continue;
            }
            let child = if path.is_empty() {
                name
            } else {
                format!("{}/{}", path.trim_end_matches('/'), name)
            };
            let kind = self.dir_type(&child);
            children.push((child, kind));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    /// Remove an array or metadata store with all its fragments
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.object_dir(name)?;
        self.invalidate(name);
        fs::remove_dir_all(&dir)?;
        tracing::info!("Deleted '{}'", name);
        Ok(())
    }

    /// Rename an array or metadata store
    pub fn move_object(&self, old: &str, new: &str) -> Result<()> {
        let old_dir = self.object_dir(old)?;
        check_object_name(new)?;
        let new_dir = self.config.workspace.join(new);
        if new_dir.exists() {
            return Err(TileError::AlreadyExists(new.to_string()));
        }

        let schema = load_schema(&old_dir)?.ok_or_else(|| TileError::NotFound(old.to_string()))?;
        self.invalidate(old);
        if let Some(parent) = new_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&old_dir, &new_dir)?;
        save_schema(&new_dir, &schema.with_name(new), self.durable())?;
        if self.durable() {
            if let Some(parent) = new_dir.parent() {
                sync_dir(parent)?;
            }
        }
        tracing::info!("Moved '{}' to '{}'", old, new);
        Ok(())
    }

    /// Drop every fragment of an object, keeping its schema
    pub fn clear(&self, name: &str) -> Result<()> {
        let keyed = self.dir_type(name) == DirType::Metadata;
        let entry = self.entry(name, keyed)?;
        entry.generation.fetch_add(1, Ordering::SeqCst);
        entry.writer_open.store(false, Ordering::SeqCst);
        entry.fragments.clear();
        tracing::info!("Cleared '{}'", name);
        Ok(())
    }

    /// Published fragments of an object, in creation order
    pub fn fragment_info(&self, name: &str) -> Result<Vec<FragmentInfo>> {
        let keyed = self.dir_type(name) == DirType::Metadata;
        let entry = self.entry(name, keyed)?;
        let mut infos: Vec<FragmentInfo> = entry
            .fragments
            .snapshot()
            .iter()
            .map(|f| FragmentInfo {
                id: f.id(),
                cell_num: f.cell_num(),
                tile_num: f.tiles().len(),
                non_empty_domain: f.non_empty_domain().cloned(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn workspace(&self) -> &Path {
        &self.config.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn durable(&self) -> bool {
        self.config.sync_strategy == SyncStrategy::EveryFragment
    }

    fn create(&self, schema: &ArraySchema) -> Result<()> {
        schema.validate()?;
        let dir = self.config.workspace.join(schema.name());
        if load_schema(&dir)?.is_some() {
            return Err(TileError::AlreadyExists(schema.name().to_string()));
        }
        save_schema(&dir, schema, self.durable())?;
        tracing::info!(
            "Created {:?} '{}' with {} attributes",
            schema.kind(),
            schema.name(),
            schema.attribute_num()
        );
        Ok(())
    }

    /// Directory of an existing object
    fn object_dir(&self, name: &str) -> Result<PathBuf> {
        check_object_name(name).map_err(|_| TileError::InvalidArgument(format!("invalid name '{}'", name)))?;
        match self.dir_type(name) {
            DirType::Array | DirType::Metadata => Ok(self.config.workspace.join(name)),
            _ => Err(TileError::NotFound(name.to_string())),
        }
    }

    /// Registry entry of an object, loading it on first use
    fn entry(&self, name: &str, keyed: bool) -> Result<Arc<ArrayEntry>> {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get(name) {
            return check_kind(entry, keyed).map(|_| entry.clone());
        }

        let dir = self.object_dir(name)?;
        let schema = load_schema(&dir)?.ok_or_else(|| TileError::NotFound(name.to_string()))?;
        let schema = Arc::new(schema);
        let fragments = FragmentManager::open(&dir, schema.clone(), self.config.sync_strategy)?;
        let entry = Arc::new(ArrayEntry {
            name: name.to_string(),
            schema,
            fragments,
            writer_open: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            consolidating: Mutex::new(()),
        });
        check_kind(&entry, keyed)?;

        tracing::debug!(
            "Loaded '{}' with {} fragments",
            name,
            entry.fragments.fragment_count()
        );
        registry.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    fn open_handle(
        &self,
        entry: Arc<ArrayEntry>,
        mode: ArrayMode,
        subarray: Option<&[(i64, i64)]>,
        attributes: &[&str],
    ) -> Result<Array> {
        if mode == ArrayMode::Write
            && entry
                .writer_open
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(TileError::WriterBusy(entry.name.clone()));
        }

        let opened = Array::open(
            entry.clone(),
            mode,
            subarray,
            attributes,
            self.pool.clone(),
            self.config.iterator_buffer_size,
            self.config.metadata_buffer_limit,
        );
        if opened.is_err() && mode == ArrayMode::Write {
            entry.writer_open.store(false, Ordering::SeqCst);
        }
        opened
    }

    /// Forget the entry of `name` and invalidate every handle opened on it
    fn invalidate(&self, name: &str) {
        if let Some(entry) = self.registry.lock().remove(name) {
            entry.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn check_kind(entry: &ArrayEntry, keyed: bool) -> Result<()> {
    if entry.schema.is_keyed() != keyed {
        let wanted = if keyed { "metadata store" } else { "array" };
        return Err(TileError::NotFound(format!("'{}' is not a {}", entry.name, wanted)));
    }
    Ok(())
}
