//! Fragment Manager
//!
//! Tracks the published fragments of one array or metadata store.
//!
//! ## Responsibilities
//! - Discover existing fragments on open and discard stale temp fragments
//! - Hand out fragment ids in creation order
//! - Publish finished writers and swap in consolidated fragments atomically
//! - Give readers a consistent snapshot (newest → oldest)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SyncStrategy;
use crate::error::Result;
use crate::schema::ArraySchema;

use super::fragment::BOOK_KEEPING_FILE;
use super::{FragmentId, FragmentReader, FragmentWriter};

/// Manages the fragment set of one array
///
/// ## Concurrency:
/// - `fragments`: Protected by RwLock (readers take cheap snapshots, publish
///   and consolidation swap under the write lock)
/// - `next_seq`: Atomic counter (lock-free)
/// - All methods use `&self`
pub struct FragmentManager {
    /// Array directory holding the fragment directories
    dir: PathBuf,

    schema: Arc<ArraySchema>,

    sync_strategy: SyncStrategy,

    /// Open fragment readers, ordered newest → oldest
    fragments: RwLock<Vec<Arc<FragmentReader>>>,

    /// Sequence number of the next fragment (atomic, lock-free)
    next_seq: AtomicU64,
}

impl FragmentManager {
    /// Open the fragment set of an array directory
    ///
    /// On open:
    /// 1. Remove temp fragments left behind by interrupted writers
    /// 2. Discover published fragment directories
    /// 3. Open a reader for each (loads book-keeping into RAM)
    /// 4. Order by id descending (newest first)
    pub fn open(dir: &Path, schema: Arc<ArraySchema>, sync_strategy: SyncStrategy) -> Result<Self> {
        let mut ids: Vec<FragmentId> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            if FragmentId::is_temp_name(&name) {
                tracing::info!("Removing stale temp fragment {}", path.display());
                fs::remove_dir_all(&path)?;
                continue;
            }

            if let Some(id) = FragmentId::parse(&name) {
                // A directory without book-keeping was never published
                if path.join(BOOK_KEEPING_FILE).is_file() {
                    ids.push(id);
                } else {
                    tracing::warn!("Ignoring incomplete fragment {}", path.display());
                }
            }
        }

        // Sort newest first
        ids.sort();
        ids.reverse();

        let mut fragments = Vec::with_capacity(ids.len());
        for id in &ids {
            let reader = FragmentReader::open(&dir.join(id.dir_name()), *id, schema.clone())?;
            fragments.push(Arc::new(reader));
        }

        // Next seq = max + 1, or 1 if no fragments exist
        let next_seq = ids.first().map(|id| id.seq + 1).unwrap_or(1);

        Ok(Self {
            dir: dir.to_path_buf(),
            schema,
            sync_strategy,
            fragments: RwLock::new(fragments),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Current fragments, newest → oldest
    pub fn snapshot(&self) -> Vec<Arc<FragmentReader>> {
        self.fragments.read().clone()
    }

    /// Start building a fragment that sorts after every existing one
    pub fn new_writer(&self) -> Result<FragmentWriter> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        FragmentWriter::create(
            &self.dir,
            FragmentId { seq, gen: 0 },
            self.schema.clone(),
            self.sync_strategy,
        )
    }

    /// Start building the fragment that will replace `merged`
    ///
    /// It takes the newest merged seq with the next generation, so it sorts
    /// after everything it absorbs and before anything written later.
    pub(crate) fn new_consolidation_writer(&self, merged: &[FragmentId]) -> Result<FragmentWriter> {
        let newest = merged.iter().max().copied().unwrap_or(FragmentId { seq: 0, gen: 0 });
        FragmentWriter::create(
            &self.dir,
            FragmentId {
                seq: newest.seq,
                gen: newest.gen + 1,
            },
            self.schema.clone(),
            self.sync_strategy,
        )
    }

    /// Publish a finished writer and make it visible to new readers
    pub fn publish(&self, writer: FragmentWriter) -> Result<Arc<FragmentReader>> {
        let id = writer.id();
        let dir = writer.finish()?;
        let reader = Arc::new(FragmentReader::open(&dir, id, self.schema.clone())?);

        let mut fragments = self.fragments.write();
        fragments.push(reader.clone());
        fragments.sort_by(|a, b| b.id().cmp(&a.id()));
        Ok(reader)
    }

    /// Atomically replace the fragments `old` with the output of `writer`
    ///
    /// Readers holding a snapshot keep the old fragments alive; their
    /// directories are removed once the last snapshot is dropped.
    pub fn replace(&self, old: &[FragmentId], writer: Option<FragmentWriter>) -> Result<()> {
        // Step 1: Publish the merged fragment on disk (content-equivalent to `old`)
        let replacement = match writer {
            Some(writer) => {
                let id = writer.id();
                let dir = writer.finish()?;
                Some(Arc::new(FragmentReader::open(&dir, id, self.schema.clone())?))
            }
            None => None,
        };

        // Step 2: Swap under the write lock
        let mut fragments = self.fragments.write();
        fragments.retain(|f| {
            if old.contains(&f.id()) {
                f.mark_obsolete();
                false
            } else {
                true
            }
        });
        if let Some(reader) = replacement {
            fragments.push(reader);
        }
        fragments.sort_by(|a, b| b.id().cmp(&a.id()));
        Ok(())
    }

    /// Drop every fragment (the schema is kept)
    pub fn clear(&self) {
        let mut fragments = self.fragments.write();
        for fragment in fragments.drain(..) {
            fragment.mark_obsolete();
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn fragment_count(&self) -> usize {
        self.fragments.read().len()
    }

    /// Ids of the current fragments, in creation order
    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        let mut ids: Vec<FragmentId> = self.fragments.read().iter().map(|f| f.id()).collect();
        ids.sort();
        ids
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Sequence number the next writer will receive (for testing/debugging)
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }
}
