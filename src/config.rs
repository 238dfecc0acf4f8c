//! Configuration for tilestore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

/// Main configuration for a tilestore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory every array and metadata name resolves under.
    /// Internal structure:
    ///   {workspace}/
    ///     └── {array_name}/
    ///           ├── __array_schema.tdb
    ///           └── __frag_000000000001_0000/   (one per fragment)
    pub workspace: PathBuf,

    /// Durability strategy applied when a fragment is published
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Asynchronous I/O Configuration
    // -------------------------------------------------------------------------
    /// Number of worker threads servicing asynchronous requests
    pub aio_workers: usize,

    // -------------------------------------------------------------------------
    // Buffer Configuration
    // -------------------------------------------------------------------------
    /// Initial per-attribute buffer size of iterators (in bytes)
    pub iterator_buffer_size: usize,

    /// Size of a metadata write buffer before it is sealed into a fragment (in bytes)
    pub metadata_buffer_limit: usize,
}

/// Fragment durability strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync tile files, book-keeping and the array directory on every publish
    EveryFragment,

    /// Leave flushing to the OS (fast, not crash-safe)
    None,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("./tilestore_workspace"),
            sync_strategy: SyncStrategy::EveryFragment,
            aio_workers: 4,
            iterator_buffer_size: 64 * 1024,               // 64 KB
            metadata_buffer_limit: 16 * 1024 * 1024,       // 16 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the workspace directory (root for all arrays)
    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace = path.into();
        self
    }

    /// Set the fragment sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set the number of asynchronous I/O workers (at least one is kept)
    pub fn aio_workers(mut self, count: usize) -> Self {
        self.config.aio_workers = count.max(1);
        self
    }

    /// Set the initial iterator buffer size (in bytes)
    pub fn iterator_buffer_size(mut self, size: usize) -> Self {
        self.config.iterator_buffer_size = size.max(1);
        self
    }

    /// Set the metadata write buffer limit (in bytes)
    pub fn metadata_buffer_limit(mut self, size: usize) -> Self {
        self.config.metadata_buffer_limit = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
