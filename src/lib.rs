//! # tilestore
//!
//! A multi-dimensional array storage engine with:
//! - Dense and sparse arrays, plus key-value metadata stores
//! - Immutable fragments of compressed, checksummed tiles
//! - A resumable buffer read/write protocol (overflow is not an error)
//! - Asynchronous requests serviced by a worker pool
//! - Background consolidation of fragments
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageManager                           │
//! │        (registry, one writer / many readers per array)       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!        ┌──────────────┼──────────────┬───────────────┐
//!        ▼              ▼              ▼               ▼
//!   ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!   │  Array  │   │ Iterator │   │   AIO    │   │ Consolidator │
//!   │ handles │   │          │   │  (pool)  │   │              │
//!   └────┬────┘   └────┬─────┘   └────┬─────┘   └──────┬───────┘
//!        └─────────────┴──────┬───────┘                │
//!                             ▼                        │
//!                    ┌─────────────────┐               │
//!                    │      Query      │ ◄─────────────┘
//!                    │ (merge, buffers)│
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │     Storage     │
//!                    │ (fragments of   │
//!                    │  tiles)         │
//!                    └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tilestore::{ArrayMode, ArraySchema, Datatype, StorageManager};
//!
//! let manager = StorageManager::open_path(std::path::Path::new("/tmp/ws")).unwrap();
//! let schema = ArraySchema::builder("points")
//!     .attributes(&["v"])
//!     .types(&[Datatype::Int32, Datatype::Int64])
//!     .dimensions(&["x"])
//!     .domain(&[(0, 99)])
//!     .build()
//!     .unwrap();
//! manager.array_create(&schema).unwrap();
//!
//! let array = manager.array_init("points", ArrayMode::Write, None, &[]).unwrap();
//! let values: Vec<u8> = 7i32.to_le_bytes().to_vec();
//! let coords: Vec<u8> = 5i64.to_le_bytes().to_vec();
//! array.write(&[&values, &coords]).unwrap();
//! array.finalize().unwrap();
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod schema;
pub mod memtable;
pub mod storage;
pub(crate) mod query;
pub mod aio;
pub mod array;
pub mod iterator;
pub mod metadata;
pub mod consolidator;
pub mod storage_manager;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TileError};
pub use config::{Config, SyncStrategy};
pub use schema::{
    ArraySchema, ArraySchemaBuilder, CellValNum, Compressor, Datatype, Layout, SchemaKind,
    Subarray,
};
pub use query::ReadStatus;
pub use aio::{AioCompletion, AioRequest, AioStatus, AioTicket};
pub use array::{Array, ArrayMode, ReadOutcome};
pub use iterator::ArrayIterator;
pub use metadata::{Metadata, MetadataIterator};
pub use consolidator::ConsolidationStats;
pub use storage_manager::{DirType, FragmentInfo, StorageManager};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tilestore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
