//! Storage Module
//!
//! Persistent storage layer: immutable fragments of compressed tiles.
//!
//! ## Responsibilities
//! - Encode cells into per-attribute tile series and compress each tile
//! - Persist a checksummed book-keeping record per fragment
//! - Publish fragments atomically (build in a temp directory, then rename)
//! - Discover fragments in creation order without any in-memory state
//!
//! ## Directory Layout
//! ```text
//! {workspace}/{array}/
//! ├── __array_schema.tdb              (or __metadata_schema.tdb)
//! ├── __frag_000000000001_0000/
//! │   ├── __book_keeping.tdb          cell counts, tile boundaries, MBRs
//! │   ├── a1.tdb                      fixed-size attribute tiles
//! │   ├── a2.tdb                      var-size attribute: offsets tiles
//! │   ├── a2_var.tdb                  var-size attribute: value tiles
//! │   └── __coords.tdb                sparse arrays only
//! └── .__tmp_frag_000000000002_0000/  in-progress, never visible to readers
//! ```
//!
//! ## Record Format (schema, book-keeping)
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────┬──────────┐
//! │Magic (4) │Version(2)│ Len (8)  │ bincode payload │ CRC (4)  │
//! └──────────┴──────────┴──────────┴─────────────────┴──────────┘
//! ```

mod codec;
pub mod fragment;
mod manager;
pub(crate) mod record;

pub use fragment::{BookKeeping, FragmentId, FragmentReader, FragmentWriter, TileInfo};
pub use manager::FragmentManager;

pub(crate) use codec::{compress, decompress};
