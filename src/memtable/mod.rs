//! MemTable Module
//!
//! In-memory write buffer of metadata write sessions.
//!
//! ## Responsibilities
//! - Accept keyed cells in any order, last write of a key wins
//! - Track size for seal triggers
//! - Ordered iteration for fragment creation
//!
//! ## Data Structure Choice
//! BTreeMap wrapped in RwLock: keys come out already sorted, which is the
//! global order of a metadata store.

mod table;

pub use table::MemTable;
