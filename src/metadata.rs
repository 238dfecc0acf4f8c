//! Metadata Stores
//!
//! Key-value flavour of an array: cells are addressed by a string key
//! instead of coordinates. Storage, merge and consolidation are shared with
//! arrays; only the addressing differs.
//!
//! ## Key Buffer
//! ```text
//! keys:   "alpha\0beta\0gamma\0"      one NUL-terminated key per cell
//! values: one slot per attribute (two for variable-length), as for arrays
//! ```

use std::sync::Arc;

use crate::array::{Array, ArrayMode, ReadOutcome};
use crate::error::Result;
use crate::iterator::ArrayIterator;
use crate::query::Selection;
use crate::schema::ArraySchema;

/// Open handle on a metadata store
pub struct Metadata {
    array: Array,
}

impl Metadata {
    pub(crate) fn new(array: Array) -> Self {
        Self { array }
    }

    /// Write one value per attribute for every key in `keys`
    ///
    /// Repeating a key (in this call or a later one) overwrites it.
    pub fn write(&self, keys: &[u8], buffers: &[&[u8]]) -> Result<()> {
        self.array.write_keyed(keys, buffers)
    }

    /// Look up one key
    ///
    /// Calling again with the same key after an overflow resumes the read;
    /// any other call starts a fresh lookup.
    pub fn read(&self, key: &str, buffers: &mut [&mut [u8]]) -> Result<ReadOutcome> {
        let mut stored = Vec::with_capacity(key.len() + 1);
        stored.extend_from_slice(key.as_bytes());
        stored.push(0);
        self.array.read_selection(Selection::Key(stored), buffers)
    }

    /// Whether the last read overflowed `attribute`
    pub fn overflow(&self, attribute: &str) -> Result<bool> {
        self.array.overflow(attribute)
    }

    pub fn reset_attributes(&self, attributes: &[&str]) -> Result<()> {
        self.array.reset_attributes(attributes)
    }

    /// Publish everything written so far
    pub fn sync(&self) -> Result<()> {
        self.array.sync()
    }

    /// Iterate every key of the store
    pub fn iter(self) -> Result<MetadataIterator> {
        if self.array.mode() == ArrayMode::Read {
            self.array.reset_selection(Selection::Everything)?;
        }
        Ok(MetadataIterator {
            inner: self.array.iter()?,
        })
    }

    pub fn finalize(self) -> Result<()> {
        self.array.finalize()
    }

    pub fn schema(&self) -> Arc<ArraySchema> {
        self.array.schema()
    }

    pub fn mode(&self) -> ArrayMode {
        self.array.mode()
    }
}

/// Iterator over every key of a metadata store, in key order
pub struct MetadataIterator {
    inner: ArrayIterator,
}

impl MetadataIterator {
    /// Value of the `idx`-th selected attribute (`__key` included, with its
    /// terminator, when selected)
    pub fn get_value(&self, idx: usize) -> Result<&[u8]> {
        self.inner.get_value(idx)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    pub fn end(&self) -> bool {
        self.inner.end()
    }

    pub fn finalize(self) -> Result<()> {
        self.inner.finalize()
    }
}
