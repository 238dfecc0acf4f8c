//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Sorted in-memory buffer of keyed cells
///
/// Keys are the raw stored key bytes (NUL terminator included); each entry
/// holds one value per attribute, in attribute order.
pub struct MemTable {
    data: RwLock<BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
    /// Approximate size in bytes (keys + values)
    size: AtomicUsize,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
        }
    }

    /// Values of a key, if buffered
    pub fn get(&self, key: &[u8]) -> Option<Vec<Vec<u8>>> {
        self.data.read().get(key).cloned()
    }

    /// Insert or overwrite a key
    pub fn put(&self, key: Vec<u8>, values: Vec<Vec<u8>>) {
        let key_len = key.len();
        let value_len: usize = values.iter().map(Vec::len).sum();
        let mut data = self.data.write();
        match data.insert(key, values) {
            Some(old) => {
                // Key already counted; swap the old values' size for the new
                let old_len: usize = old.iter().map(Vec::len).sum();
                self.size.fetch_sub(old_len, Ordering::SeqCst);
                self.size.fetch_add(value_len, Ordering::SeqCst);
            }
            None => {
                self.size.fetch_add(key_len + value_len, Ordering::SeqCst);
            }
        }
    }

    /// Approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Check if the buffer reached its seal limit
    pub fn should_seal(&self, size_limit: usize) -> bool {
        self.size() >= size_limit
    }

    /// Take every entry out in sorted key order, leaving the table empty
    pub fn drain(&self) -> Vec<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut data = self.data.write();
        self.size.store(0, Ordering::SeqCst);
        std::mem::take(&mut *data).into_iter().collect()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
