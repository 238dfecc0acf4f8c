//! Array Handles
//!
//! An open handle binds one array, one access mode, a subarray and a
//! selection of attributes.
//!
//! ## Responsibilities
//! - Route synchronous reads and writes into the buffer protocol
//! - Queue asynchronous requests in submission order
//! - Surface `InvalidHandle` once the array was deleted, moved or cleared
//! - Publish (write) or release (read) everything on finalize

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel;
use parking_lot::Mutex;

use crate::aio::{AioCompletion, AioPool, AioQueue, AioRequest, AioStatus, AioTicket};
use crate::error::{Result, TileError};
use crate::iterator::ArrayIterator;
use crate::query::read_state::slot_count;
use crate::query::write_state::parse_batch;
use crate::query::{ReadState, ReadStatus, Selection, WriteSession};
use crate::schema::{ArraySchema, Subarray};
use crate::storage_manager::ArrayEntry;

/// Access mode of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMode {
    Read,
    Write,
}

/// Result of one synchronous read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes written into each buffer slot
    pub sizes: Vec<usize>,
    pub status: ReadStatus,
}

/// Open handle on an array
///
/// Obtained from [`StorageManager::array_init`](crate::StorageManager::array_init)
/// and released with [`finalize`](Self::finalize). Dropping a write handle
/// without finalizing discards everything it has not synced.
pub struct Array {
    inner: Arc<HandleInner>,
}

pub(crate) struct HandleInner {
    entry: Arc<ArrayEntry>,
    /// Generation of the array when the handle was opened
    generation: u64,
    mode: ArrayMode,
    session: Mutex<Session>,
    aio: Arc<AioQueue>,
    pool: Arc<AioPool>,
    iterator_buffer_size: usize,
}

enum Session {
    Read(ReadSession),
    Write(WriteSession),
    Closed,
}

struct ReadSession {
    selection: Selection,
    state: ReadState,
}

impl Array {
    /// Open a handle (called by the storage manager)
    pub(crate) fn open(
        entry: Arc<ArrayEntry>,
        mode: ArrayMode,
        subarray: Option<&[(i64, i64)]>,
        attributes: &[&str],
        pool: Arc<AioPool>,
        iterator_buffer_size: usize,
        metadata_limit: usize,
    ) -> Result<Self> {
        let schema = entry.schema.clone();
        let subarray: Subarray = match subarray {
            Some(s) if schema.is_keyed() => {
                return Err(TileError::InvalidArgument(format!(
                    "metadata '{}' takes no subarray ({} ranges given)",
                    schema.name(),
                    s.len()
                )))
            }
            Some(s) => {
                schema.check_subarray(s)?;
                s.to_vec()
            }
            None => schema.domain(),
        };

        let mut columns = schema.resolve_columns(attributes)?;
        let session = match mode {
            ArrayMode::Read => {
                let selection = default_selection(&schema, subarray);
                let state = ReadState::new(
                    schema.clone(),
                    &entry.fragments.snapshot(),
                    &selection,
                    columns,
                )?;
                Session::Read(ReadSession { selection, state })
            }
            ArrayMode::Write => {
                // Metadata keys travel in their own buffer
                if schema.is_keyed() && !columns.contains(&schema.coords_column()) {
                    columns.push(schema.coords_column());
                }
                Session::Write(WriteSession::new(
                    schema.clone(),
                    columns,
                    &subarray,
                    metadata_limit,
                )?)
            }
        };

        let generation = entry.generation.load(Ordering::SeqCst);
        Ok(Self {
            inner: Arc::new(HandleInner {
                entry,
                generation,
                mode,
                session: Mutex::new(session),
                aio: AioQueue::new(),
                pool,
                iterator_buffer_size,
            }),
        })
    }

    // =========================================================================
    // Synchronous Protocol
    // =========================================================================

    /// Append one batch of cells (write handles)
    pub fn write(&self, buffers: &[&[u8]]) -> Result<()> {
        self.inner.write(buffers, None)
    }

    /// Fill `buffers` with the next cells (read handles)
    pub fn read(&self, buffers: &mut [&mut [u8]]) -> Result<ReadOutcome> {
        self.inner.read(buffers)
    }

    /// Restart the read over a new subarray
    pub fn reset_subarray(&self, subarray: &[(i64, i64)]) -> Result<()> {
        let schema = self.schema();
        if schema.is_keyed() {
            return Err(TileError::InvalidArgument(format!(
                "metadata '{}' has no subarray",
                schema.name()
            )));
        }
        schema.check_subarray(subarray)?;
        self.inner
            .reset(Some(Selection::Region(subarray.to_vec())), None)
    }

    /// Restart the read over a new attribute selection
    pub fn reset_attributes(&self, attributes: &[&str]) -> Result<()> {
        let columns = self.schema().resolve_columns(attributes)?;
        self.inner.reset(None, Some(columns))
    }

    /// Whether the last read overflowed `attribute`
    pub fn overflow(&self, attribute: &str) -> Result<bool> {
        let column = self.schema().column_index(attribute).ok_or_else(|| {
            TileError::InvalidArgument(format!("Unknown attribute '{}'", attribute))
        })?;
        self.inner.with_read(|read| Ok(read.state.overflow(column)))
    }

    /// Whether every selected cell has been returned
    pub fn is_complete(&self) -> Result<bool> {
        self.inner.with_read(|read| Ok(read.state.is_complete()))
    }

    /// Publish what was written so far; the handle stays open
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Force the already-cut tiles of one attribute to stable storage
    pub fn sync_attribute(&self, attribute: &str) -> Result<()> {
        let column = self.schema().column_index(attribute).ok_or_else(|| {
            TileError::InvalidArgument(format!("Unknown attribute '{}'", attribute))
        })?;
        self.inner.sync_attribute(column)
    }

    /// Wait for pending requests, publish (write) and release the handle
    pub fn finalize(self) -> Result<()> {
        self.inner.finalize()
    }

    /// Turn a read handle into a cell iterator
    pub fn iter(self) -> Result<ArrayIterator> {
        let size = self.inner.iterator_buffer_size;
        ArrayIterator::new(self, size)
    }

    // =========================================================================
    // Asynchronous Protocol
    // =========================================================================

    /// Queue a read; validation errors are returned here, everything else
    /// through the completion.
    pub fn aio_read(&self, request: AioRequest) -> Result<AioTicket> {
        let inner = &self.inner;
        inner.check_mode(ArrayMode::Read)?;
        let (buffers, subarray, callback) = request.into_parts();

        let schema = inner.entry.schema.clone();
        if let Some(subarray) = &subarray {
            schema.check_subarray(subarray)?;
        }
        let expected = inner.with_read(|read| Ok(slot_count(&schema, read.state.columns())))?;
        if buffers.len() != expected {
            return Err(TileError::BufferMismatch(format!(
                "expected {} buffers, got {}",
                expected,
                buffers.len()
            )));
        }

        let (sender, receiver) = channel::bounded(1);
        let handle = inner.clone();
        inner.aio.submit(
            &inner.pool,
            Box::new(move || {
                let mut buffers = buffers;
                // Same subarray on an unfinished read: continue where it stopped
                let result = match subarray {
                    Some(s) => {
                        let selection = Selection::Region(s);
                        handle
                            .with_read(|read| {
                                Ok(read.selection == selection && !read.state.is_complete())
                            })
                            .and_then(|resume| match resume {
                                true => Ok(()),
                                false => handle.reset(Some(selection), None),
                            })
                    }
                    None => Ok(()),
                }
                .and_then(|_| {
                    let mut slots: Vec<&mut [u8]> =
                        buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
                    handle.read(&mut slots)
                });

                let completion = match result {
                    Ok(outcome) => AioCompletion {
                        status: match outcome.status {
                            ReadStatus::Overflow => AioStatus::Overflow,
                            _ => AioStatus::Completed,
                        },
                        buffers,
                        sizes: outcome.sizes,
                    },
                    Err(e) => AioCompletion {
                        status: AioStatus::Failed(e),
                        buffers,
                        sizes: Vec::new(),
                    },
                };
                complete(completion, callback, &sender);
            }),
        )?;
        Ok(AioTicket::new(receiver))
    }

    /// Queue a write; the buffers are validated before submission
    pub fn aio_write(&self, request: AioRequest) -> Result<AioTicket> {
        let inner = &self.inner;
        inner.check_mode(ArrayMode::Write)?;
        let (buffers, _, callback) = request.into_parts();

        {
            let slices: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
            let session = inner.session.lock();
            if let Session::Write(write) = &*session {
                parse_batch(&inner.entry.schema, write.columns(), &slices, None)?;
            }
        }

        let (sender, receiver) = channel::bounded(1);
        let handle = inner.clone();
        inner.aio.submit(
            &inner.pool,
            Box::new(move || {
                let slices: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
                let status = match handle.write(&slices, None) {
                    Ok(()) => AioStatus::Completed,
                    Err(e) => AioStatus::Failed(e),
                };
                let completion = AioCompletion {
                    status,
                    buffers,
                    sizes: Vec::new(),
                };
                complete(completion, callback, &sender);
            }),
        )?;
        Ok(AioTicket::new(receiver))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn schema(&self) -> Arc<ArraySchema> {
        self.inner.entry.schema.clone()
    }

    pub fn mode(&self) -> ArrayMode {
        self.inner.mode
    }

    /// Requests submitted and not yet started
    pub fn pending_requests(&self) -> usize {
        self.inner.aio.pending()
    }

    // =========================================================================
    // Crate-internal (metadata, iterator)
    // =========================================================================

    pub(crate) fn write_keyed(&self, keys: &[u8], buffers: &[&[u8]]) -> Result<()> {
        self.inner.write(buffers, Some(keys))
    }

    /// Point lookup: restart on `selection` unless the last read of the same
    /// selection overflowed and is being resumed.
    pub(crate) fn read_selection(
        &self,
        selection: Selection,
        buffers: &mut [&mut [u8]],
    ) -> Result<ReadOutcome> {
        let resume = self.inner.with_read(|read| {
            Ok(read.selection == selection
                && read.state.columns().iter().any(|&c| read.state.overflow(c)))
        })?;
        if !resume {
            self.inner.reset(Some(selection), None)?;
        }
        self.inner.read(buffers)
    }

    /// Restart the read over another selection
    pub(crate) fn reset_selection(&self, selection: Selection) -> Result<()> {
        self.inner.reset(Some(selection), None)
    }

    /// Selected columns of a read handle, in slot order
    pub(crate) fn selected_columns(&self) -> Result<Vec<usize>> {
        self.inner
            .with_read(|read| Ok(read.state.columns().to_vec()))
    }
}

/// Callback first, then the completion slot
fn complete(
    completion: AioCompletion,
    callback: Option<crate::aio::AioCallback>,
    sender: &channel::Sender<AioCompletion>,
) {
    if let Some(callback) = callback {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(&completion))).is_err() {
            tracing::warn!("AIO completion callback panicked");
        }
    }
    // The ticket may have been dropped; nobody is waiting then
    let _ = sender.send(completion);
}

fn default_selection(schema: &ArraySchema, subarray: Subarray) -> Selection {
    if schema.is_keyed() {
        Selection::Everything
    } else {
        Selection::Region(subarray)
    }
}

impl HandleInner {
    fn check_live(&self) -> Result<()> {
        if self.entry.generation.load(Ordering::SeqCst) != self.generation {
            return Err(TileError::InvalidHandle(format!(
                "'{}' was deleted, moved or cleared",
                self.entry.name
            )));
        }
        Ok(())
    }

    fn check_mode(&self, mode: ArrayMode) -> Result<()> {
        self.check_live()?;
        if self.mode != mode {
            return Err(TileError::ModeViolation(format!(
                "{:?} on a handle opened for {:?}",
                mode, self.mode
            )));
        }
        Ok(())
    }

    fn with_read<T>(&self, f: impl FnOnce(&mut ReadSession) -> Result<T>) -> Result<T> {
        self.check_mode(ArrayMode::Read)?;
        match &mut *self.session.lock() {
            Session::Read(read) => f(read),
            _ => Err(TileError::InvalidHandle("handle is finalized".to_string())),
        }
    }

    fn read(&self, buffers: &mut [&mut [u8]]) -> Result<ReadOutcome> {
        self.with_read(|read| {
            let (sizes, status) = read.state.read(buffers)?;
            Ok(ReadOutcome { sizes, status })
        })
    }

    fn write(&self, buffers: &[&[u8]], keys: Option<&[u8]>) -> Result<()> {
        self.check_mode(ArrayMode::Write)?;
        match &mut *self.session.lock() {
            Session::Write(write) => write.write(&self.entry.fragments, buffers, keys),
            _ => Err(TileError::InvalidHandle("handle is finalized".to_string())),
        }
    }

    /// Rebuild the read over a fresh fragment snapshot
    fn reset(&self, selection: Option<Selection>, columns: Option<Vec<usize>>) -> Result<()> {
        let schema = self.entry.schema.clone();
        let fragments = self.entry.fragments.snapshot();
        self.with_read(|read| {
            let selection = selection.unwrap_or_else(|| read.selection.clone());
            let columns = columns.unwrap_or_else(|| read.state.columns().to_vec());
            read.state = ReadState::new(schema, &fragments, &selection, columns)?;
            read.selection = selection;
            Ok(())
        })
    }

    fn sync(&self) -> Result<()> {
        self.check_mode(ArrayMode::Write)?;
        self.aio.wait_idle();
        match &mut *self.session.lock() {
            Session::Write(write) => write.sync(&self.entry.fragments),
            _ => Err(TileError::InvalidHandle("handle is finalized".to_string())),
        }
    }

    fn sync_attribute(&self, column: usize) -> Result<()> {
        self.check_mode(ArrayMode::Write)?;
        self.aio.wait_idle();
        match &mut *self.session.lock() {
            Session::Write(write) => write.sync_column(column),
            _ => Err(TileError::InvalidHandle("handle is finalized".to_string())),
        }
    }

    fn finalize(&self) -> Result<()> {
        // Pending requests complete before the handle goes away
        self.aio.wait_idle();

        let session = std::mem::replace(&mut *self.session.lock(), Session::Closed);
        let result = match session {
            Session::Closed => Err(TileError::InvalidHandle("handle is finalized".to_string())),
            Session::Read(_) => self.check_live(),
            Session::Write(mut write) => self.check_live().and_then(|_| {
                let result = write.finalize(&self.entry.fragments);
                self.entry.writer_open.store(false, Ordering::SeqCst);
                result
            }),
        };
        if result.is_ok() {
            tracing::debug!("Finalized {:?} handle on '{}'", self.mode, self.entry.name);
        }
        result
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let session = std::mem::replace(self.session.get_mut(), Session::Closed);
        if let Session::Write(_) = session {
            tracing::warn!(
                "Write handle on '{}' dropped without finalize; unsynced cells discarded",
                self.entry.name
            );
            // A stale handle no longer owns the writer slot
            if self.check_live().is_ok() {
                self.entry.writer_open.store(false, Ordering::SeqCst);
            }
        }
    }
}
