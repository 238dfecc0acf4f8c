//! Asynchronous I/O Module
//!
//! Non-blocking counterparts of the buffer read/write protocol.
//!
//! ## Responsibilities
//! - Validate a request at submission and hand it to the worker pool
//! - Service the requests of one handle strictly in submission order
//! - Publish each outcome exactly once: callback first, then the ticket
//!
//! ## Request Lifecycle
//! ```text
//! aio_read/aio_write ──► AioQueue (per handle, FIFO) ──► AioPool worker
//!        │                                                   │
//!        ▼                                                   ▼
//!    AioTicket ◄──────────── completion slot ◄──── callback(&AioCompletion)
//! ```

mod pool;

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam::channel::{Receiver, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TileError};
use crate::schema::Subarray;

pub use pool::AioPool;
pub(crate) use pool::Job;

/// Completion callback; the closure carries whatever user data it needs
pub type AioCallback = Box<dyn FnOnce(&AioCompletion) + Send + 'static>;

// =============================================================================
// Request / Completion
// =============================================================================

/// One asynchronous read or write
///
/// `buffers` follow the same slot convention as synchronous calls. For reads
/// each buffer's length is its capacity; the filled buffers come back in the
/// completion together with the bytes used per slot.
pub struct AioRequest {
    pub buffers: Vec<Vec<u8>>,
    /// Reads only: restart the read over this subarray first
    pub subarray: Option<Subarray>,
    callback: Option<AioCallback>,
}

impl AioRequest {
    pub fn new(buffers: Vec<Vec<u8>>) -> Self {
        Self {
            buffers,
            subarray: None,
            callback: None,
        }
    }

    pub fn with_subarray(mut self, subarray: &[(i64, i64)]) -> Self {
        self.subarray = Some(subarray.to_vec());
        self
    }

    /// Run `callback` on the worker once the request completes
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&AioCompletion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn into_parts(self) -> (Vec<Vec<u8>>, Option<Subarray>, Option<AioCallback>) {
        (self.buffers, self.subarray, self.callback)
    }
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioRequest")
            .field("buffers", &self.buffers.len())
            .field("subarray", &self.subarray)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Outcome written into a request's completion slot
#[derive(Debug)]
pub enum AioStatus {
    Completed,
    /// A read stopped because a cell did not fit; resubmit to continue
    Overflow,
    Failed(TileError),
}

/// Everything a completed request hands back
#[derive(Debug)]
pub struct AioCompletion {
    pub status: AioStatus,
    /// The request's buffers (filled, for reads)
    pub buffers: Vec<Vec<u8>>,
    /// Bytes used per slot (reads)
    pub sizes: Vec<usize>,
}

impl AioCompletion {
    pub fn is_ok(&self) -> bool {
        !matches!(self.status, AioStatus::Failed(_))
    }
}

/// Single-assignment completion slot of one submitted request
#[derive(Debug)]
pub struct AioTicket {
    receiver: Receiver<AioCompletion>,
}

impl AioTicket {
    pub(crate) fn new(receiver: Receiver<AioCompletion>) -> Self {
        Self { receiver }
    }

    /// Block until the request completes
    pub fn wait(self) -> AioCompletion {
        self.receiver.recv().unwrap_or_else(|_| AioCompletion {
            status: AioStatus::Failed(TileError::InvalidHandle(
                "request dropped before completion".to_string(),
            )),
            buffers: Vec::new(),
            sizes: Vec::new(),
        })
    }

    /// The completion, if the request has finished
    pub fn try_wait(&self) -> Option<AioCompletion> {
        match self.receiver.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(AioCompletion {
                status: AioStatus::Failed(TileError::InvalidHandle(
                    "request dropped before completion".to_string(),
                )),
                buffers: Vec::new(),
                sizes: Vec::new(),
            }),
        }
    }
}

// =============================================================================
// Per-handle Queue
// =============================================================================

/// FIFO of one handle's requests
///
/// At most one drain job per queue is on the pool at a time, which keeps a
/// handle's requests in submission order while different handles proceed
/// in parallel.
pub(crate) struct AioQueue {
    state: Mutex<QueueState>,
    idle: Condvar,
}

struct QueueState {
    pending: VecDeque<Job>,
    running: bool,
}

impl AioQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: false,
            }),
            idle: Condvar::new(),
        })
    }

    /// Enqueue a job, starting a drain on the pool if none is running
    pub fn submit(self: &Arc<Self>, pool: &AioPool, job: Job) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.push_back(job);
        if state.running {
            return Ok(());
        }
        state.running = true;
        drop(state);

        let queue = self.clone();
        let started = pool.execute(Box::new(move || queue.drain()));
        if started.is_err() {
            let mut state = self.state.lock();
            state.pending.pop_back();
            state.running = false;
            self.idle.notify_all();
        }
        started
    }

    fn drain(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        self.idle.notify_all();
                        return;
                    }
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::warn!("AIO request panicked");
            }
        }
    }

    /// Block until every submitted job has run
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.running || !state.pending.is_empty() {
            self.idle.wait(&mut state);
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}
