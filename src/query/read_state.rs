//! Buffer read protocol
//!
//! Each selected column keeps its own cursor into the merged cell stream, so
//! a column whose buffer overflowed resumes exactly where it stopped while
//! the other columns keep their progress.
//!
//! ## Buffer Slots
//! ```text
//! fixed-size attribute:  [ values ]
//! var-size attribute:    [ offsets (u64 LE, relative to this call) ][ values ]
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TileError};
use crate::schema::{ArraySchema, OFFSET_SIZE};
use crate::storage::FragmentReader;

use super::{build_sources, CellMerger, ReadStatus, Selection};

/// Resumable state of one read session
pub(crate) struct ReadState {
    schema: Arc<ArraySchema>,
    /// Selected columns, in caller order
    columns: Vec<usize>,
    merger: CellMerger,
    /// Merged cells not yet returned by every column
    queue: VecDeque<Vec<Bytes>>,
    /// Absolute index of `queue[0]`
    base: u64,
    /// Absolute index of the next cell each column returns
    positions: Vec<u64>,
    /// Whether the last read overflowed, per column
    overflow: Vec<bool>,
    /// The merger has produced its last cell
    exhausted: bool,
}

/// Per-column result of one fill
struct FillResult {
    used: usize,
    var_used: usize,
    overflowed: bool,
}

impl ReadState {
    /// Start a read over a fragment snapshot
    pub fn new(
        schema: Arc<ArraySchema>,
        fragments: &[Arc<FragmentReader>],
        selection: &Selection,
        columns: Vec<usize>,
    ) -> Result<Self> {
        let sources = build_sources(&schema, fragments, selection)?;
        let merger = CellMerger::new(schema.clone(), sources, columns.clone());
        let n = columns.len();
        Ok(Self {
            schema,
            columns,
            merger,
            queue: VecDeque::new(),
            base: 0,
            positions: vec![0; n],
            overflow: vec![false; n],
            exhausted: false,
        })
    }

    /// Number of buffer slots a read over these columns takes
    pub fn slot_count(&self) -> usize {
        slot_count(&self.schema, &self.columns)
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Whether the last read overflowed `column`
    pub fn overflow(&self, column: usize) -> bool {
        self.columns
            .iter()
            .position(|&c| c == column)
            .map(|i| self.overflow[i])
            .unwrap_or(false)
    }

    /// Every selected cell has been returned for every column
    pub fn is_complete(&self) -> bool {
        self.exhausted
            && self
                .positions
                .iter()
                .all(|&p| p == self.base + self.queue.len() as u64)
    }

    /// Fill `buffers` with as many whole cells as fit, returning the bytes
    /// used per slot and the overall status.
    pub fn read(&mut self, buffers: &mut [&mut [u8]]) -> Result<(Vec<usize>, ReadStatus)> {
        let expected = self.slot_count();
        if buffers.len() != expected {
            return Err(TileError::BufferMismatch(format!(
                "expected {} buffers for {} attributes, got {}",
                expected,
                self.columns.len(),
                buffers.len()
            )));
        }

        let mut sizes = vec![0usize; expected];
        let mut slot = 0;
        for i in 0..self.columns.len() {
            let is_var = self.schema.column_is_var(self.columns[i]);
            let result = if is_var {
                let (head, tail) = buffers.split_at_mut(slot + 1);
                self.fill(i, &mut head[slot][..], Some(&mut tail[0][..]))?
            } else {
                self.fill(i, &mut buffers[slot][..], None)?
            };

            self.overflow[i] = result.overflowed;
            sizes[slot] = result.used;
            if is_var {
                sizes[slot + 1] = result.var_used;
                slot += 2;
            } else {
                slot += 1;
            }
        }
        self.trim();

        // Look one cell ahead so a read that drained the selection says so
        if !self.exhausted && self.queue.is_empty() {
            self.pull()?;
        }

        let status = if self.overflow.iter().any(|&o| o) {
            ReadStatus::Overflow
        } else if self.is_complete() {
            ReadStatus::Complete
        } else {
            ReadStatus::Incomplete
        };
        Ok((sizes, status))
    }

    /// Copy whole cells of column `i` until the buffer is full or the
    /// selection is exhausted.
    ///
    /// Overflow means capacity remained but the next cell did not fit; a
    /// buffer filled to the last byte is not an overflow.
    fn fill(&mut self, i: usize, buf: &mut [u8], mut var_buf: Option<&mut [u8]>) -> Result<FillResult> {
        let mut used = 0;
        let mut var_used = 0;

        loop {
            let idx = (self.positions[i] - self.base) as usize;
            if idx >= self.queue.len() && !self.pull()? {
                break;
            }
            let value = &self.queue[idx][i];

            let fits = match var_buf.as_deref_mut() {
                None => used + value.len() <= buf.len(),
                Some(var) => used + OFFSET_SIZE <= buf.len() && var_used + value.len() <= var.len(),
            };
            if !fits {
                // Only the slots that stopped the cell count
                let room_left = match var_buf.as_deref() {
                    None => used < buf.len(),
                    Some(var) => {
                        let offsets_short = used + OFFSET_SIZE > buf.len();
                        let values_short = var_used + value.len() > var.len();
                        (offsets_short && used < buf.len()) || (values_short && var_used < var.len())
                    }
                };
                return Ok(FillResult {
                    used,
                    var_used,
                    overflowed: room_left || used == 0,
                });
            }

            match var_buf.as_deref_mut() {
                None => {
                    buf[used..used + value.len()].copy_from_slice(value);
                    used += value.len();
                }
                Some(var) => {
                    buf[used..used + OFFSET_SIZE].copy_from_slice(&(var_used as u64).to_le_bytes());
                    used += OFFSET_SIZE;
                    var[var_used..var_used + value.len()].copy_from_slice(value);
                    var_used += value.len();
                }
            }
            self.positions[i] += 1;
        }

        Ok(FillResult {
            used,
            var_used,
            overflowed: false,
        })
    }

    /// Pull one merged cell into the queue; false once the merge is exhausted
    fn pull(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        match self.merger.next_cell()? {
            Some(cell) => {
                self.queue.push_back(cell.values);
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    /// Drop cells every column has returned
    fn trim(&mut self) {
        let min = self.positions.iter().copied().min().unwrap_or(self.base);
        while self.base < min && self.queue.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// Buffer slots taken by `columns`: one each, two for var-size columns
pub(crate) fn slot_count(schema: &ArraySchema, columns: &[usize]) -> usize {
    columns
        .iter()
        .map(|&c| if schema.column_is_var(c) { 2 } else { 1 })
        .sum()
}
