//! Cell Iterator
//!
//! A forward-only view over a read handle, one cell at a time.
//!
//! ## Refill
//! ```text
//!   column queues              read handle
//!   a1: [c4 c5 c6]     ──►  (a1 has cells: zero-length buffer, keeps its place)
//!   a2: []             ──►  (a2 is empty: refill into its own buffer)
//! ```
//! Every column keeps its own queue of decoded cells and only empty columns
//! are refilled. A column that cannot fit a single cell gets its buffer
//! doubled, so overflow never reaches the caller.

use std::collections::VecDeque;

use crate::array::{Array, ArrayMode};
use crate::error::{Result, TileError};
use crate::schema::OFFSET_SIZE;

/// Iterator over the cells of a read handle
pub struct ArrayIterator {
    array: Array,
    columns: Vec<ColumnBuffer>,
    /// No cells are left
    end: bool,
    /// An earlier refill failed; the iterator is unusable
    failed: bool,
}

struct ColumnBuffer {
    /// `None` for variable-length columns
    cell_size: Option<usize>,
    /// Values (fixed) or offsets (var)
    buf: Vec<u8>,
    /// Values of variable-length columns
    var_buf: Vec<u8>,
    cells: VecDeque<Vec<u8>>,
}

impl ArrayIterator {
    pub(crate) fn new(array: Array, buffer_size: usize) -> Result<Self> {
        if array.mode() != ArrayMode::Read {
            return Err(TileError::ModeViolation(
                "iterators need a read handle".to_string(),
            ));
        }

        let schema = array.schema();
        let columns = array
            .selected_columns()?
            .into_iter()
            .map(|c| {
                let cell_size = schema.column_cell_size(c);
                ColumnBuffer {
                    cell_size,
                    buf: vec![0; buffer_size.max(1)],
                    var_buf: match cell_size {
                        Some(_) => Vec::new(),
                        None => vec![0; buffer_size.max(1)],
                    },
                    cells: VecDeque::new(),
                }
            })
            .collect();

        let mut iter = Self {
            array,
            columns,
            end: false,
            failed: false,
        };
        iter.fill()?;
        Ok(iter)
    }

    /// Value of the `idx`-th selected attribute in the current cell
    pub fn get_value(&self, idx: usize) -> Result<&[u8]> {
        self.check_usable()?;
        if self.end {
            return Err(TileError::InvalidArgument("iterator is at its end".to_string()));
        }
        let column = self.columns.get(idx).ok_or_else(|| {
            TileError::InvalidArgument(format!(
                "attribute index {} out of {} selected",
                idx,
                self.columns.len()
            ))
        })?;
        column
            .cells
            .front()
            .map(Vec::as_slice)
            .ok_or_else(|| TileError::InvalidArgument("iterator is at its end".to_string()))
    }

    /// Move to the next cell
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.end {
            return Ok(());
        }
        for column in &mut self.columns {
            column.cells.pop_front();
        }
        self.fill()
    }

    /// Whether every cell has been visited
    pub fn end(&self) -> bool {
        self.end
    }

    /// Number of selected attributes
    pub fn attribute_num(&self) -> usize {
        self.columns.len()
    }

    /// Release the underlying read handle
    pub fn finalize(self) -> Result<()> {
        self.array.finalize()
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(TileError::InvalidHandle(
                "iterator failed on an earlier refill".to_string(),
            ));
        }
        Ok(())
    }

    /// Refill until every column has a current cell or the read is complete
    fn fill(&mut self) -> Result<()> {
        let result = self.try_fill();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn try_fill(&mut self) -> Result<()> {
        while self.columns.iter().any(|c| c.cells.is_empty()) {
            let needed: Vec<bool> = self.columns.iter().map(|c| c.cells.is_empty()).collect();

            let sizes = {
                let mut slots: Vec<&mut [u8]> = Vec::new();
                for (column, &needed) in self.columns.iter_mut().zip(&needed) {
                    let var = column.cell_size.is_none();
                    if needed {
                        slots.push(&mut column.buf[..]);
                        if var {
                            slots.push(&mut column.var_buf[..]);
                        }
                    } else {
                        slots.push(&mut column.buf[..0]);
                        if var {
                            slots.push(&mut column.var_buf[..0]);
                        }
                    }
                }
                self.array.read(&mut slots)?.sizes
            };

            let mut slot = 0;
            let mut progressed = false;
            for (column, &needed) in self.columns.iter_mut().zip(&needed) {
                let var = column.cell_size.is_none();
                if needed {
                    let added = column.decode(sizes[slot], if var { sizes[slot + 1] } else { 0 });
                    progressed |= added > 0;
                    if added == 0 {
                        column.grow();
                    }
                }
                slot += if var { 2 } else { 1 };
            }

            if !progressed && self.array.is_complete()? {
                if self.columns.iter().any(|c| !c.cells.is_empty()) {
                    return Err(TileError::Corruption(
                        "attributes returned different cell counts".to_string(),
                    ));
                }
                self.end = true;
                return Ok(());
            }
        }
        Ok(())
    }
}

impl ColumnBuffer {
    /// Split the bytes of one read into cells; returns how many were added
    fn decode(&mut self, used: usize, var_used: usize) -> usize {
        match self.cell_size {
            Some(size) => {
                for cell in self.buf[..used].chunks_exact(size) {
                    self.cells.push_back(cell.to_vec());
                }
                used / size
            }
            None => {
                let offsets: Vec<usize> = self.buf[..used]
                    .chunks_exact(OFFSET_SIZE)
                    .map(|b| {
                        let mut raw = [0u8; OFFSET_SIZE];
                        raw.copy_from_slice(b);
                        u64::from_le_bytes(raw) as usize
                    })
                    .collect();
                for (i, &start) in offsets.iter().enumerate() {
                    let end = offsets.get(i + 1).copied().unwrap_or(var_used);
                    self.cells.push_back(self.var_buf[start..end].to_vec());
                }
                offsets.len()
            }
        }
    }

    /// Double the buffers so the next cell fits eventually
    fn grow(&mut self) {
        let size = self.buf.len() * 2;
        self.buf.resize(size, 0);
        if self.cell_size.is_none() {
            let size = self.var_buf.len() * 2;
            self.var_buf.resize(size, 0);
        }
    }
}
