//! Cell ordering
//!
//! Global order = tile order across space tiles (when the schema declares tile
//! extents), then cell order within a tile. Every ordering decision in the
//! engine (sparse merge, dense enumeration, tile cutting) goes through here.

use super::{ArraySchema, Layout, Subarray};

impl ArraySchema {
    /// Sort key of a cell: comparing two keys lexicographically compares the
    /// cells in global order.
    pub(crate) fn order_key(&self, coords: &[i64]) -> Vec<i64> {
        let dims = self.dimensions();
        let mut key = Vec::with_capacity(coords.len() * 2 + 1);

        if let Some(extents) = self.tile_extents() {
            let tile: Vec<i64> = coords
                .iter()
                .zip(dims)
                .zip(&extents)
                .map(|((&c, d), &ext)| (c - d.domain.0) / ext)
                .collect();
            push_permuted(&mut key, &tile, self.tile_order());
        }

        match self.cell_order() {
            Layout::Hilbert => {
                let h = self.hilbert_index(coords);
                // Map u64 onto i64 preserving order
                key.push((h ^ (1u64 << 63)) as i64);
                key.extend_from_slice(coords);
            }
            layout => push_permuted(&mut key, coords, layout),
        }
        key
    }

    /// Hilbert index of a cell over domain-relative coordinates.
    ///
    /// Each dimension gets `64 / dim_num` bits; wider domains are coarsened
    /// by shifting, with ties broken row-major by the caller.
    pub(crate) fn hilbert_index(&self, coords: &[i64]) -> u64 {
        let dims = self.dimensions();
        let n = dims.len();
        let needed = dims
            .iter()
            .map(|d| bits_needed((d.domain.1 - d.domain.0) as u64))
            .max()
            .unwrap_or(1);
        let bits = needed.min(64 / n as u32).max(1);

        let mut x: Vec<u64> = coords
            .iter()
            .zip(dims)
            .map(|(&c, d)| {
                let rel = (c - d.domain.0) as u64;
                let shift = bits_needed((d.domain.1 - d.domain.0) as u64).saturating_sub(bits);
                rel >> shift
            })
            .collect();
        hilbert_from_axes(&mut x, bits)
    }

    /// Rectangles of the space tiles intersecting `subarray`, in tile order,
    /// each clipped to the subarray.
    pub(crate) fn tile_rects(&self, subarray: &[(i64, i64)]) -> TileRects {
        let dims = self.dimensions();
        let extents = self
            .tile_extents()
            .unwrap_or_else(|| dims.iter().map(|d| d.domain.1 - d.domain.0 + 1).collect());
        let domain_lo: Vec<i64> = dims.iter().map(|d| d.domain.0).collect();
        let tile_range: Subarray = subarray
            .iter()
            .zip(&domain_lo)
            .zip(&extents)
            .map(|((&(lo, hi), &dlo), &ext)| ((lo - dlo) / ext, (hi - dlo) / ext))
            .collect();
        let current = Some(tile_range.iter().map(|&(lo, _)| lo).collect());

        TileRects {
            domain_lo,
            extents,
            subarray: subarray.to_vec(),
            tile_order: self.tile_order(),
            tile_range,
            current,
        }
    }

    /// Every cell of `subarray` in global order (dense layouts only)
    pub(crate) fn global_cells(&self, subarray: &[(i64, i64)]) -> GlobalCells {
        GlobalCells {
            rects: self.tile_rects(subarray),
            cell_order: self.cell_order(),
            rect: None,
            current: None,
        }
    }
}

fn push_permuted(key: &mut Vec<i64>, values: &[i64], layout: Layout) {
    match layout {
        Layout::ColMajor => key.extend(values.iter().rev()),
        _ => key.extend_from_slice(values),
    }
}

fn bits_needed(range: u64) -> u32 {
    (64 - range.leading_zeros()).max(1)
}

/// Skilling's transform from axes to the transposed Hilbert index, then
/// interleave the transposed words into a single integer.
fn hilbert_from_axes(x: &mut [u64], bits: u32) -> u64 {
    let n = x.len();
    let m = 1u64 << (bits - 1);

    // Inverse undo excess work
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }

    let mut h = 0u64;
    for b in (0..bits).rev() {
        for v in x.iter() {
            h = (h << 1) | ((v >> b) & 1);
        }
    }
    h
}

// =============================================================================
// Rectangle Enumeration
// =============================================================================

/// Advance `coords` to the next cell of `rect` in `layout` order.
/// Returns false once the rectangle is exhausted.
pub(crate) fn next_in_rect(coords: &mut [i64], rect: &[(i64, i64)], layout: Layout) -> bool {
    let n = coords.len();
    let step = |d: usize, coords: &mut [i64]| -> bool {
        if coords[d] < rect[d].1 {
            coords[d] += 1;
            true
        } else {
            coords[d] = rect[d].0;
            false
        }
    };
    match layout {
        Layout::ColMajor => (0..n).any(|d| step(d, coords)),
        _ => (0..n).rev().any(|d| step(d, coords)),
    }
}

/// Coordinates of the `rank`-th cell of `rect` in `layout` order
pub(crate) fn coords_at(rect: &[(i64, i64)], layout: Layout, mut rank: u64) -> Vec<i64> {
    let n = rect.len();
    let mut coords = vec![0i64; n];
    let mut place = |d: usize| {
        let (lo, hi) = rect[d];
        let len = (hi - lo + 1) as u64;
        coords[d] = lo + (rank % len) as i64;
        rank /= len;
    };
    match layout {
        Layout::ColMajor => (0..n).for_each(&mut place),
        _ => (0..n).rev().for_each(&mut place),
    }
    coords
}

/// Iterator over clipped space-tile rectangles in tile order
pub(crate) struct TileRects {
    domain_lo: Vec<i64>,
    extents: Vec<i64>,
    subarray: Subarray,
    tile_order: Layout,
    tile_range: Subarray,
    current: Option<Vec<i64>>,
}

impl Iterator for TileRects {
    type Item = Subarray;

    fn next(&mut self) -> Option<Subarray> {
        let tile = self.current.take()?;

        let rect = tile
            .iter()
            .zip(&self.domain_lo)
            .zip(&self.extents)
            .zip(&self.subarray)
            .map(|(((&t, &dlo), &ext), &(slo, shi))| {
                let lo = dlo + t * ext;
                (lo.max(slo), (lo + ext - 1).min(shi))
            })
            .collect();

        let mut next = tile;
        if next_in_rect(&mut next, &self.tile_range, self.tile_order) {
            self.current = Some(next);
        }
        Some(rect)
    }
}

/// Iterator over every cell of a subarray in global order
pub(crate) struct GlobalCells {
    rects: TileRects,
    cell_order: Layout,
    rect: Option<Subarray>,
    current: Option<Vec<i64>>,
}

impl Iterator for GlobalCells {
    type Item = Vec<i64>;

    fn next(&mut self) -> Option<Vec<i64>> {
        loop {
            if let Some(rect) = &self.rect {
                if let Some(coords) = self.current.as_mut() {
                    let out = coords.clone();
                    if !next_in_rect(coords, rect, self.cell_order) {
                        self.current = None;
                    }
                    return Some(out);
                }
            }
            let rect = self.rects.next()?;
            self.current = Some(rect.iter().map(|&(lo, _)| lo).collect());
            self.rect = Some(rect);
        }
    }
}
