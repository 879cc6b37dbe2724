// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tile loader: predicated copies between bulk memory and unit scratch.
//!
//! Loads into scratch are asynchronous. [`CopyPipeline::issue`] records a
//! copy without performing it, [`CopyPipeline::fence`] closes the current
//! group, and [`CopyPipeline::wait`] completes every group except the `n`
//! most recent ones. A tile must not be read before the wait covering its
//! group, exactly as on hardware with `cp.async`.
//!
//! Stores and reloads of published outputs are synchronous and row/column
//! predicated; they never touch rows past the actual sequence length.

use super::element::Element;
use crate::memory::GlobalBuffer;

/// Most copy groups that may be in flight at once (double buffering).
pub const MAX_OUTSTANDING_GROUPS: usize = 2;

/// One `rows x head_dim` rectangle to stage from bulk memory into scratch.
#[derive(Debug, Clone, Copy)]
pub struct TileCopy<'a, E> {
    /// Source operand.
    pub src: &'a [E],
    /// Element offset of the tile's first row in `src`.
    pub src_offset: usize,
    /// Elements between consecutive source rows.
    pub src_row_stride: usize,
    /// Element offset of the destination tile in scratch.
    pub dst_offset: usize,
    /// Rows in the destination tile.
    pub rows: usize,
    /// Padded head dimension; the destination row length.
    pub head_dim: usize,
    /// Rows that exist in the source.
    pub valid_rows: usize,
    /// Head-dimension columns that exist in the source; the rest are zeroed.
    pub valid_cols: usize,
    /// Zero destination rows at or past `valid_rows` instead of leaving them.
    pub clear_oob_rows: bool,
}

impl<E: Element> TileCopy<'_, E> {
    fn execute(&self, smem: &mut [E]) {
        let zero = E::narrow(0.0);
        let hd = self.head_dim;
        let valid_cols = self.valid_cols.min(hd);
        for r in 0..self.rows {
            let dst = &mut smem[self.dst_offset + r * hd..self.dst_offset + (r + 1) * hd];
            if r < self.valid_rows {
                let start = self.src_offset + r * self.src_row_stride;
                dst[..valid_cols].copy_from_slice(&self.src[start..start + valid_cols]);
                dst[valid_cols..].fill(zero);
            } else if self.clear_oob_rows {
                dst.fill(zero);
            }
        }
    }
}

/// Deferred copies grouped by fences.
#[derive(Debug)]
pub struct CopyPipeline<'a, E> {
    pending: Vec<(usize, TileCopy<'a, E>)>,
    open_group: usize,
    completed_groups: usize,
}

impl<'a, E: Element> CopyPipeline<'a, E> {
    /// An empty pipeline. Capacity covers the steady state, so issuing does
    /// not allocate inside the key loop.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(4 * MAX_OUTSTANDING_GROUPS),
            open_group: 0,
            completed_groups: 0,
        }
    }

    /// Record a copy in the open group.
    pub fn issue(&mut self, copy: TileCopy<'a, E>) {
        self.pending.push((self.open_group, copy));
    }

    /// Close the open group.
    pub fn fence(&mut self) {
        self.open_group += 1;
        debug_assert!(
            self.open_group - self.completed_groups <= MAX_OUTSTANDING_GROUPS,
            "more than {MAX_OUTSTANDING_GROUPS} copy groups in flight"
        );
    }

    /// Complete every committed group except the `n` most recent, in issue order.
    pub fn wait(&mut self, n: usize, smem: &mut [E]) {
        let target = self.open_group.saturating_sub(n);
        if target <= self.completed_groups {
            return;
        }
        self.pending.retain(|(group, copy)| {
            if *group < target {
                copy.execute(smem);
                false
            } else {
                true
            }
        });
        self.completed_groups = target;
    }

    /// Committed groups not yet completed.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.open_group - self.completed_groups
    }
}

impl<E: Element> Default for CopyPipeline<'_, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination of a predicated store from scratch to bulk memory.
#[derive(Debug, Clone, Copy)]
pub struct TileStore<'a, E: Element> {
    /// Bulk-memory buffer.
    pub dst: &'a GlobalBuffer<E>,
    /// Element offset of the tile's first row.
    pub offset: usize,
    /// Elements between consecutive rows.
    pub row_stride: usize,
    /// Rows that exist in the destination.
    pub valid_rows: usize,
    /// Columns that exist in the destination.
    pub valid_cols: usize,
}

/// Write the in-bounds part of a `rows x head_dim` scratch tile to bulk memory.
pub fn store_tile<E: Element>(tile: &[E], head_dim: usize, store: &TileStore<'_, E>) {
    let rows = tile.len() / head_dim;
    for r in 0..rows.min(store.valid_rows) {
        let base = store.offset + r * store.row_stride;
        for (c, &value) in tile[r * head_dim..].iter().take(store.valid_cols.min(head_dim)).enumerate() {
            store.dst.store(base + c, value);
        }
    }
}

/// Read the in-bounds part of a bulk-memory tile into scratch; the remaining
/// rows and columns are zeroed.
pub fn load_tile<E: Element>(tile: &mut [E], head_dim: usize, src: &TileStore<'_, E>) {
    let zero = E::narrow(0.0);
    let valid_cols = src.valid_cols.min(head_dim);
    for (r, row) in tile.chunks_exact_mut(head_dim).enumerate() {
        if r < src.valid_rows {
            let base = src.offset + r * src.row_stride;
            for (c, slot) in row[..valid_cols].iter_mut().enumerate() {
                *slot = src.dst.load(base + c);
            }
            row[valid_cols..].fill(zero);
        } else {
            row.fill(zero);
        }
    }
}
