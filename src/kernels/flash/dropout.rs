// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Keyed dropout on attention probabilities.
//!
//! Random bytes come from Philox4x32-10 keyed by the launch seed. The counter
//! combines the launch offset with the (batch, head) pair and one of 32
//! lanes; the subsequence names a 16 x 32 block of the probability matrix.
//! Each lane owns 16 elements of its block in the m16n8 accumulator layout
//! and consumes one byte per element. The keep decision therefore depends
//! only on `(seed, offset, batch, head, row, col)`, which lets a backward
//! pass or a test rebuild the mask with [`dropout_keep`].

use super::element::Element;
use super::params::PhiloxArgs;

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;

/// Rows of one dropout block.
pub const DROPOUT_BLOCK_ROWS: usize = 16;
/// Columns of one dropout block.
pub const DROPOUT_BLOCK_COLS: usize = 32;
/// Lanes sharing one dropout block.
pub const DROPOUT_LANES: usize = 32;

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = u64::from(a) * u64::from(b);
    ((product >> 32) as u32, product as u32)
}

/// Philox4x32 with ten rounds.
#[must_use]
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for round in 0..PHILOX_ROUNDS {
        if round > 0 {
            key[0] = key[0].wrapping_add(PHILOX_W0);
            key[1] = key[1].wrapping_add(PHILOX_W1);
        }
        let (hi0, lo0) = mulhilo(PHILOX_M0, ctr[0]);
        let (hi1, lo1) = mulhilo(PHILOX_M1, ctr[2]);
        ctr = [hi1 ^ ctr[1] ^ key[0], lo1, hi0 ^ ctr[3] ^ key[1], lo0];
    }
    ctr
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn split_u64(x: u64) -> [u32; 2] {
    [x as u32, (x >> 32) as u32]
}

/// The 16 random bytes of `lane` in dropout block `(block_row, block_col)`.
#[must_use]
pub fn lane_bytes(
    philox: PhiloxArgs,
    batch: usize,
    head: usize,
    heads: usize,
    lane: usize,
    block_row: usize,
    block_col: usize,
) -> [u8; 16] {
    let stream = ((batch * heads + head) * DROPOUT_LANES + lane) as u64;
    let [c0, c1] = split_u64(philox.offset.wrapping_add(stream));
    let subsequence = ((block_row as u64) << 32) | (block_col as u64 & 0xFFFF_FFFF);
    let [c2, c3] = split_u64(subsequence);
    let words = philox4x32_10([c0, c1, c2, c3], split_u64(philox.seed));

    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Lane and byte index owning element `(row, col)` of its dropout block.
#[must_use]
pub const fn lane_and_slot(row: usize, col: usize) -> (usize, usize) {
    let r = row % DROPOUT_BLOCK_ROWS;
    let c = col % DROPOUT_BLOCK_COLS;
    let lane = (r % 8) * 4 + (c % 8) / 2;
    let within = (r >= 8) as usize * 2 + c % 2;
    let atom = c / 8;
    (lane, atom * 4 + within)
}

/// Block-relative `(row, col)` of byte `slot` of `lane`; inverse of [`lane_and_slot`].
#[must_use]
pub const fn slot_position(lane: usize, slot: usize) -> (usize, usize) {
    let atom = slot / 4;
    let within = slot % 4;
    let row = lane / 4 + 8 * (within / 2);
    let col = atom * 8 + (lane % 4) * 2 + within % 2;
    (row, col)
}

/// Whether element `(row, col)` of head `head` in batch item `batch` is kept.
///
/// `p_keep_u8` is `floor(keep_probability * 255)`; a byte at or below it keeps
/// the element.
#[must_use]
pub fn dropout_keep(
    philox: PhiloxArgs,
    batch: usize,
    head: usize,
    heads: usize,
    row: usize,
    col: usize,
    p_keep_u8: u8,
) -> bool {
    let (lane, slot) = lane_and_slot(row, col);
    let bytes = lane_bytes(
        philox,
        batch,
        head,
        heads,
        lane,
        row / DROPOUT_BLOCK_ROWS,
        col / DROPOUT_BLOCK_COLS,
    );
    bytes[slot] <= p_keep_u8
}

/// Where a probability tile sits in the full matrix.
#[derive(Debug, Clone, Copy)]
pub struct DropoutTile {
    /// Random stream.
    pub philox: PhiloxArgs,
    /// Batch item.
    pub batch: usize,
    /// Query head.
    pub head: usize,
    /// Query heads in the launch.
    pub heads: usize,
    /// Sequence row of tile row 0.
    pub row0: usize,
    /// Key column of tile column 0.
    pub col0: usize,
    /// Keep threshold.
    pub p_keep_u8: u8,
}

/// Drop elements of a `rows x cols` probability tile.
///
/// Dropped elements are zeroed, or negated when `encode_in_sign_bit` is set
/// so the mask can be recovered from the stored probabilities.
pub fn apply_dropout<E: Element>(p: &mut [E], cols: usize, tile: &DropoutTile, encode_in_sign_bit: bool) {
    let rows = p.len() / cols;
    if rows == 0 {
        return;
    }
    let zero = E::narrow(0.0);
    let first_block_row = tile.row0 / DROPOUT_BLOCK_ROWS;
    let last_block_row = (tile.row0 + rows - 1) / DROPOUT_BLOCK_ROWS;
    let first_block_col = tile.col0 / DROPOUT_BLOCK_COLS;
    let last_block_col = (tile.col0 + cols - 1) / DROPOUT_BLOCK_COLS;

    for block_row in first_block_row..=last_block_row {
        for block_col in first_block_col..=last_block_col {
            for lane in 0..DROPOUT_LANES {
                let bytes = lane_bytes(tile.philox, tile.batch, tile.head, tile.heads, lane, block_row, block_col);
                for (slot, &byte) in bytes.iter().enumerate() {
                    if byte <= tile.p_keep_u8 {
                        continue;
                    }
                    let (r, c) = slot_position(lane, slot);
                    let row = block_row * DROPOUT_BLOCK_ROWS + r;
                    let col = block_col * DROPOUT_BLOCK_COLS + c;
                    if row < tile.row0 || row >= tile.row0 + rows || col < tile.col0 || col >= tile.col0 + cols {
                        continue;
                    }
                    let value = &mut p[(row - tile.row0) * cols + (col - tile.col0)];
                    *value = if encode_in_sign_bit {
                        E::narrow(-value.widen())
                    } else {
                        zero
                    };
                }
            }
        }
    }
}
