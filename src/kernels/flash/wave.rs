// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Wave-balanced causal scheduling.
//!
//! Under a causal mask, query tile `m` visits `~(m + 1) * BM / BN` key tiles,
//! so late tiles cost far more than early ones. With `T` query tiles and
//! `half = T / 2`, every late tile `R > half` is paired with its mirror
//! `m = T - 1 - R`:
//!
//! ```text
//! key tiles of R:  [0 ............ split) [split ......... n_block_max(R))
//!                   publisher R             helper m (after its own row)
//! ```
//!
//! The publisher computes its prefix, publishes `(max, sum, O)` and sets its
//! completion flag. The helper computes the suffix backwards, waits on the
//! flag and merges. `split = floor((half + 1) * BM / BN)`: every key in the
//! prefix precedes row `(half + 1) * BM <= R * BM`, so publisher tiles never
//! need a causal mask, and every row of `R` sees key `split * BN`, so the
//! helper fragment is never empty for an in-bounds row.
//!
//! A pair is active only when `0 < split < n_block_max(R)`; otherwise both
//! tiles run as ordinary full rows.

/// What one query tile does in a wave-balanced launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileRole {
    /// Compute the whole causal row.
    Full,
    /// Compute key tiles `[0, split)`, then publish.
    Publisher {
        /// First key tile left to the helper.
        split: usize,
    },
    /// Compute the whole own row, then key tiles `[split, n_block_max(mirror))`
    /// of `mirror` and merge them into its published result.
    Helper {
        /// The paired publisher tile.
        mirror: usize,
        /// First key tile of the helper fragment.
        split: usize,
    },
}

/// Tile geometry of one (batch item, head) causal row block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavePlan {
    /// Query tiles, `ceil(actual_seqlen_q / BM)`.
    pub n_tiles: usize,
    /// `n_tiles / 2`.
    pub half: usize,
    /// First key tile handed to helpers.
    pub split: usize,
    block_m: usize,
    block_n: usize,
    seqlen_k: usize,
}

impl WavePlan {
    /// Plan a causal launch over the actual lengths of one batch item.
    #[must_use]
    pub fn new(actual_seqlen_q: usize, actual_seqlen_k: usize, block_m: usize, block_n: usize) -> Self {
        let n_tiles = actual_seqlen_q.div_ceil(block_m);
        let half = n_tiles / 2;
        Self {
            n_tiles,
            half,
            split: (half + 1) * block_m / block_n,
            block_m,
            block_n,
            seqlen_k: actual_seqlen_k,
        }
    }

    /// One past the last key tile query tile `m` visits under the causal mask.
    #[must_use]
    pub fn n_block_max(&self, m_block: usize) -> usize {
        causal_n_block_max(m_block, self.block_m, self.block_n, self.seqlen_k)
    }

    /// Whether publisher `r` splits its row with a helper.
    #[must_use]
    pub fn pair_active(&self, r: usize) -> bool {
        self.split > 0 && self.split < self.n_block_max(r)
    }

    /// Role of query tile `m_block`.
    #[must_use]
    pub fn role(&self, m_block: usize) -> TileRole {
        if m_block >= self.n_tiles {
            return TileRole::Full;
        }
        if m_block > self.half {
            return if self.pair_active(m_block) {
                TileRole::Publisher { split: self.split }
            } else {
                TileRole::Full
            };
        }
        let mirror = self.n_tiles - 1 - m_block;
        if mirror > self.half && self.pair_active(mirror) {
            TileRole::Helper {
                mirror,
                split: self.split,
            }
        } else {
            TileRole::Full
        }
    }
}

/// `min(ceil(seqlen_k / BN), ceil((m + 1) * BM / BN))`.
#[must_use]
pub fn causal_n_block_max(m_block: usize, block_m: usize, block_n: usize, seqlen_k: usize) -> usize {
    seqlen_k
        .div_ceil(block_n)
        .min(((m_block + 1) * block_m).div_ceil(block_n))
}

/// Whether key tile `n_block` of query tile `m_block` needs per-element masking.
///
/// A tile needs it when some key lies after the tile's first query row
/// (causal), or when it extends past the last key.
#[must_use]
pub fn tile_needs_mask(
    m_block: usize,
    n_block: usize,
    block_m: usize,
    block_n: usize,
    seqlen_k: usize,
    causal: bool,
) -> bool {
    let key_end = (n_block + 1) * block_n;
    (causal && key_end - 1 > m_block * block_m) || key_end > seqlen_k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::flash::TileShape;

    #[test]
    fn test_roles_for_eight_tiles() {
        // BM = 64, BN = 64, 512 rows: half = 4, split = 5.
        let plan = WavePlan::new(512, 512, 64, 64);
        assert_eq!((plan.n_tiles, plan.half, plan.split), (8, 4, 5));
        assert_eq!(plan.role(7), TileRole::Publisher { split: 5 });
        assert_eq!(plan.role(5), TileRole::Publisher { split: 5 });
        // n_block_max(5) == 6, so tile 5 keeps only one tile for its helper.
        assert_eq!(plan.role(2), TileRole::Helper { mirror: 5, split: 5 });
        assert_eq!(plan.role(0), TileRole::Helper { mirror: 7, split: 5 });
        assert_eq!(plan.role(3), TileRole::Full);
        assert_eq!(plan.role(4), TileRole::Full);
    }

    #[test]
    fn test_odd_tile_count_middle_is_full() {
        let plan = WavePlan::new(5 * 32, 5 * 32, 32, 16);
        assert_eq!((plan.half, plan.split), (2, 6));
        assert_eq!(plan.role(2), TileRole::Full);
        assert_eq!(plan.role(4), TileRole::Publisher { split: 6 });
        assert_eq!(plan.role(0), TileRole::Helper { mirror: 4, split: 6 });
    }

    #[test]
    fn test_short_keys_disable_pairs() {
        // All queries see the same two key tiles; nothing is left to split.
        let plan = WavePlan::new(512, 100, 64, 64);
        for m in 0..plan.n_tiles {
            assert_eq!(plan.role(m), TileRole::Full, "tile {m}");
        }
    }

    #[test]
    fn test_single_tile_is_full() {
        let plan = WavePlan::new(10, 10, 16, 16);
        assert_eq!(plan.role(0), TileRole::Full);
    }

    /// Exhaustive check of the rendezvous arithmetic over every tile shape.
    #[test]
    fn test_rendezvous_partitions_every_row() {
        for shape in TileShape::ALL {
            let (bm, bn) = (shape.block_m(), shape.block_n());
            for seqlen_q in 1..=24 * bm {
                for seqlen_k in [seqlen_q / 2, seqlen_q, seqlen_q + bn / 2, 2 * seqlen_q] {
                    let plan = WavePlan::new(seqlen_q, seqlen_k, bm, bn);
                    let mut helped = vec![false; plan.n_tiles];

                    for m in 0..plan.n_tiles {
                        match plan.role(m) {
                            TileRole::Full => {}
                            TileRole::Publisher { split } => {
                                assert!(split > 0 && split < plan.n_block_max(m));
                                for n in 0..split {
                                    assert!(
                                        !tile_needs_mask(m, n, bm, bn, seqlen_k, true),
                                        "{shape:?} q={seqlen_q} k={seqlen_k} m={m} n={n}"
                                    );
                                }
                                assert_eq!(plan.role(plan.n_tiles - 1 - m), TileRole::Helper { mirror: m, split });
                            }
                            TileRole::Helper { mirror, split } => {
                                assert!(mirror > m, "publisher must dispatch before its helper");
                                assert!(!helped[mirror]);
                                helped[mirror] = true;
                                assert_eq!(plan.role(mirror), TileRole::Publisher { split });
                                // Every in-bounds row of the mirror sees the first fragment key.
                                assert!(split * bn <= mirror * bm);
                                assert!(split * bn < seqlen_k);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_split_matches_ceil_formula_when_bn_divides_bm() {
        for shape in TileShape::ALL {
            let (bm, bn) = (shape.block_m(), shape.block_n());
            if bm % bn != 0 {
                continue;
            }
            for n_tiles in 1..40 {
                let plan = WavePlan::new(n_tiles * bm, n_tiles * bm, bm, bn);
                assert_eq!(plan.split, bm.div_ceil(bn) * (plan.half + 1), "{shape:?}");
            }
        }
    }

    #[test]
    fn test_tile_needs_mask() {
        // Diagonal tile of a square 64 x 64 launch.
        assert!(tile_needs_mask(1, 1, 64, 64, 256, true));
        assert!(!tile_needs_mask(1, 0, 64, 64, 256, true));
        // Ragged last key tile.
        assert!(tile_needs_mask(3, 1, 64, 64, 100, false));
        assert!(!tile_needs_mask(3, 0, 64, 64, 100, false));
        // BM = 48, BN = 32: key tile 1 spans keys 32..64, row 48 is the first row.
        assert!(tile_needs_mask(1, 1, 48, 32, 1000, true));
        assert!(!tile_needs_mask(1, 0, 48, 32, 1000, true));
    }
}
