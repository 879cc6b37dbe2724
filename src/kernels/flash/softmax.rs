// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Streaming softmax accumulator.
//!
//! Per query row the accumulator keeps `(running_max, running_sum)` such that
//! `running_sum == sum_i exp2(scale_log2 * (s_i - running_max))` over every
//! key processed so far, and the output accumulator holds `sum_i p_i * V_i`
//! under the same scaling. Each new score tile may raise the max, in which
//! case the sum and the output row are rescaled before the tile is added:
//!
//! ```text
//! m_new = max(m_old, rowmax(S))
//! l     = l * exp2(scale_log2 * (m_old - m_new)) + rowsum(exp2(scale_log2 * (S - m_new)))
//! O     = O * exp2(scale_log2 * (m_old - m_new)) + P @ V
//! ```
//!
//! Two partial states over disjoint key ranges of the same rows combine with
//! [`merge_softmax_states`].

/// Running statistics of the rows of one query tile.
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineSoftmax {
    /// Running max of raw scores per row.
    pub row_max: Vec<f32>,
    /// Running sum of exponentials per row, relative to `row_max`.
    pub row_sum: Vec<f32>,
}

impl OnlineSoftmax {
    /// Fresh state for `rows` rows.
    #[must_use]
    pub fn new(rows: usize) -> Self {
        Self {
            row_max: vec![f32::NEG_INFINITY; rows],
            row_sum: vec![0.0; rows],
        }
    }

    /// Rows tracked.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.row_max.len()
    }

    /// Fold one score tile into the running state.
    ///
    /// `scores` is `rows x cols` and is exponentiated in place, leaving the
    /// unnormalized probabilities for the `P @ V` product. `acc_o` is
    /// `rows x head_dim`; on the first tile it must already be cleared and is
    /// not touched. With `check_inf`, a row whose max is still `-inf` (every
    /// key masked so far) rescales against 0 instead of producing NaN.
    pub fn rescale_o(
        &mut self,
        is_first: bool,
        check_inf: bool,
        scores: &mut [f32],
        acc_o: &mut [f32],
        scale_log2: f32,
    ) {
        let rows = self.rows();
        let cols = scores.len() / rows;
        let head_dim = acc_o.len() / rows;

        for (r, row) in scores.chunks_exact_mut(cols).enumerate() {
            let tile_max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if is_first {
                self.row_max[r] = tile_max;
                scale_apply_exp2(row, tile_max, scale_log2);
                self.row_sum[r] = row.iter().sum();
                continue;
            }

            let prev = self.row_max[r];
            let cur = prev.max(tile_max);
            self.row_max[r] = cur;
            let cur_scaled = if check_inf && cur == f32::NEG_INFINITY { 0.0 } else { cur };
            let factor = ((prev - cur_scaled) * scale_log2).exp2();
            self.row_sum[r] *= factor;
            for o in &mut acc_o[r * head_dim..(r + 1) * head_dim] {
                *o *= factor;
            }
            scale_apply_exp2(row, cur, scale_log2);
            self.row_sum[r] += row.iter().sum::<f32>();
        }
    }

    /// Normalize the output accumulator and compute the per-row LSE.
    ///
    /// Rows with a zero or NaN sum are degenerate: their output is left
    /// unscaled and their LSE is `+inf`. `rp_dropout` is the reciprocal keep
    /// probability (1 without dropout).
    pub fn finalize(&self, acc_o: &mut [f32], scale_softmax: f32, rp_dropout: f32, lse: &mut [f32]) {
        let head_dim = acc_o.len() / self.rows();
        for (r, o_row) in acc_o.chunks_exact_mut(head_dim).enumerate() {
            let state = RowState {
                max: self.row_max[r],
                sum: self.row_sum[r],
            };
            lse[r] = state.log_sum_exp(scale_softmax);
            let inv_sum = if state.is_degenerate() { 1.0 } else { 1.0 / state.sum };
            let scale = inv_sum * rp_dropout;
            for o in o_row {
                *o *= scale;
            }
        }
    }
}

/// `row[i] = exp2(row[i] * scale_log2 - max * scale_log2)`, with a `-inf`
/// max treated as 0 so fully masked rows become zeros rather than NaN.
#[inline]
pub fn scale_apply_exp2(row: &mut [f32], max: f32, scale_log2: f32) {
    let max_scaled = if max == f32::NEG_INFINITY { 0.0 } else { max * scale_log2 };
    for s in row {
        *s = (*s * scale_log2 - max_scaled).exp2();
    }
}

/// Set masked scores of a `rows x cols` tile to `-inf`.
///
/// Tile element `(r, c)` is query row `row0 + r` against key `col0 + c`.
/// Keys at or past `max_seqlen_k` are masked; with `causal`, so is every key
/// after the query row (top-left aligned).
pub fn apply_mask(
    scores: &mut [f32],
    cols: usize,
    row0: usize,
    col0: usize,
    max_seqlen_k: usize,
    causal: bool,
) {
    for (r, row) in scores.chunks_exact_mut(cols).enumerate() {
        let limit = if causal {
            max_seqlen_k.min(row0 + r + 1)
        } else {
            max_seqlen_k
        };
        let first_masked = limit.saturating_sub(col0).min(cols);
        row[first_masked..].fill(f32::NEG_INFINITY);
    }
}

/// Softmax statistics of one row over some key range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowState {
    /// Max raw score.
    pub max: f32,
    /// Sum of exponentials relative to `max`.
    pub sum: f32,
}

impl RowState {
    /// State of a row that saw no keys.
    pub const EMPTY: RowState = RowState {
        max: f32::NEG_INFINITY,
        sum: 0.0,
    };

    /// Zero or NaN sum.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.sum == 0.0 || self.sum.is_nan()
    }

    /// `max * scale_softmax + ln(sum)`, or `+inf` when degenerate.
    #[must_use]
    pub fn log_sum_exp(&self, scale_softmax: f32) -> f32 {
        if self.is_degenerate() {
            f32::INFINITY
        } else {
            self.max * scale_softmax + self.sum.ln()
        }
    }
}

/// Merge two normalized partial results of the same row.
///
/// `local` produced the normalized output row `o_local`; `remote` produced
/// `o_merged`, which is overwritten with the combined output. The blend
/// weight of the local part is `1 / (1 + (sum_r / sum_l) * exp2(scale_log2 *
/// (max_r - max_l)))`. An empty partial (sum 0) has weight 0; two empty
/// partials give an empty state. Swapping the two sides gives the same
/// result up to rounding.
pub fn merge_softmax_states(
    local: RowState,
    o_local: &[f32],
    remote: RowState,
    o_merged: &mut [f32],
    scale_log2: f32,
) -> RowState {
    let new_max = local.max.max(remote.max);
    let w = match (local.sum == 0.0, remote.sum == 0.0) {
        (true, true) => return RowState { max: new_max, sum: 0.0 },
        (true, false) => 0.0,
        (false, true) => 1.0,
        (false, false) => {
            let ratio = (remote.sum / local.sum) * ((remote.max - local.max) * scale_log2).exp2();
            1.0 / (1.0 + ratio)
        }
    };
    for (merged, &o1) in o_merged.iter_mut().zip(o_local) {
        *merged = o1 * w + *merged * (1.0 - w);
    }

    let contribution = |state: RowState| {
        if state.sum == 0.0 {
            0.0
        } else {
            state.sum * ((state.max - new_max) * scale_log2).exp2()
        }
    };
    RowState {
        max: new_max,
        sum: contribution(local) + contribution(remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LOG2_E: f32 = std::f32::consts::LOG2_E;

    /// Process key tiles in order and return the normalized output.
    fn stream(tiles: &[(Vec<f32>, Vec<f32>)], rows: usize, cols: usize, hd: usize) -> (Vec<f32>, OnlineSoftmax) {
        let mut state = OnlineSoftmax::new(rows);
        let mut acc_o = vec![0.0; rows * hd];
        for (i, (scores, v)) in tiles.iter().enumerate() {
            let mut p = scores.clone();
            state.rescale_o(i == 0, true, &mut p, &mut acc_o, LOG2_E);
            for r in 0..rows {
                for d in 0..hd {
                    acc_o[r * hd + d] += (0..cols).map(|c| p[r * cols + c] * v[c * hd + d]).sum::<f32>();
                }
            }
        }
        let mut lse = vec![0.0; rows];
        state.finalize(&mut acc_o, 1.0, 1.0, &mut lse);
        (acc_o, state)
    }

    #[test]
    fn test_running_sum_invariant() {
        let tiles = vec![
            (vec![0.5, -1.0, 2.0, 0.0], vec![1.0, 0.0, 0.0, 1.0]),
            (vec![3.0, 1.0, -2.0, 0.25], vec![2.0, 1.0, 1.0, 2.0]),
        ];
        let (_, state) = stream(&tiles, 2, 2, 2);
        for r in 0..2 {
            let all: Vec<f32> = tiles.iter().flat_map(|(s, _)| s[r * 2..r * 2 + 2].to_vec()).collect();
            let max = all.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert_eq!(state.row_max[r], max);
            let expected: f32 = all.iter().map(|s| ((s - max) * LOG2_E).exp2()).sum();
            assert!((state.row_sum[r] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_smaller_tile_keeps_running_max() {
        let mut state = OnlineSoftmax::new(1);
        let mut acc_o = vec![0.0; 2];
        state.rescale_o(true, false, &mut [4.0, 1.0], &mut acc_o, 1.0);
        acc_o.copy_from_slice(&[3.0, 5.0]);
        let sum_before = state.row_sum[0];

        state.rescale_o(false, false, &mut [2.0, 4.0], &mut acc_o, 1.0);
        assert_eq!(state.row_max[0], 4.0);
        assert_eq!(acc_o, vec![3.0, 5.0], "factor must be exactly 1");
        assert!((state.row_sum[0] - (sum_before + 0.25 + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_three_tiles_in_two_orders() {
        let t0 = (vec![0.1, 2.0, -1.0, 0.3], vec![1.0, 2.0, 3.0, 4.0]);
        let t1 = (vec![5.0, -3.0, 0.0, 0.0], vec![-1.0, 0.5, 2.0, 2.0]);
        let t2 = (vec![1.5, 1.5, 7.0, -7.0], vec![0.0, 1.0, 1.0, 0.0]);
        let (forward, _) = stream(&[t0.clone(), t1.clone(), t2.clone()], 2, 2, 2);
        let (backward, _) = stream(&[t2, t0, t1], 2, 2, 2);
        for (a, b) in forward.iter().zip(&backward) {
            assert!((a - b).abs() < 1e-3, "{forward:?} vs {backward:?}");
        }
    }

    #[test]
    fn test_fully_masked_row_is_degenerate() {
        let mut state = OnlineSoftmax::new(2);
        let mut acc_o = vec![0.0; 4];
        let mut scores = vec![1.0, 2.0, f32::NEG_INFINITY, f32::NEG_INFINITY];
        state.rescale_o(true, true, &mut scores, &mut acc_o, LOG2_E);
        assert_eq!(&scores[2..], &[0.0, 0.0]);

        let mut more = vec![0.0, 0.5, f32::NEG_INFINITY, f32::NEG_INFINITY];
        state.rescale_o(false, true, &mut more, &mut acc_o, LOG2_E);
        assert_eq!(state.row_sum[1], 0.0);

        acc_o.copy_from_slice(&[1.0, 1.0, 0.0, 0.0]);
        let mut lse = vec![0.0; 2];
        state.finalize(&mut acc_o, 1.0, 1.0, &mut lse);
        assert!(lse[0].is_finite());
        assert_eq!(lse[1], f32::INFINITY);
        assert!(acc_o.iter().all(|x| !x.is_nan()));
    }

    #[test]
    fn test_causal_and_bounds_mask() {
        let mut scores = vec![0.0f32; 3 * 4];
        // Rows 4..7 against keys 4..8 with 6 valid keys.
        apply_mask(&mut scores, 4, 4, 4, 6, true);
        let masked: Vec<bool> = scores.iter().map(|s| s.is_infinite()).collect();
        assert_eq!(
            masked,
            vec![
                false, true, true, true, // row 4 sees key 4
                false, false, true, true, // row 5 sees keys 4, 5
                false, false, true, true, // row 6 is cut by the key bound
            ]
        );
    }

    #[test]
    fn test_merge_order_independence() {
        let a = RowState { max: 2.0, sum: 3.0 };
        let b = RowState { max: 5.0, sum: 1.5 };
        let oa = [0.25, -1.0, 3.0];
        let ob = [1.0, 0.5, -2.0];

        let mut ab = ob;
        let sab = merge_softmax_states(a, &oa, b, &mut ab, LOG2_E);
        let mut ba = oa;
        let sba = merge_softmax_states(b, &ob, a, &mut ba, LOG2_E);

        assert_eq!(sab.max, 5.0);
        assert!((sab.sum - sba.sum).abs() < 1e-6);
        for (x, y) in ab.iter().zip(&ba) {
            assert!((x - y).abs() < 1e-6);
        }
        let expected_sum = 3.0 * (-3.0f32).exp() + 1.5;
        assert!((sab.sum - expected_sum).abs() < 1e-5);
    }

    #[test]
    fn test_merge_with_empty_partial() {
        let full = RowState { max: 1.0, sum: 2.0 };
        let mut out = [9.0, 9.0];
        let merged = merge_softmax_states(full, &[0.5, 0.25], RowState::EMPTY, &mut out, LOG2_E);
        assert_eq!(out, [0.5, 0.25]);
        assert_eq!(merged, full);

        let mut out = [0.0, 0.0];
        let merged = merge_softmax_states(RowState::EMPTY, &[0.0, 0.0], RowState::EMPTY, &mut out, LOG2_E);
        assert!(merged.is_degenerate());
        assert_eq!(merged.log_sum_exp(1.0), f32::INFINITY);
        assert!(out.iter().all(|x| !x.is_nan()));
    }

    proptest! {
        #[test]
        fn prop_merge_is_symmetric(
            m1 in -10.0f32..10.0,
            m2 in -10.0f32..10.0,
            s1 in 0.1f32..50.0,
            s2 in 0.1f32..50.0,
            o1 in prop::collection::vec(-4.0f32..4.0, 4),
            o2 in prop::collection::vec(-4.0f32..4.0, 4),
        ) {
            let a = RowState { max: m1, sum: s1 };
            let b = RowState { max: m2, sum: s2 };
            let mut ab = o2.clone();
            let sab = merge_softmax_states(a, &o1, b, &mut ab, LOG2_E);
            let mut ba = o1.clone();
            let sba = merge_softmax_states(b, &o2, a, &mut ba, LOG2_E);
            prop_assert_eq!(sab.max, sba.max);
            prop_assert!((sab.sum - sba.sum).abs() <= 1e-4 * sab.sum.max(1.0));
            for (x, y) in ab.iter().zip(&ba) {
                prop_assert!((x - y).abs() < 1e-4);
            }
        }

        #[test]
        fn prop_split_then_merge_equals_single_pass(
            scores in prop::collection::vec(-6.0f32..6.0, 8),
            values in prop::collection::vec(-2.0f32..2.0, 8),
        ) {
            // One row, keys 0..4 and 4..8 processed separately, head_dim 1.
            let run = |s: &[f32], v: &[f32]| {
                let mut state = OnlineSoftmax::new(1);
                let mut acc = vec![0.0];
                let mut p = s.to_vec();
                state.rescale_o(true, false, &mut p, &mut acc, LOG2_E);
                acc[0] = p.iter().zip(v).map(|(p, v)| p * v).sum();
                let mut lse = vec![0.0];
                state.finalize(&mut acc, 1.0, 1.0, &mut lse);
                (RowState { max: state.row_max[0], sum: state.row_sum[0] }, acc[0], lse[0])
            };
            let (whole, o_whole, lse_whole) = run(&scores, &values);
            let (left, o_left, _) = run(&scores[..4], &values[..4]);
            let (right, o_right, _) = run(&scores[4..], &values[4..]);

            let mut merged = [o_right];
            let state = merge_softmax_states(left, &[o_left], right, &mut merged, LOG2_E);
            prop_assert!((merged[0] - o_whole).abs() < 1e-4);
            prop_assert!((state.log_sum_exp(1.0) - lse_whole).abs() < 1e-4);
            prop_assert_eq!(state.max, whole.max);
        }
    }
}
