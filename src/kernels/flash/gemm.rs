// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Score compute engine: tiled matrix multiply-accumulate.
//!
//! `acc[m][n] += sum_k A(m, k) * B(n, k)` built from m16n8k16 atoms with
//! narrow operands widened to `f32`. Warps split the M dimension in 16-row
//! bands; with `W` warps, band `mi` of warp `w` covers rows
//! `mi * 16 * W + w * 16 .. + 16`. No masking or scaling happens here.

use super::config::MMA_M;
use super::element::Element;

/// Columns of one atom.
pub const MMA_N: usize = 8;
/// Reduction depth of one atom.
pub const MMA_K: usize = 16;

/// A strided read-only view of a matrix operand.
///
/// Element `(r, c)` lives at `offset + r * row_stride + c * col_stride`, so
/// a transposed view is the same data with the strides swapped.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a, E> {
    /// Backing storage (scratch or registers).
    pub data: &'a [E],
    /// Offset of element `(0, 0)`.
    pub offset: usize,
    /// Step between rows.
    pub row_stride: usize,
    /// Step between columns.
    pub col_stride: usize,
}

impl<'a, E: Element> Operand<'a, E> {
    /// Row-major view with `cols` columns.
    #[must_use]
    pub fn row_major(data: &'a [E], offset: usize, cols: usize) -> Self {
        Self {
            data,
            offset,
            row_stride: cols,
            col_stride: 1,
        }
    }

    /// Transposed view of a row-major matrix with `cols` columns.
    #[must_use]
    pub fn transposed(data: &'a [E], offset: usize, cols: usize) -> Self {
        Self {
            data,
            offset,
            row_stride: 1,
            col_stride: cols,
        }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        self.data[self.offset + row * self.row_stride + col * self.col_stride].widen()
    }
}

/// Problem shape of one tile product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmShape {
    /// Output rows.
    pub m: usize,
    /// Output columns.
    pub n: usize,
    /// Reduction depth.
    pub k: usize,
    /// Warps sharing the M dimension.
    pub n_warps: usize,
}

/// Accumulate `A * B^T` into the row-major `m x n` accumulator.
///
/// `a` is indexed `(m, k)` and `b` is indexed `(n, k)`.
pub fn gemm<E: Element>(acc: &mut [f32], shape: GemmShape, a: Operand<'_, E>, b: Operand<'_, E>) {
    debug_assert_eq!(shape.m % (MMA_M * shape.n_warps), 0);
    debug_assert_eq!(shape.n % MMA_N, 0);
    debug_assert_eq!(shape.k % MMA_K, 0);
    debug_assert!(acc.len() >= shape.m * shape.n);

    let band = MMA_M * shape.n_warps;
    for mi in 0..shape.m / band {
        for warp in 0..shape.n_warps {
            let row0 = mi * band + warp * MMA_M;
            for ni in 0..shape.n / MMA_N {
                for ki in 0..shape.k / MMA_K {
                    mma_m16n8k16(acc, shape.n, &a, &b, row0, ni * MMA_N, ki * MMA_K);
                }
            }
        }
    }
}

/// One m16n8k16 atom.
#[inline]
fn mma_m16n8k16<E: Element>(
    acc: &mut [f32],
    ldc: usize,
    a: &Operand<'_, E>,
    b: &Operand<'_, E>,
    row0: usize,
    col0: usize,
    k0: usize,
) {
    for r in row0..row0 + MMA_M {
        for c in col0..col0 + MMA_N {
            let mut dot = 0.0f32;
            for kk in k0..k0 + MMA_K {
                dot += a.at(r, kk) * b.at(c, kk);
            }
            acc[r * ldc + c] += dot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] = (0..k).map(|kk| a[i * k + kk] * b[j * k + kk]).sum();
            }
        }
        out
    }

    #[test]
    fn test_gemm_matches_naive_across_warp_bands() {
        let (m, n, k) = (48, 16, 32);
        let a: Vec<f32> = (0..m * k).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
        let b: Vec<f32> = (0..n * k).map(|i| ((i % 5) as f32 - 2.0) * 0.5).collect();
        let mut acc = vec![0.0; m * n];
        let shape = GemmShape { m, n, k, n_warps: 3 };
        gemm(&mut acc, shape, Operand::row_major(&a, 0, k), Operand::row_major(&b, 0, k));
        assert_eq!(acc, naive(&a, &b, m, n, k));
    }

    #[test]
    fn test_gemm_transposed_b_operand() {
        // B stored as [k][n]; the transposed view reads B(n, k).
        let (m, n, k) = (16, 8, 16);
        let a: Vec<f16> = (0..m * k).map(|i| f16::from_f32((i % 3) as f32)).collect();
        let b_kn: Vec<f16> = (0..k * n).map(|i| f16::from_f32((i % 4) as f32)).collect();
        let mut acc = vec![1.0; m * n];
        let shape = GemmShape { m, n, k, n_warps: 1 };
        gemm(&mut acc, shape, Operand::row_major(&a, 0, k), Operand::transposed(&b_kn, 0, n));

        let a32: Vec<f32> = a.iter().map(|x| x.to_f32()).collect();
        let b_nk: Vec<f32> = (0..n * k).map(|i| b_kn[(i % k) * n + i / k].to_f32()).collect();
        let expected: Vec<f32> = naive(&a32, &b_nk, m, n, k).iter().map(|x| x + 1.0).collect();
        assert_eq!(acc, expected);
    }
}
