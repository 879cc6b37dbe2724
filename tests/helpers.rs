//! Test fixtures and a host-side attention reference for integration tests.
//!
//! The reference works directly on the flat buffers described by a
//! [`ForwardParams`], so it covers dense and packed layouts, grouped-query
//! heads and keyed dropout with the same code path.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{Device, Tensor};
use flash_wave::kernels::flash::{dropout_keep, BlockInfo, ForwardParams};

/// Shape of one attention problem over dense `[batch, seqlen, heads, head_dim]` operands.
#[derive(Debug, Clone, Copy)]
pub struct AttentionCase {
    pub batch: usize,
    pub heads: usize,
    pub heads_k: usize,
    pub head_dim: usize,
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    pub causal: bool,
}

impl AttentionCase {
    /// Multi-head case without masking.
    pub fn new(batch: usize, heads: usize, seqlen_q: usize, seqlen_k: usize, head_dim: usize) -> Self {
        Self {
            batch,
            heads,
            heads_k: heads,
            head_dim,
            seqlen_q,
            seqlen_k,
            causal: false,
        }
    }

    /// Share each key/value head between `heads / heads_k` query heads.
    pub fn with_kv_heads(mut self, heads_k: usize) -> Self {
        self.heads_k = heads_k;
        self
    }

    /// Apply a causal mask.
    pub fn causal(mut self) -> Self {
        self.causal = true;
        self
    }

    /// Launch parameters for this case.
    pub fn params(&self) -> ForwardParams {
        ForwardParams::contiguous(
            self.batch,
            self.heads,
            self.heads_k,
            self.head_dim,
            self.seqlen_q,
            self.seqlen_k,
        )
        .with_causal(self.causal)
    }

    /// Deterministic Q, K, V host buffers.
    pub fn inputs(&self, seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let q_len = self.batch * self.seqlen_q * self.heads * self.head_dim;
        let kv_len = self.batch * self.seqlen_k * self.heads_k * self.head_dim;
        (
            uniform_values(q_len, 1.0, seed),
            uniform_values(kv_len, 1.0, seed + 1),
            uniform_values(kv_len, 1.0, seed + 2),
        )
    }

    /// The same operands as candle tensors.
    pub fn tensors(&self, seed: u64, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let (q, k, v) = self.inputs(seed);
        let q_shape = (self.batch, self.seqlen_q, self.heads, self.head_dim);
        let kv_shape = (self.batch, self.seqlen_k, self.heads_k, self.head_dim);
        Ok((
            Tensor::from_vec(q, q_shape, device)?,
            Tensor::from_vec(k, kv_shape, device)?,
            Tensor::from_vec(v, kv_shape, device)?,
        ))
    }
}

/// Uniform values in `[-max, max]` derived from a hash of `seed + i`.
pub fn uniform_values(count: usize, max: f32, seed: u64) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    (0..count)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            seed.wrapping_mul(0x9E37_79B9).wrapping_add(i as u64).hash(&mut hasher);
            let normalized = (hasher.finish() as f64) / (u64::MAX as f64);
            ((normalized * 2.0 - 1.0) * f64::from(max)) as f32
        })
        .collect()
}

/// Host reference results. Entries the kernel never writes are NaN.
#[derive(Debug, Clone)]
pub struct HostReference {
    /// Output, laid out like the kernel's O buffer.
    pub output: Vec<f32>,
    /// Log-sum-exp, `[batch, heads, seqlen_q]`.
    pub lse: Vec<f32>,
}

/// Naive masked softmax attention in f64, one query row at a time.
///
/// Applies dropout with [`dropout_keep`] when `params` enables it.
pub fn host_attention(params: &ForwardParams, q: &[f32], k: &[f32], v: &[f32]) -> HostReference {
    let d = params.head_dim;
    let mut output = vec![f32::NAN; params.o_extent()];
    let mut lse = vec![f32::NAN; params.lse_len()];
    let scale = f64::from(params.scale_softmax);
    let is_dropout = params.p_dropout < 1.0;
    let rp_dropout = if is_dropout { f64::from(params.rp_dropout) } else { 1.0 };

    for b in 0..params.batch {
        let binfo = BlockInfo::new(params, b);
        let q_base = binfo.q_offset(params.q_batch_stride, params.q_row_stride, b);
        let k_base = binfo.k_offset(params.k_batch_stride, params.k_row_stride, b);
        let v_base = binfo.k_offset(params.v_batch_stride, params.v_row_stride, b);
        let o_base = binfo.q_offset(params.o_batch_stride, params.o_row_stride, b);

        for h in 0..params.heads {
            let kv_head = params.kv_head(h);
            for i in 0..binfo.actual_seqlen_q {
                let q_row = q_base + i * params.q_row_stride + h * params.q_head_stride;
                let o_row = o_base + i * params.o_row_stride + h * params.o_head_stride;
                let visible = if params.is_causal {
                    (i + 1).min(binfo.actual_seqlen_k)
                } else {
                    binfo.actual_seqlen_k
                };

                let scores: Vec<f64> = (0..visible)
                    .map(|j| {
                        let k_row = k_base + j * params.k_row_stride + kv_head * params.k_head_stride;
                        let dot: f64 = (0..d)
                            .map(|c| f64::from(q[q_row + c]) * f64::from(k[k_row + c]))
                            .sum();
                        dot * scale
                    })
                    .collect();

                let lse_index = (b * params.heads + h) * params.seqlen_q + i;
                if scores.is_empty() {
                    output[o_row..o_row + d].fill(0.0);
                    lse[lse_index] = f32::INFINITY;
                    continue;
                }

                let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
                lse[lse_index] = (max + sum.ln()) as f32;

                let mut acc = vec![0.0f64; d];
                for (j, s) in scores.iter().enumerate() {
                    if is_dropout && !dropout_keep(params.philox, b, h, params.heads, i, j, params.p_dropout_in_uint8) {
                        continue;
                    }
                    let weight = (s - max).exp() / sum * rp_dropout;
                    let v_row = v_base + j * params.v_row_stride + kv_head * params.v_head_stride;
                    for (c, a) in acc.iter_mut().enumerate() {
                        *a += weight * f64::from(v[v_row + c]);
                    }
                }
                for (c, a) in acc.into_iter().enumerate() {
                    output[o_row + c] = a as f32;
                }
            }
        }
    }

    HostReference { output, lse }
}

/// Assert `actual` matches `expected` within `tol`, relative for magnitudes
/// above one. NaN entries of `expected` are skipped; infinities must match
/// exactly.
pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32, what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length mismatch");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        if e.is_nan() || a == e {
            continue;
        }
        let bound = tol * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= bound,
            "{what}[{i}]: got {a}, expected {e} (tolerance {bound})"
        );
    }
}

/// Largest absolute difference between two equally long buffers.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}
