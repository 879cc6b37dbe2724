// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Launch parameters and the buffers a launch reads and writes.
//!
//! [`ForwardParams`] is the read-only description of one forward launch:
//! operand strides, sequence lengths, scaling and dropout constants. It is
//! built from shapes with [`ForwardParams::contiguous`] or
//! [`ForwardParams::varlen`] and refined with builder methods.

use std::sync::OnceLock;

use super::config::padded_head_dim;
use super::element::Element;
use crate::error::{FlashError, Result};
use crate::memory::GlobalBuffer;

/// Sequence lengths are padded to a multiple of this in the softmax matrix.
pub const SEQLEN_ROUND: usize = 128;

/// Round up to a multiple of `m`.
#[must_use]
pub const fn round_multiple(x: usize, m: usize) -> usize {
    x.div_ceil(m) * m
}

/// Key and starting counter of the dropout random stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhiloxArgs {
    /// Stream key.
    pub seed: u64,
    /// Counter offset, advanced by the caller between launches.
    pub offset: u64,
}

/// Read-only parameters of one forward launch.
///
/// Operands use element strides. Dense launches address row `r` of head `h`
/// in batch item `b` at `b * batch_stride + r * row_stride + h * head_stride`;
/// variable-length launches replace `b * batch_stride` with
/// `cu_seqlens[b] * row_stride`.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct ForwardParams {
    pub q_batch_stride: usize,
    pub q_row_stride: usize,
    pub q_head_stride: usize,
    pub k_batch_stride: usize,
    pub k_row_stride: usize,
    pub k_head_stride: usize,
    pub v_batch_stride: usize,
    pub v_row_stride: usize,
    pub v_head_stride: usize,
    pub o_batch_stride: usize,
    pub o_row_stride: usize,
    pub o_head_stride: usize,

    /// Batch items.
    pub batch: usize,
    /// Query heads.
    pub heads: usize,
    /// Key/value heads; `heads` must be a multiple.
    pub heads_k: usize,
    /// Unpadded head dimension.
    pub head_dim: usize,

    /// Query length, or the maximum query length of a packed batch.
    pub seqlen_q: usize,
    /// Key length, or the maximum key length of a packed batch.
    pub seqlen_k: usize,
    /// `seqlen_q` rounded up to [`SEQLEN_ROUND`].
    pub seqlen_q_rounded: usize,
    /// `seqlen_k` rounded up to [`SEQLEN_ROUND`].
    pub seqlen_k_rounded: usize,

    /// Cumulative query lengths (`batch + 1` entries) of a packed batch.
    pub cu_seqlens_q: Option<Vec<usize>>,
    /// Cumulative key lengths (`batch + 1` entries) of a packed batch.
    pub cu_seqlens_k: Option<Vec<usize>>,

    /// Multiplier applied to raw scores.
    pub scale_softmax: f32,
    /// `scale_softmax * log2(e)`.
    pub scale_softmax_log2: f32,

    /// Keep probability; `1.0` disables dropout.
    pub p_dropout: f32,
    /// `floor(p_dropout * 255)`; a random byte at or below it keeps the element.
    pub p_dropout_in_uint8: u8,
    /// `1 / p_dropout`.
    pub rp_dropout: f32,
    /// `scale_softmax * rp_dropout`.
    pub scale_softmax_rp_dropout: f32,
    /// Dropout random stream.
    pub philox: PhiloxArgs,

    /// Causal masking.
    pub is_causal: bool,
    /// Write the probability matrix.
    pub return_softmax: bool,
}

impl ForwardParams {
    /// Parameters for dense `[batch, seqlen, heads, head_dim]` operands.
    #[must_use]
    pub fn contiguous(
        batch: usize,
        heads: usize,
        heads_k: usize,
        head_dim: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> Self {
        let q_row = heads * head_dim;
        let k_row = heads_k * head_dim;
        Self::with_strides(
            [seqlen_q * q_row, q_row, head_dim],
            [seqlen_k * k_row, k_row, head_dim],
            batch,
            heads,
            heads_k,
            head_dim,
            seqlen_q,
            seqlen_k,
        )
    }

    /// Parameters for packed `[total, heads, head_dim]` operands with
    /// cumulative sequence lengths.
    #[must_use]
    pub fn varlen(
        cu_seqlens_q: Vec<usize>,
        cu_seqlens_k: Vec<usize>,
        heads: usize,
        heads_k: usize,
        head_dim: usize,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
    ) -> Self {
        let batch = cu_seqlens_q.len().saturating_sub(1);
        let mut params = Self::with_strides(
            [0, heads * head_dim, head_dim],
            [0, heads_k * head_dim, head_dim],
            batch,
            heads,
            heads_k,
            head_dim,
            max_seqlen_q,
            max_seqlen_k,
        );
        params.cu_seqlens_q = Some(cu_seqlens_q);
        params.cu_seqlens_k = Some(cu_seqlens_k);
        params
    }

    #[allow(clippy::too_many_arguments)]
    fn with_strides(
        q: [usize; 3],
        kv: [usize; 3],
        batch: usize,
        heads: usize,
        heads_k: usize,
        head_dim: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim.max(1) as f32).sqrt();
        Self {
            q_batch_stride: q[0],
            q_row_stride: q[1],
            q_head_stride: q[2],
            k_batch_stride: kv[0],
            k_row_stride: kv[1],
            k_head_stride: kv[2],
            v_batch_stride: kv[0],
            v_row_stride: kv[1],
            v_head_stride: kv[2],
            o_batch_stride: q[0],
            o_row_stride: q[1],
            o_head_stride: q[2],
            batch,
            heads,
            heads_k,
            head_dim,
            seqlen_q,
            seqlen_k,
            seqlen_q_rounded: round_multiple(seqlen_q, SEQLEN_ROUND),
            seqlen_k_rounded: round_multiple(seqlen_k, SEQLEN_ROUND),
            cu_seqlens_q: None,
            cu_seqlens_k: None,
            scale_softmax: scale,
            scale_softmax_log2: scale * std::f32::consts::LOG2_E,
            p_dropout: 1.0,
            p_dropout_in_uint8: u8::MAX,
            rp_dropout: 1.0,
            scale_softmax_rp_dropout: scale,
            philox: PhiloxArgs::default(),
            is_causal: false,
            return_softmax: false,
        }
    }

    /// Override the softmax scale.
    #[must_use]
    pub fn with_softmax_scale(mut self, scale: f32) -> Self {
        self.scale_softmax = scale;
        self.scale_softmax_log2 = scale * std::f32::consts::LOG2_E;
        self.scale_softmax_rp_dropout = scale * self.rp_dropout;
        self
    }

    /// Enable or disable causal masking.
    #[must_use]
    pub fn with_causal(mut self, is_causal: bool) -> Self {
        self.is_causal = is_causal;
        self
    }

    /// Enable dropout with drop probability `p_drop`.
    ///
    /// The keep threshold is truncated to 8 bits, as the kernel compares it
    /// against single random bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn with_dropout(mut self, p_drop: f32, philox: PhiloxArgs) -> Self {
        let keep = 1.0 - p_drop;
        self.p_dropout = keep;
        self.p_dropout_in_uint8 = (keep * 255.0).floor().clamp(0.0, 255.0) as u8;
        self.rp_dropout = 1.0 / keep;
        self.scale_softmax_rp_dropout = self.scale_softmax * self.rp_dropout;
        self.philox = philox;
        self
    }

    /// Request the probability matrix.
    #[must_use]
    pub fn with_softmax_return(mut self, return_softmax: bool) -> Self {
        self.return_softmax = return_softmax;
        self
    }

    /// Whether the batch is packed with cumulative sequence lengths.
    #[must_use]
    pub fn is_varlen(&self) -> bool {
        self.cu_seqlens_q.is_some() || self.cu_seqlens_k.is_some()
    }

    /// Query heads per key/value head.
    #[must_use]
    pub fn h_h_k_ratio(&self) -> usize {
        self.heads / self.heads_k.max(1)
    }

    /// Key/value head read by query head `head`.
    #[must_use]
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.h_h_k_ratio().max(1)
    }

    /// Elements Q must hold.
    #[must_use]
    pub fn q_extent(&self) -> usize {
        self.extent(
            [self.q_batch_stride, self.q_row_stride, self.q_head_stride],
            self.heads,
            self.seqlen_q,
            self.cu_seqlens_q.as_deref(),
        )
    }

    /// Elements K must hold.
    #[must_use]
    pub fn k_extent(&self) -> usize {
        self.extent(
            [self.k_batch_stride, self.k_row_stride, self.k_head_stride],
            self.heads_k,
            self.seqlen_k,
            self.cu_seqlens_k.as_deref(),
        )
    }

    /// Elements V must hold.
    #[must_use]
    pub fn v_extent(&self) -> usize {
        self.extent(
            [self.v_batch_stride, self.v_row_stride, self.v_head_stride],
            self.heads_k,
            self.seqlen_k,
            self.cu_seqlens_k.as_deref(),
        )
    }

    /// Elements O must hold.
    #[must_use]
    pub fn o_extent(&self) -> usize {
        self.extent(
            [self.o_batch_stride, self.o_row_stride, self.o_head_stride],
            self.heads,
            self.seqlen_q,
            self.cu_seqlens_q.as_deref(),
        )
    }

    /// Length of the per-row statistics buffers (`[batch, heads, seqlen_q]`).
    #[must_use]
    pub fn lse_len(&self) -> usize {
        self.batch * self.heads * self.seqlen_q
    }

    /// Length of the probability matrix (`[batch, heads, seqlen_q_rounded, seqlen_k_rounded]`).
    #[must_use]
    pub fn softmax_len(&self) -> usize {
        self.batch * self.heads * self.seqlen_q_rounded * self.seqlen_k_rounded
    }

    fn extent(&self, strides: [usize; 3], heads: usize, seqlen: usize, cu: Option<&[usize]>) -> usize {
        let [batch_stride, row_stride, head_stride] = strides;
        if heads == 0 || self.head_dim == 0 {
            return 0;
        }
        let last_row_offset = match cu {
            Some(cu) => match cu.last() {
                Some(&total) if total > 0 => (total - 1) * row_stride,
                _ => return 0,
            },
            None if self.batch == 0 || seqlen == 0 => return 0,
            None => (self.batch - 1) * batch_stride + (seqlen - 1) * row_stride,
        };
        last_row_offset + (heads - 1) * head_stride + self.head_dim
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::InvalidConfig`] when heads are not divisible by
    /// key/value heads, the dropout probability is out of range, or the
    /// cumulative sequence lengths are malformed, and
    /// [`FlashError::UnsupportedHeadDim`] for an unsupported head dimension.
    pub fn validate(&self) -> Result<()> {
        padded_head_dim(self.head_dim)?;
        if self.heads_k == 0 || self.heads % self.heads_k != 0 {
            return Err(FlashError::InvalidConfig(format!(
                "number of heads {} must be divisible by key/value heads {}",
                self.heads, self.heads_k
            )));
        }
        if !(self.p_dropout > 0.0 && self.p_dropout <= 1.0) {
            return Err(FlashError::InvalidConfig(format!(
                "dropout probability {} must lie in [0, 1)",
                1.0 - self.p_dropout
            )));
        }
        for (name, cu, max) in [
            ("cu_seqlens_q", &self.cu_seqlens_q, self.seqlen_q),
            ("cu_seqlens_k", &self.cu_seqlens_k, self.seqlen_k),
        ] {
            match cu {
                Some(cu) => validate_cu_seqlens(name, cu, self.batch, max)?,
                None if self.is_varlen() => {
                    return Err(FlashError::InvalidConfig(format!(
                        "{name} is required for a packed batch"
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn validate_cu_seqlens(name: &str, cu: &[usize], batch: usize, max_seqlen: usize) -> Result<()> {
    if cu.len() != batch + 1 || cu.first() != Some(&0) {
        return Err(FlashError::InvalidConfig(format!(
            "{name} must start at 0 and hold batch + 1 = {} entries, got {cu:?}",
            batch + 1
        )));
    }
    for pair in cu.windows(2) {
        if pair[1] < pair[0] || pair[1] - pair[0] > max_seqlen {
            return Err(FlashError::InvalidConfig(format!(
                "{name} must be non-decreasing with lengths at most {max_seqlen}, got {cu:?}"
            )));
        }
    }
    Ok(())
}

/// Actual sequence lengths and operand offsets of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    sum_s_q: Option<usize>,
    sum_s_k: Option<usize>,
    /// Query rows of this batch item.
    pub actual_seqlen_q: usize,
    /// Key rows of this batch item.
    pub actual_seqlen_k: usize,
}

impl BlockInfo {
    /// Resolve the lengths of batch item `bidb`.
    #[must_use]
    pub fn new(params: &ForwardParams, bidb: usize) -> Self {
        let span = |cu: &Option<Vec<usize>>, fallback: usize| match cu {
            Some(cu) => (Some(cu[bidb]), cu[bidb + 1] - cu[bidb]),
            None => (None, fallback),
        };
        let (sum_s_q, actual_seqlen_q) = span(&params.cu_seqlens_q, params.seqlen_q);
        let (sum_s_k, actual_seqlen_k) = span(&params.cu_seqlens_k, params.seqlen_k);
        Self {
            sum_s_q,
            sum_s_k,
            actual_seqlen_q,
            actual_seqlen_k,
        }
    }

    /// Element offset of this batch item's first query row.
    #[must_use]
    pub fn q_offset(&self, batch_stride: usize, row_stride: usize, bidb: usize) -> usize {
        self.sum_s_q.map_or(bidb * batch_stride, |s| s * row_stride)
    }

    /// Element offset of this batch item's first key row.
    #[must_use]
    pub fn k_offset(&self, batch_stride: usize, row_stride: usize, bidb: usize) -> usize {
        self.sum_s_k.map_or(bidb * batch_stride, |s| s * row_stride)
    }
}

/// Operands of one launch.
#[derive(Debug, Clone, Copy)]
pub struct FwdInputs<'a, E> {
    /// Queries.
    pub q: &'a [E],
    /// Keys.
    pub k: &'a [E],
    /// Values.
    pub v: &'a [E],
}

/// Buffers written by one launch.
#[derive(Debug)]
pub struct FwdOutputs<E: Element> {
    /// Attention output, laid out like Q.
    pub o: GlobalBuffer<E>,
    /// Per-row log-sum-exp, `[batch, heads, seqlen_q]`.
    pub softmax_lse: GlobalBuffer<f32>,
    /// Per-row running max published by wave-balancing tiles.
    pub scores_max: GlobalBuffer<f32>,
    /// Per-row running sum published by wave-balancing tiles.
    pub scores_sum: GlobalBuffer<f32>,
    /// Probability matrix with dropped entries negated, when requested.
    pub softmax: Option<GlobalBuffer<E>>,
    rng_state: OnceLock<PhiloxArgs>,
}

impl<E: Element> FwdOutputs<E> {
    /// Allocate zeroed outputs for `params`.
    #[must_use]
    pub fn new(params: &ForwardParams) -> Self {
        Self::with_output(params, GlobalBuffer::zeros(params.o_extent()))
    }

    /// Allocate outputs around a caller-provided output buffer.
    #[must_use]
    pub fn with_output(params: &ForwardParams, o: GlobalBuffer<E>) -> Self {
        let rows = params.lse_len();
        Self {
            o,
            softmax_lse: GlobalBuffer::zeros(rows),
            scores_max: GlobalBuffer::zeros(rows),
            scores_sum: GlobalBuffer::zeros(rows),
            softmax: params
                .return_softmax
                .then(|| GlobalBuffer::zeros(params.softmax_len())),
            rng_state: OnceLock::new(),
        }
    }

    /// Seed and offset used by a dropout launch, for a paired backward pass.
    #[must_use]
    pub fn rng_state(&self) -> Option<PhiloxArgs> {
        self.rng_state.get().copied()
    }

    pub(crate) fn record_rng_state(&self, philox: PhiloxArgs) {
        // Only the first unit of the grid records it.
        let _ = self.rng_state.set(philox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_strides() {
        let params = ForwardParams::contiguous(2, 4, 2, 64, 10, 12);
        assert_eq!(params.q_row_stride, 4 * 64);
        assert_eq!(params.q_batch_stride, 10 * 4 * 64);
        assert_eq!(params.k_row_stride, 2 * 64);
        assert_eq!(params.q_extent(), 2 * 10 * 4 * 64);
        assert_eq!(params.k_extent(), 2 * 12 * 2 * 64);
        assert_eq!(params.seqlen_q_rounded, 128);
        assert_eq!(params.kv_head(3), 1);
        assert!((params.scale_softmax - 0.125).abs() < 1e-7);
    }

    #[test]
    fn test_dropout_constants() {
        let params = ForwardParams::contiguous(1, 1, 1, 32, 4, 4).with_dropout(0.25, PhiloxArgs::default());
        assert!((params.p_dropout - 0.75).abs() < 1e-7);
        assert_eq!(params.p_dropout_in_uint8, 191);
        assert!((params.rp_dropout - 4.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_varlen_block_info() {
        let params = ForwardParams::varlen(vec![0, 3, 10], vec![0, 5, 6], 2, 1, 32, 7, 5);
        assert_eq!(params.batch, 2);
        assert!(params.validate().is_ok());
        assert_eq!(params.q_extent(), 10 * 2 * 32);

        let info = BlockInfo::new(&params, 1);
        assert_eq!(info.actual_seqlen_q, 7);
        assert_eq!(info.actual_seqlen_k, 1);
        assert_eq!(info.q_offset(params.q_batch_stride, params.q_row_stride, 1), 3 * 64);
        assert_eq!(info.k_offset(params.k_batch_stride, params.k_row_stride, 1), 5 * 32);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let gqa = ForwardParams::contiguous(1, 3, 2, 32, 4, 4);
        assert!(matches!(gqa.validate(), Err(FlashError::InvalidConfig(_))));

        let dropout = ForwardParams::contiguous(1, 1, 1, 32, 4, 4).with_dropout(1.0, PhiloxArgs::default());
        assert!(dropout.validate().is_err());

        let too_long = ForwardParams::varlen(vec![0, 9], vec![0, 4], 1, 1, 32, 8, 4);
        assert!(too_long.validate().is_err());

        let head_dim = ForwardParams::contiguous(1, 1, 1, 256, 4, 4);
        assert!(matches!(
            head_dim.validate(),
            Err(FlashError::UnsupportedHeadDim { .. })
        ));
    }

    #[test]
    fn test_outputs_allocation() {
        let params = ForwardParams::contiguous(2, 3, 3, 32, 5, 7).with_softmax_return(true);
        let outputs = FwdOutputs::<f32>::new(&params);
        assert_eq!(outputs.o.len(), 2 * 5 * 3 * 32);
        assert_eq!(outputs.softmax_lse.len(), 2 * 3 * 5);
        assert_eq!(outputs.softmax.as_ref().map(GlobalBuffer::len), Some(2 * 3 * 128 * 128));
        assert_eq!(outputs.rng_state(), None);
        outputs.record_rng_state(PhiloxArgs { seed: 1, offset: 2 });
        outputs.record_rng_state(PhiloxArgs { seed: 9, offset: 9 });
        assert_eq!(outputs.rng_state(), Some(PhiloxArgs { seed: 1, offset: 2 }));
    }
}
