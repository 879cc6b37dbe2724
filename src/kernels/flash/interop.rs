// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle front end.
//!
//! Converts candle tensors to kernel buffers, launches the forward kernel
//! and converts the results back. Also provides a dense reference
//! implementation built from candle ops for validation.
//!
//! ## Layouts
//!
//! - Dense: `[batch, seqlen, heads, head_dim]` for Q, K, V and the output.
//! - Packed: `[total_tokens, heads, head_dim]` plus cumulative sequence
//!   lengths of `batch + 1` entries.
//! - LSE: `[batch, heads, seqlen_q]`.
//! - Probabilities: `[batch, heads, round128(seqlen_q), round128(seqlen_k)]`.

use candle_core::{DType, Device, Tensor, D};
use half::{bf16, f16};

use super::config::FlashAttentionConfig;
use super::element::Element;
use super::launch::{completion_flags_for, run_flash_fwd};
use super::params::{ForwardParams, FwdInputs, FwdOutputs, PhiloxArgs};
use crate::error::{FlashError, Result};

/// Results of a forward launch.
#[derive(Debug, Clone)]
pub struct FlashAttentionOutput {
    /// Attention output, same shape as the queries.
    pub output: Tensor,
    /// Log-sum-exp per query row, `[batch, heads, seqlen_q]` (f32).
    pub softmax_lse: Tensor,
    /// Probability matrix with dropped entries negated, when requested.
    pub softmax: Option<Tensor>,
    /// Random stream of a dropout launch.
    pub rng_state: Option<PhiloxArgs>,
}

/// Flash attention forward pass over dense tensors.
///
/// # Arguments
///
/// * `q` - Query tensor `[batch, seqlen_q, heads, head_dim]`
/// * `k` - Key tensor `[batch, seqlen_k, heads_k, head_dim]`
/// * `v` - Value tensor `[batch, seqlen_k, heads_k, head_dim]`
/// * `config` - Masking, dropout and scheduling options
///
/// # Errors
///
/// Returns error if:
/// - Tensor shapes or dtypes are incompatible
/// - The head dimension or dtype has no compiled kernel
/// - The configuration is invalid (e.g. dropout outside `[0, 1)`)
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use flash_wave::kernels::flash::{flash_attn_fwd, FlashAttentionConfig};
///
/// let device = Device::Cpu;
/// let q = Tensor::randn(0.0f32, 1.0, (1, 16, 2, 32), &device)?;
/// let config = FlashAttentionConfig::default().with_causal_mask();
/// let out = flash_attn_fwd(&q, &q, &q, &config)?;
/// assert_eq!(out.output.dims(), &[1, 16, 2, 32]);
/// # Ok::<(), flash_wave::FlashError>(())
/// ```
pub fn flash_attn_fwd(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &FlashAttentionConfig,
) -> Result<FlashAttentionOutput> {
    validate_attention_inputs(q, k, v)?;
    let (batch, seqlen_q, heads, head_dim) = q.dims4()?;
    let (_, seqlen_k, heads_k, _) = k.dims4()?;
    let params = apply_config(
        ForwardParams::contiguous(batch, heads, heads_k, head_dim, seqlen_q, seqlen_k),
        config,
    );
    dispatch_dtype(q, k, v, &params, config)
}

/// Flash attention forward pass over a packed batch of variable-length
/// sequences.
///
/// # Arguments
///
/// * `q` - Packed queries `[total_q, heads, head_dim]`
/// * `k` - Packed keys `[total_k, heads_k, head_dim]`
/// * `v` - Packed values `[total_k, heads_k, head_dim]`
/// * `cu_seqlens_q` - Cumulative query lengths, `batch + 1` entries from 0
/// * `cu_seqlens_k` - Cumulative key lengths, `batch + 1` entries from 0
/// * `max_seqlen_q` - Longest query sequence
/// * `max_seqlen_k` - Longest key sequence
/// * `config` - Masking, dropout and scheduling options
///
/// # Errors
///
/// Returns error if shapes, cumulative lengths or the configuration are
/// invalid, or the dtype or head dimension has no compiled kernel.
#[allow(clippy::too_many_arguments)]
pub fn flash_attn_varlen_fwd(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cu_seqlens_q: &[usize],
    cu_seqlens_k: &[usize],
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    config: &FlashAttentionConfig,
) -> Result<FlashAttentionOutput> {
    let (total_q, heads, head_dim) = q.dims3()?;
    let (total_k, heads_k, head_dim_k) = k.dims3()?;
    if v.dims() != k.dims() || head_dim_k != head_dim {
        return Err(FlashError::ShapeMismatch {
            expected: vec![total_k, heads_k, head_dim],
            actual: v.dims().to_vec(),
        });
    }
    if cu_seqlens_q.last() != Some(&total_q) || cu_seqlens_k.last() != Some(&total_k) {
        return Err(FlashError::InvalidConfig(format!(
            "cumulative lengths must end at the packed totals {total_q} and {total_k}"
        )));
    }
    let params = apply_config(
        ForwardParams::varlen(
            cu_seqlens_q.to_vec(),
            cu_seqlens_k.to_vec(),
            heads,
            heads_k,
            head_dim,
            max_seqlen_q,
            max_seqlen_k,
        ),
        config,
    );
    dispatch_dtype(q, k, v, &params, config)
}

fn apply_config(params: ForwardParams, config: &FlashAttentionConfig) -> ForwardParams {
    let mut params = params
        .with_causal(config.causal_mask)
        .with_softmax_return(config.return_softmax);
    if let Some(scale) = config.softmax_scale {
        params = params.with_softmax_scale(scale);
    }
    if config.dropout_p != 0.0 {
        params = params.with_dropout(config.dropout_p, config.philox);
    }
    params
}

fn dispatch_dtype(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    params: &ForwardParams,
    config: &FlashAttentionConfig,
) -> Result<FlashAttentionOutput> {
    if k.dtype() != q.dtype() || v.dtype() != q.dtype() {
        return Err(FlashError::InvalidConfig(format!(
            "dtype mismatch: Q={:?}, K={:?}, V={:?}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )));
    }
    match q.dtype() {
        DType::F32 => run_typed::<f32>(q, k, v, params, config),
        DType::F16 => run_typed::<f16>(q, k, v, params, config),
        DType::BF16 => run_typed::<bf16>(q, k, v, params, config),
        other => Err(FlashError::UnsupportedDType(other)),
    }
}

fn host_vec<E: Element>(tensor: &Tensor) -> Result<Vec<E>> {
    Ok(tensor.contiguous()?.flatten_all()?.to_vec1::<E>()?)
}

fn run_typed<E: Element>(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    params: &ForwardParams,
    config: &FlashAttentionConfig,
) -> Result<FlashAttentionOutput> {
    let (q_host, k_host, v_host) = (host_vec::<E>(q)?, host_vec::<E>(k)?, host_vec::<E>(v)?);
    let options = config.launch_options();
    let outputs = FwdOutputs::<E>::new(params);
    let flags = (options.wave_balance && params.is_causal).then(|| completion_flags_for(params, options.tile_shape));

    let inputs = FwdInputs {
        q: &q_host,
        k: &k_host,
        v: &v_host,
    };
    run_flash_fwd(params, inputs, &outputs, flags.as_ref(), &options)?;

    let device = q.device();
    let output = Tensor::from_vec(outputs.o.to_vec(), q.dims(), device)?;
    let softmax_lse = Tensor::from_vec(
        outputs.softmax_lse.to_vec(),
        (params.batch, params.heads, params.seqlen_q),
        device,
    )?;
    let softmax = outputs
        .softmax
        .as_ref()
        .map(|p| {
            Tensor::from_vec(
                p.to_vec(),
                (
                    params.batch,
                    params.heads,
                    params.seqlen_q_rounded,
                    params.seqlen_k_rounded,
                ),
                device,
            )
        })
        .transpose()?;

    Ok(FlashAttentionOutput {
        output,
        softmax_lse,
        softmax,
        rng_state: outputs.rng_state(),
    })
}

/// Validate dense attention input shapes.
fn validate_attention_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
    let q_dims = q.dims();
    let k_dims = k.dims();
    let v_dims = v.dims();

    if q_dims.len() != 4 || k_dims.len() != 4 || v_dims.len() != 4 {
        return Err(FlashError::InvalidConfig(format!(
            "Expected 4D tensors [batch, seq, heads, dim], got Q: {q_dims:?}, K: {k_dims:?}, V: {v_dims:?}"
        )));
    }

    if q_dims[0] != k_dims[0] || q_dims[0] != v_dims[0] {
        return Err(FlashError::InvalidConfig(format!(
            "Batch size mismatch: Q={}, K={}, V={}",
            q_dims[0], k_dims[0], v_dims[0]
        )));
    }

    if q_dims[3] != k_dims[3] || q_dims[3] != v_dims[3] {
        return Err(FlashError::InvalidConfig(format!(
            "Head dimension mismatch: Q={}, K={}, V={}",
            q_dims[3], k_dims[3], v_dims[3]
        )));
    }

    if k_dims != v_dims {
        return Err(FlashError::ShapeMismatch {
            expected: k_dims.to_vec(),
            actual: v_dims.to_vec(),
        });
    }

    if k_dims[2] == 0 || q_dims[2] % k_dims[2] != 0 {
        return Err(FlashError::InvalidConfig(format!(
            "Query heads {} must be a multiple of key/value heads {}",
            q_dims[2], k_dims[2]
        )));
    }

    Ok(())
}

// ============================================================================
// Dense reference
// ============================================================================

/// Dense masked softmax attention using candle operations.
///
/// Materializes the full score matrix, so it uses O(N²) memory; intended
/// as a reference for validating the tiled kernel. Computes in f32 and
/// returns the input dtype. Dropout is not applied.
///
/// # Errors
///
/// Returns error if tensor shapes are incompatible or a candle op fails.
pub fn reference_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &FlashAttentionConfig,
) -> Result<Tensor> {
    if config.dropout_p > 0.0 {
        tracing::warn!("reference_attention ignores dropout");
    }
    let (scores, v) = reference_scores(q, k, v, config)?;

    let attn_weights = candle_nn::ops::softmax(&scores, 3)?;
    let output = attn_weights.matmul(&v)?;

    Ok(output.transpose(1, 2)?.contiguous()?.to_dtype(q.dtype())?)
}

/// Log-sum-exp of the scaled, masked scores, `[batch, heads, seqlen_q]`.
///
/// # Errors
///
/// Returns error if tensor shapes are incompatible or a candle op fails.
pub fn reference_softmax_lse(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &FlashAttentionConfig,
) -> Result<Tensor> {
    let (scores, _) = reference_scores(q, k, v, config)?;
    let max = scores.max_keepdim(D::Minus1)?;
    let sum = scores.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    Ok((sum.log()? + max)?.squeeze(D::Minus1)?)
}

/// Scaled, masked scores `[batch, heads, seqlen_q, seqlen_k]` and the values
/// `[batch, heads, seqlen_k, head_dim]` with key/value heads repeated.
fn reference_scores(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &FlashAttentionConfig,
) -> Result<(Tensor, Tensor)> {
    validate_attention_inputs(q, k, v)?;
    let (_, seqlen_q, heads, head_dim) = q.dims4()?;
    let (_, seqlen_k, heads_k, _) = k.dims4()?;
    let n_rep = heads / heads_k;
    #[allow(clippy::cast_precision_loss)]
    let scale = config
        .softmax_scale
        .map_or(1.0 / (head_dim as f64).sqrt(), f64::from);

    let q = q.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
    let k = repeat_kv(&k.to_dtype(DType::F32)?, n_rep)?.transpose(1, 2)?.contiguous()?;
    let v = repeat_kv(&v.to_dtype(DType::F32)?, n_rep)?.transpose(1, 2)?.contiguous()?;

    let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
    let scores = (scores * scale)?;

    let scores = if config.causal_mask {
        let causal_mask = create_causal_mask_tensor(seqlen_q, seqlen_k, q.device())?;
        scores.broadcast_add(&causal_mask)?
    } else {
        scores
    };
    Ok((scores, v))
}

/// Repeat each key/value head `n_rep` times along the head axis of a
/// `[batch, seq, heads_k, dim]` tensor.
fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, seq, heads_k, dim) = x.dims4()?;
    Ok(x.unsqueeze(3)?
        .expand((batch, seq, heads_k, n_rep, dim))?
        .reshape((batch, seq, heads_k * n_rep, dim))?)
}

/// Create a `[1, 1, seqlen_q, seqlen_k]` mask with -inf above the diagonal
/// (top-left aligned).
fn create_causal_mask_tensor(seqlen_q: usize, seqlen_k: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seqlen_q * seqlen_k];
    for i in 0..seqlen_q {
        for j in (i + 1).min(seqlen_k)..seqlen_k {
            mask_data[i * seqlen_k + j] = f32::NEG_INFINITY;
        }
    }

    let mask = Tensor::from_vec(mask_data, (1, 1, seqlen_q, seqlen_k), device)?;
    Ok(mask)
}
