// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host-side launcher.
//!
//! Validates a launch, selects the [`KernelVariant`] and the compiled
//! [`KernelTraits`] once, then runs the grid on persistent workers.
//!
//! ## Scheduling
//!
//! The grid has `m_blocks x batch x heads` units. Workers are rayon tasks in
//! one scope that claim unit indices from a shared counter, in order of
//! descending query tile, then batch item, then head. A helper tile spins on
//! its mirror's completion flag without a timeout, so the mirror must be
//! running when the helper starts waiting. The dispatch order provides this
//! for any worker count: a mirror has a larger tile index than its helper,
//! so it was claimed earlier by a worker that is already executing it, and
//! publishers never wait on anything.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::config::{padded_head_dim, FwdTraits, KernelTraits, KernelVariant, LaunchOptions, TileShape};
use super::element::Element;
use super::kernel::{compute_attn_1rowblock, UnitContext, UnitScratch};
use super::params::{ForwardParams, FwdInputs, FwdOutputs};
use crate::error::{FlashError, Result};
use crate::memory::CompletionFlags;

/// Query tiles in the grid for `params` and `shape`.
#[must_use]
pub fn num_m_blocks(params: &ForwardParams, shape: TileShape) -> usize {
    params.seqlen_q.div_ceil(shape.block_m())
}

/// Allocate a cleared completion-flag grid sized for a launch.
#[must_use]
pub fn completion_flags_for(params: &ForwardParams, shape: TileShape) -> CompletionFlags {
    CompletionFlags::zeroed(params.heads, params.batch, num_m_blocks(params, shape))
}

/// Run the forward kernel.
///
/// `flags` must be a cleared grid of `(heads, batch, m_blocks)` flags when
/// the launch is causal and wave balanced (see [`completion_flags_for`]);
/// it is ignored otherwise. Flags are set during the launch and must be
/// reset before they are reused.
///
/// # Returns
///
/// The selected kernel variant.
///
/// # Errors
///
/// Returns error if:
/// - The parameters are inconsistent (see [`ForwardParams::validate`])
/// - An operand or output buffer is too small for the launch
/// - The completion flags are missing, mis-sized or not cleared
pub fn run_flash_fwd<E: Element>(
    params: &ForwardParams,
    inputs: FwdInputs<'_, E>,
    outputs: &FwdOutputs<E>,
    flags: Option<&CompletionFlags>,
    options: &LaunchOptions,
) -> Result<KernelVariant> {
    params.validate()?;
    let head_dim = padded_head_dim(params.head_dim)?;
    check_len("q", params.q_extent(), inputs.q.len())?;
    check_len("k", params.k_extent(), inputs.k.len())?;
    check_len("v", params.v_extent(), inputs.v.len())?;
    check_len("o", params.o_extent(), outputs.o.len())?;
    check_len("softmax_lse", params.lse_len(), outputs.softmax_lse.len())?;
    if params.return_softmax {
        let len = outputs.softmax.as_ref().map_or(0, |p| p.len());
        check_len("softmax", params.softmax_len(), len)?;
    }

    let shape = options.tile_shape;
    let variant = KernelVariant::select(params, shape, head_dim, options.wave_balance);
    let m_blocks = num_m_blocks(params, shape);

    let flags = if variant.wave_balance {
        check_len("scores_max", params.lse_len(), outputs.scores_max.len())?;
        check_len("scores_sum", params.lse_len(), outputs.scores_sum.len())?;
        let flags = flags.ok_or_else(|| {
            FlashError::InvalidConfig("wave-balanced launch requires completion flags".to_string())
        })?;
        let expected = (params.heads, params.batch, m_blocks);
        if flags.dims() != expected {
            return Err(FlashError::InvalidConfig(format!(
                "completion flags sized {:?}, launch needs {expected:?}",
                flags.dims()
            )));
        }
        if !flags.is_clear() {
            return Err(FlashError::InvalidConfig(
                "completion flags must be cleared before a wave-balanced launch".to_string(),
            ));
        }
        Some(flags)
    } else {
        None
    };

    let units = m_blocks * params.batch * params.heads;
    let workers = match options.num_workers {
        Some(0) => {
            tracing::warn!("num_workers = 0 requested, using a single worker");
            1
        }
        Some(n) => n,
        None => rayon::current_num_threads(),
    }
    .min(units.max(1));

    tracing::debug!(
        ?shape,
        head_dim,
        batch = params.batch,
        heads = params.heads,
        heads_k = params.heads_k,
        seqlen_q = params.seqlen_q,
        seqlen_k = params.seqlen_k,
        m_blocks,
        workers,
        ?variant,
        "launching flash attention forward"
    );

    let ctx = UnitContext {
        params,
        variant,
        inputs,
        outputs,
        flags,
    };

    macro_rules! run_shape {
        ($bm:literal, $bn:literal, $nw:literal, $q_in_regs:literal, $share:literal) => {
            match head_dim {
                32 => run_grid::<FwdTraits<E, $bm, $bn, 32, $nw, $q_in_regs, $share>>(&ctx, m_blocks, workers),
                64 => run_grid::<FwdTraits<E, $bm, $bn, 64, $nw, $q_in_regs, $share>>(&ctx, m_blocks, workers),
                _ => run_grid::<FwdTraits<E, $bm, $bn, 128, $nw, $q_in_regs, $share>>(&ctx, m_blocks, workers),
            }
        };
    }

    match shape {
        TileShape::M16N16 => run_shape!(16, 16, 1, false, false),
        TileShape::M32N16 => run_shape!(32, 16, 2, true, true),
        TileShape::M48N32 => run_shape!(48, 32, 3, false, false),
        TileShape::M64N64 => run_shape!(64, 64, 4, false, false),
        TileShape::M128N64 => run_shape!(128, 64, 4, true, false),
    }

    Ok(variant)
}

fn check_len(name: &'static str, required: usize, actual: usize) -> Result<()> {
    if actual < required {
        return Err(FlashError::BufferTooSmall {
            name,
            required,
            actual,
        });
    }
    Ok(())
}

/// Run every unit of the grid on `workers` persistent workers.
fn run_grid<K: KernelTraits>(ctx: &UnitContext<'_, K::Element>, m_blocks: usize, workers: usize) {
    let batch_heads = ctx.params.batch * ctx.params.heads;
    let units = m_blocks * batch_heads;
    if units == 0 {
        return;
    }
    let next = AtomicUsize::new(0);

    rayon::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| {
                let mut scratch = UnitScratch::<K>::new();
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    if index >= units {
                        break;
                    }
                    let (m_block, bidb, bidh) = unit_coords(index, m_blocks, batch_heads, ctx.params.heads);
                    compute_attn_1rowblock::<K>(ctx, &mut scratch, m_block, bidb, bidh);
                }
            });
        }
    });
}

/// Dispatch order: query tile descending, then batch item, then head.
fn unit_coords(index: usize, m_blocks: usize, batch_heads: usize, heads: usize) -> (usize, usize, usize) {
    let m_block = m_blocks - 1 - index / batch_heads;
    let rest = index % batch_heads;
    (m_block, rest / heads, rest % heads)
}
