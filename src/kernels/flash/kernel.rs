// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Forward kernel body: one query tile of one (batch item, head).
//!
//! ## Algorithm
//!
//! ```text
//! stage Q (optionally into registers) while K[n_max - 1] loads
//! for n in (n_min..n_max).rev():
//!     wait for K[n]; issue V[n]
//!     S = Q @ K[n]^T                      (masked when the tile needs it)
//!     wait for V[n]; issue K[n - 1]
//!     fold S into (max, sum), rescale acc_o
//!     P = narrow(exp2(...)); write P; drop
//!     acc_o += P @ V[n]
//! normalize acc_o, LSE = max * scale + ln(sum)
//! ```
//!
//! Wave-balanced launches wrap this loop according to the tile's
//! [`TileRole`]: publishers stop at the rendezvous tile and publish their
//! partial state, helpers run their own row and then the missing fragment
//! of their mirror before merging.

use std::ops::Range;

use super::config::{KernelTraits, KernelVariant};
use super::copy::{load_tile, store_tile, CopyPipeline, TileCopy, TileStore};
use super::dropout::{apply_dropout, DropoutTile};
use super::element::Element;
use super::gemm::{gemm, GemmShape, Operand};
use super::params::{BlockInfo, ForwardParams, FwdInputs, FwdOutputs};
use super::softmax::{apply_mask, merge_softmax_states, OnlineSoftmax, RowState};
use super::wave::{causal_n_block_max, tile_needs_mask, TileRole, WavePlan};
use crate::memory::CompletionFlags;

/// Everything a unit reads or writes outside its own scratch.
pub(crate) struct UnitContext<'a, E: Element> {
    pub params: &'a ForwardParams,
    pub variant: KernelVariant,
    pub inputs: FwdInputs<'a, E>,
    pub outputs: &'a FwdOutputs<E>,
    /// Present exactly when the variant is wave balanced.
    pub flags: Option<&'a CompletionFlags>,
}

/// Coordinates of one unit's (batch item, head).
#[derive(Debug, Clone, Copy)]
struct Unit {
    bidb: usize,
    bidh: usize,
    binfo: BlockInfo,
}

/// Scratch memory and register fragments of one worker.
///
/// Allocated once per worker and reused for every unit it runs.
pub(crate) struct UnitScratch<'a, K: KernelTraits> {
    smem: Vec<K::Element>,
    q_regs: Vec<K::Element>,
    acc_s: Vec<f32>,
    p_regs: Vec<K::Element>,
    p_debug: Vec<K::Element>,
    acc_o: Vec<f32>,
    acc_o_published: Vec<f32>,
    softmax: OnlineSoftmax,
    lse: Vec<f32>,
    pipe: CopyPipeline<'a, K::Element>,
}

impl<'a, K: KernelTraits> UnitScratch<'a, K> {
    pub(crate) fn new() -> Self {
        let () = K::CHECK;
        let zero = K::Element::narrow(0.0);
        let (bm, bn, hd) = (K::BLOCK_M, K::BLOCK_N, K::HEAD_DIM);
        Self {
            smem: vec![zero; K::SMEM_ELEMS],
            q_regs: vec![zero; if K::IS_Q_IN_REGS { bm * hd } else { 0 }],
            acc_s: vec![0.0; bm * bn],
            p_regs: vec![zero; bm * bn],
            p_debug: vec![zero; bm * bn],
            acc_o: vec![0.0; bm * hd],
            acc_o_published: vec![0.0; bm * hd],
            softmax: OnlineSoftmax::new(bm),
            lse: vec![0.0; bm],
            pipe: CopyPipeline::new(),
        }
    }
}

/// Compute query tile `m_block` of head `bidh` in batch item `bidb`.
pub(crate) fn compute_attn_1rowblock<'a, K: KernelTraits>(
    ctx: &UnitContext<'a, K::Element>,
    scratch: &mut UnitScratch<'a, K>,
    m_block: usize,
    bidb: usize,
    bidh: usize,
) {
    let params = ctx.params;
    let variant = ctx.variant;

    if variant.is_dropout && m_block == 0 && bidb == 0 && bidh == 0 {
        ctx.outputs.record_rng_state(params.philox);
    }

    let binfo = BlockInfo::new(params, bidb);
    if m_block * K::BLOCK_M >= binfo.actual_seqlen_q {
        return;
    }
    let unit = Unit { bidb, bidh, binfo };

    let role = match ctx.flags {
        Some(flags) if variant.wave_balance => {
            let plan = WavePlan::new(binfo.actual_seqlen_q, binfo.actual_seqlen_k, K::BLOCK_M, K::BLOCK_N);
            Some((plan.role(m_block), flags))
        }
        _ => None,
    };
    tracing::trace!(m_block, bidb, bidh, role = ?role.map(|(r, _)| r), "unit start");

    match role {
        None | Some((TileRole::Full, _)) => {
            let n_max = n_block_max::<K>(ctx, &unit, m_block);
            scratch.run_full_row(ctx, &unit, m_block, 0..n_max);
        }
        Some((TileRole::Publisher { split }, flags)) => {
            scratch.run_full_row(ctx, &unit, m_block, 0..split);
            scratch.publish_row_stats(ctx, &unit, m_block);
            flags.publish(bidh, bidb, m_block);
        }
        Some((TileRole::Helper { mirror, split }, flags)) => {
            let n_max = n_block_max::<K>(ctx, &unit, m_block);
            scratch.run_full_row(ctx, &unit, m_block, 0..n_max);

            let fragment_end = n_block_max::<K>(ctx, &unit, mirror);
            scratch.compute_row(ctx, &unit, mirror, split..fragment_end);
            scratch.finalize(ctx);
            flags.wait(bidh, bidb, mirror);
            scratch.merge_published(ctx, &unit, mirror);
            scratch.write_output(ctx, &unit, mirror);
        }
    }
}

fn n_block_max<K: KernelTraits>(ctx: &UnitContext<'_, K::Element>, unit: &Unit, m_block: usize) -> usize {
    let seqlen_k = unit.binfo.actual_seqlen_k;
    if ctx.variant.is_causal {
        causal_n_block_max(m_block, K::BLOCK_M, K::BLOCK_N, seqlen_k)
    } else {
        seqlen_k.div_ceil(K::BLOCK_N)
    }
}

/// Rows of query tile `m_block` that exist.
fn valid_q_rows<K: KernelTraits>(unit: &Unit, m_block: usize) -> usize {
    (unit.binfo.actual_seqlen_q - m_block * K::BLOCK_M).min(K::BLOCK_M)
}

/// Offset of query tile `m_block`'s rows in the per-row statistics buffers.
fn row_stats_offset<K: KernelTraits>(params: &ForwardParams, unit: &Unit, m_block: usize) -> usize {
    (unit.bidb * params.heads + unit.bidh) * params.seqlen_q + m_block * K::BLOCK_M
}

impl<'a, K: KernelTraits> UnitScratch<'a, K> {
    /// Compute, normalize and write one row over `keys`.
    fn run_full_row(&mut self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, m_block: usize, keys: Range<usize>) {
        if keys.is_empty() {
            // No keys at all: zero output, infinite LSE.
            self.acc_o.fill(0.0);
            self.lse.fill(f32::INFINITY);
        } else {
            self.compute_row(ctx, unit, m_block, keys);
            self.finalize(ctx);
        }
        self.write_output(ctx, unit, m_block);
    }

    /// Iterate key tiles `keys` of query tile `m_block` from last to first,
    /// leaving the unnormalized output and running statistics behind.
    fn compute_row(&mut self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, m_block: usize, keys: Range<usize>) {
        debug_assert!(!keys.is_empty());
        let params = ctx.params;
        let variant = ctx.variant;
        let (bm, bn, hd) = (K::BLOCK_M, K::BLOCK_N, K::HEAD_DIM);
        let binfo = unit.binfo;
        let kv_head = params.kv_head(unit.bidh);
        let valid_cols = if variant.is_even_k { hd } else { params.head_dim };
        let check_inf = variant.check_inf();

        let q_offset = binfo.q_offset(params.q_batch_stride, params.q_row_stride, unit.bidb)
            + m_block * bm * params.q_row_stride
            + unit.bidh * params.q_head_stride;
        let k_offset = binfo.k_offset(params.k_batch_stride, params.k_row_stride, unit.bidb)
            + kv_head * params.k_head_stride;
        let v_offset = binfo.k_offset(params.v_batch_stride, params.v_row_stride, unit.bidb)
            + kv_head * params.v_head_stride;

        let inputs = ctx.inputs;
        let kv_copy = |src: &'a [K::Element], base: usize, row_stride: usize, dst_offset: usize, n_block: usize| {
            TileCopy {
                src,
                src_offset: base + n_block * bn * row_stride,
                src_row_stride: row_stride,
                dst_offset,
                rows: bn,
                head_dim: hd,
                valid_rows: (binfo.actual_seqlen_k - n_block * bn).min(bn),
                valid_cols,
                clear_oob_rows: !variant.is_even_n,
            }
        };

        self.acc_o.fill(0.0);

        self.pipe.issue(TileCopy {
            src: inputs.q,
            src_offset: q_offset,
            src_row_stride: params.q_row_stride,
            dst_offset: K::SMEM_Q_OFFSET,
            rows: bm,
            head_dim: hd,
            valid_rows: valid_q_rows::<K>(unit, m_block),
            valid_cols,
            clear_oob_rows: false,
        });
        if K::IS_Q_IN_REGS {
            self.pipe.fence();
        }
        if K::SHARE_Q_K_SMEM {
            // K is about to land on top of Q.
            self.pipe.wait(0, &mut self.smem);
            self.copy_q_to_regs();
        }

        let last = keys.end - 1;
        self.pipe
            .issue(kv_copy(inputs.k, k_offset, params.k_row_stride, K::SMEM_K_OFFSET, last));
        self.pipe.fence();

        if K::IS_Q_IN_REGS && !K::SHARE_Q_K_SMEM {
            self.pipe.wait(1, &mut self.smem);
            self.copy_q_to_regs();
        }

        let qk_shape = GemmShape {
            m: bm,
            n: bn,
            k: hd,
            n_warps: K::N_WARPS,
        };
        let pv_shape = GemmShape {
            m: bm,
            n: hd,
            k: bn,
            n_warps: K::N_WARPS,
        };

        for (step, n_block) in keys.clone().rev().enumerate() {
            self.acc_s.fill(0.0);
            self.pipe.wait(0, &mut self.smem);

            self.pipe
                .issue(kv_copy(inputs.v, v_offset, params.v_row_stride, K::SMEM_V_OFFSET, n_block));
            self.pipe.fence();

            let q_operand = if K::IS_Q_IN_REGS {
                Operand::row_major(&self.q_regs, 0, hd)
            } else {
                Operand::row_major(&self.smem, K::SMEM_Q_OFFSET, hd)
            };
            gemm(
                &mut self.acc_s,
                qk_shape,
                q_operand,
                Operand::row_major(&self.smem, K::SMEM_K_OFFSET, hd),
            );

            if tile_needs_mask(m_block, n_block, bm, bn, binfo.actual_seqlen_k, variant.is_causal) {
                apply_mask(
                    &mut self.acc_s,
                    bn,
                    m_block * bm,
                    n_block * bn,
                    binfo.actual_seqlen_k,
                    variant.is_causal,
                );
            }

            self.pipe.wait(0, &mut self.smem);
            if n_block > keys.start {
                self.pipe
                    .issue(kv_copy(inputs.k, k_offset, params.k_row_stride, K::SMEM_K_OFFSET, n_block - 1));
                self.pipe.fence();
            }

            self.softmax.rescale_o(
                step == 0,
                check_inf,
                &mut self.acc_s,
                &mut self.acc_o,
                params.scale_softmax_log2,
            );

            for (p, &s) in self.p_regs.iter_mut().zip(&self.acc_s) {
                *p = K::Element::narrow(s);
            }

            let dropout_tile = DropoutTile {
                philox: params.philox,
                batch: unit.bidb,
                head: unit.bidh,
                heads: params.heads,
                row0: m_block * bm,
                col0: n_block * bn,
                p_keep_u8: params.p_dropout_in_uint8,
            };
            if variant.return_softmax {
                self.p_debug.copy_from_slice(&self.p_regs);
                if variant.is_dropout {
                    apply_dropout(&mut self.p_debug, bn, &dropout_tile, true);
                }
                self.write_softmax(ctx, unit, m_block, n_block);
            }
            if variant.is_dropout {
                apply_dropout(&mut self.p_regs, bn, &dropout_tile, false);
            }

            gemm(
                &mut self.acc_o,
                pv_shape,
                Operand::row_major(&self.p_regs, 0, bn),
                Operand::transposed(&self.smem, K::SMEM_V_OFFSET, hd),
            );
        }
        debug_assert_eq!(self.pipe.outstanding(), 0);
    }

    fn copy_q_to_regs(&mut self) {
        let q = &self.smem[K::SMEM_Q_OFFSET..K::SMEM_Q_OFFSET + K::BLOCK_M * K::HEAD_DIM];
        self.q_regs.copy_from_slice(q);
    }

    /// Store the in-bounds part of the current probability tile.
    fn write_softmax(&self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, m_block: usize, n_block: usize) {
        let Some(dst) = ctx.outputs.softmax.as_ref() else {
            return;
        };
        let params = ctx.params;
        let bn = K::BLOCK_N;
        let row_base = (unit.bidb * params.heads + unit.bidh) * params.seqlen_q_rounded + m_block * K::BLOCK_M;
        let valid_cols = (unit.binfo.actual_seqlen_k - n_block * bn).min(bn);
        store_tile(
            &self.p_debug,
            bn,
            &TileStore {
                dst,
                offset: row_base * params.seqlen_k_rounded + n_block * bn,
                row_stride: params.seqlen_k_rounded,
                valid_rows: valid_q_rows::<K>(unit, m_block),
                valid_cols,
            },
        );
    }

    /// Normalize the output accumulator and compute the LSE of every row.
    fn finalize(&mut self, ctx: &UnitContext<'a, K::Element>) {
        let params = ctx.params;
        let rp_dropout = if ctx.variant.is_dropout { params.rp_dropout } else { 1.0 };
        self.softmax
            .finalize(&mut self.acc_o, params.scale_softmax, rp_dropout, &mut self.lse);
    }

    /// Write the normalized output and LSE of query tile `m_block`.
    ///
    /// The output tile is staged through the scratch region of Q.
    fn write_output(&mut self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, m_block: usize) {
        let params = ctx.params;
        let (bm, hd) = (K::BLOCK_M, K::HEAD_DIM);
        let valid_rows = valid_q_rows::<K>(unit, m_block);

        let s_o = &mut self.smem[K::SMEM_Q_OFFSET..K::SMEM_Q_OFFSET + bm * hd];
        for (dst, &o) in s_o.iter_mut().zip(&self.acc_o) {
            *dst = K::Element::narrow(o);
        }

        let o_offset = unit
            .binfo
            .q_offset(params.o_batch_stride, params.o_row_stride, unit.bidb)
            + m_block * bm * params.o_row_stride
            + unit.bidh * params.o_head_stride;
        store_tile(
            s_o,
            hd,
            &TileStore {
                dst: &ctx.outputs.o,
                offset: o_offset,
                row_stride: params.o_row_stride,
                valid_rows,
                valid_cols: params.head_dim,
            },
        );

        let stats = row_stats_offset::<K>(params, unit, m_block);
        for (r, &lse) in self.lse.iter().take(valid_rows).enumerate() {
            ctx.outputs.softmax_lse.store(stats + r, lse);
        }
    }

    /// Publish the running max and sum of the in-bounds rows.
    fn publish_row_stats(&self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, m_block: usize) {
        let stats = row_stats_offset::<K>(ctx.params, unit, m_block);
        for r in 0..valid_q_rows::<K>(unit, m_block) {
            ctx.outputs.scores_max.store(stats + r, self.softmax.row_max[r]);
            ctx.outputs.scores_sum.store(stats + r, self.softmax.row_sum[r]);
        }
    }

    /// Merge the finalized fragment in `acc_o` with the state published for
    /// `mirror`. The merged output replaces `acc_o` and the merged LSE
    /// replaces `lse`.
    fn merge_published(&mut self, ctx: &UnitContext<'a, K::Element>, unit: &Unit, mirror: usize) {
        let params = ctx.params;
        let (bm, hd) = (K::BLOCK_M, K::HEAD_DIM);
        let valid_rows = valid_q_rows::<K>(unit, mirror);
        let stats = row_stats_offset::<K>(params, unit, mirror);

        let o_offset = unit
            .binfo
            .q_offset(params.o_batch_stride, params.o_row_stride, unit.bidb)
            + mirror * bm * params.o_row_stride
            + unit.bidh * params.o_head_stride;
        let s_o = &mut self.smem[K::SMEM_Q_OFFSET..K::SMEM_Q_OFFSET + bm * hd];
        load_tile(
            s_o,
            hd,
            &TileStore {
                dst: &ctx.outputs.o,
                offset: o_offset,
                row_stride: params.o_row_stride,
                valid_rows,
                valid_cols: params.head_dim,
            },
        );
        for (dst, &o) in self.acc_o_published.iter_mut().zip(s_o.iter()) {
            *dst = o.widen();
        }

        for r in 0..bm {
            let local = RowState {
                max: self.softmax.row_max[r],
                sum: self.softmax.row_sum[r],
            };
            let published = if r < valid_rows {
                RowState {
                    max: ctx.outputs.scores_max.load(stats + r),
                    sum: ctx.outputs.scores_sum.load(stats + r),
                }
            } else {
                RowState::EMPTY
            };
            let merged = merge_softmax_states(
                local,
                &self.acc_o[r * hd..(r + 1) * hd],
                published,
                &mut self.acc_o_published[r * hd..(r + 1) * hd],
                params.scale_softmax_log2,
            );
            self.lse[r] = merged.log_sum_exp(params.scale_softmax);
        }
        std::mem::swap(&mut self.acc_o, &mut self.acc_o_published);
    }
}
