// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel configuration for the flash attention forward pass.
//!
//! Three layers of configuration live here:
//!
//! - [`TileShape`] - the fixed set of block shapes a launch can choose from.
//! - [`KernelTraits`] / [`FwdTraits`] - the compile-time constants of one
//!   instantiated kernel, checked by const assertions at monomorphization.
//! - [`FlashAttentionConfig`] - user-facing runtime options with presets and
//!   builder methods, and [`KernelVariant`], the flag set selected once per
//!   launch from the actual data.

use std::marker::PhantomData;

use super::element::Element;
use super::params::{ForwardParams, PhiloxArgs};
use crate::error::{FlashError, Result};

/// Head dimensions with a compiled kernel, in increasing order.
pub const SUPPORTED_HEAD_DIMS: [usize; 3] = [32, 64, 128];

/// Largest supported head dimension.
pub const MAX_HEAD_DIM: usize = 128;

/// Rows in one matrix-multiply atom, and in the per-warp band of a tile.
pub const MMA_M: usize = 16;

/// Round a head dimension up to the smallest compiled one.
///
/// # Errors
///
/// Returns [`FlashError::UnsupportedHeadDim`] for zero or anything above
/// [`MAX_HEAD_DIM`].
pub fn padded_head_dim(head_dim: usize) -> Result<usize> {
    SUPPORTED_HEAD_DIMS
        .iter()
        .copied()
        .find(|&hd| head_dim > 0 && head_dim <= hd)
        .ok_or(FlashError::UnsupportedHeadDim {
            head_dim,
            max: MAX_HEAD_DIM,
        })
}

// ============================================================================
// Tile shapes
// ============================================================================

/// The block shapes a launch can select.
///
/// Each variant maps to one family of [`FwdTraits`] instantiations (one per
/// element type and padded head dimension).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileShape {
    /// 16 x 16 tiles, one warp.
    M16N16,
    /// 32 x 16 tiles, two warps, Q kept in registers and sharing scratch with K.
    M32N16,
    /// 48 x 32 tiles, three warps.
    M48N32,
    /// 64 x 64 tiles, four warps.
    #[default]
    M64N64,
    /// 128 x 64 tiles, four warps, Q kept in registers.
    M128N64,
}

impl TileShape {
    /// Every tile shape.
    pub const ALL: [TileShape; 5] = [
        TileShape::M16N16,
        TileShape::M32N16,
        TileShape::M48N32,
        TileShape::M64N64,
        TileShape::M128N64,
    ];

    /// Query rows per tile.
    #[must_use]
    pub const fn block_m(self) -> usize {
        match self {
            TileShape::M16N16 => 16,
            TileShape::M32N16 => 32,
            TileShape::M48N32 => 48,
            TileShape::M64N64 => 64,
            TileShape::M128N64 => 128,
        }
    }

    /// Key rows per tile.
    #[must_use]
    pub const fn block_n(self) -> usize {
        match self {
            TileShape::M16N16 | TileShape::M32N16 => 16,
            TileShape::M48N32 => 32,
            TileShape::M64N64 | TileShape::M128N64 => 64,
        }
    }

    /// Warps cooperating on one tile.
    #[must_use]
    pub const fn n_warps(self) -> usize {
        match self {
            TileShape::M16N16 => 1,
            TileShape::M32N16 => 2,
            TileShape::M48N32 => 3,
            TileShape::M64N64 | TileShape::M128N64 => 4,
        }
    }

    /// Whether Q is copied to registers before the key loop.
    #[must_use]
    pub const fn is_q_in_regs(self) -> bool {
        matches!(self, TileShape::M32N16 | TileShape::M128N64)
    }

    /// Whether the Q and K scratch regions overlap.
    #[must_use]
    pub const fn share_q_k_smem(self) -> bool {
        matches!(self, TileShape::M32N16)
    }
}

// ============================================================================
// Compile-time kernel traits
// ============================================================================

/// Compile-time constants of one forward-kernel instantiation.
pub trait KernelTraits: Send + Sync + 'static {
    /// Narrow element type of Q, K, V, O and P.
    type Element: Element;

    /// Query rows per tile.
    const BLOCK_M: usize;
    /// Key rows per tile.
    const BLOCK_N: usize;
    /// Padded head dimension.
    const HEAD_DIM: usize;
    /// Warps per unit.
    const N_WARPS: usize;
    /// Copy Q to registers once instead of re-reading scratch per key tile.
    const IS_Q_IN_REGS: bool;
    /// K is staged over the Q scratch region.
    const SHARE_Q_K_SMEM: bool;

    /// Shape compatibility checks. Referencing this constant in a generic
    /// function fails the build for an incompatible instantiation.
    const CHECK: () = {
        assert!(
            Self::BLOCK_M % (MMA_M * Self::N_WARPS) == 0,
            "BLOCK_M must be a multiple of 16 * N_WARPS"
        );
        assert!(Self::BLOCK_N % 16 == 0, "BLOCK_N must be a multiple of 16");
        assert!(Self::HEAD_DIM % 16 == 0, "HEAD_DIM must be a multiple of 16");
        assert!(
            !Self::SHARE_Q_K_SMEM || Self::IS_Q_IN_REGS,
            "sharing Q/K scratch requires Q in registers"
        );
    };

    /// Scratch offset of the Q tile. The output tile aliases it.
    const SMEM_Q_OFFSET: usize = 0;
    /// Scratch offset of the K tile.
    const SMEM_K_OFFSET: usize = if Self::SHARE_Q_K_SMEM {
        0
    } else {
        Self::BLOCK_M * Self::HEAD_DIM
    };
    /// Scratch offset of the V tile.
    const SMEM_V_OFFSET: usize = Self::SMEM_K_OFFSET + Self::BLOCK_N * Self::HEAD_DIM;
    /// Scratch size in elements.
    const SMEM_ELEMS: usize = {
        let kv_end = Self::SMEM_V_OFFSET + Self::BLOCK_N * Self::HEAD_DIM;
        let q_end = Self::BLOCK_M * Self::HEAD_DIM;
        if kv_end > q_end {
            kv_end
        } else {
            q_end
        }
    };
}

/// Forward-kernel traits parameterised by const generics.
pub struct FwdTraits<
    E,
    const BM: usize,
    const BN: usize,
    const HD: usize,
    const NW: usize,
    const Q_IN_REGS: bool,
    const SHARE_Q_K: bool,
>(PhantomData<fn() -> E>);

impl<
        E: Element,
        const BM: usize,
        const BN: usize,
        const HD: usize,
        const NW: usize,
        const Q_IN_REGS: bool,
        const SHARE_Q_K: bool,
    > KernelTraits for FwdTraits<E, BM, BN, HD, NW, Q_IN_REGS, SHARE_Q_K>
{
    type Element = E;
    const BLOCK_M: usize = BM;
    const BLOCK_N: usize = BN;
    const HEAD_DIM: usize = HD;
    const N_WARPS: usize = NW;
    const IS_Q_IN_REGS: bool = Q_IN_REGS;
    const SHARE_Q_K_SMEM: bool = SHARE_Q_K;
}

// ============================================================================
// Runtime configuration
// ============================================================================

/// Configuration for a flash attention forward launch.
///
/// # Example
///
/// ```rust
/// use flash_wave::kernels::flash::{FlashAttentionConfig, TileShape};
///
/// // Defaults: 64 x 64 tiles, no mask, wave balancing on when causal.
/// let config = FlashAttentionConfig::default();
///
/// let config = FlashAttentionConfig::for_long_sequences().with_causal_mask();
/// assert_eq!(config.tile_shape, TileShape::M128N64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlashAttentionConfig {
    /// Block shape of the launched kernel.
    pub tile_shape: TileShape,

    /// Enable causal (top-left aligned) masking.
    pub causal_mask: bool,

    /// Softmax scale; `None` means `1/sqrt(head_dim)`.
    pub softmax_scale: Option<f32>,

    /// Probability of dropping an attention weight, in `[0, 1)`.
    pub dropout_p: f32,

    /// Seed and offset of the dropout random stream.
    pub philox: PhiloxArgs,

    /// Also return the probability matrix, dropout encoded in the sign bit.
    pub return_softmax: bool,

    /// Split long causal rows between mirrored tiles.
    /// Has no effect on non-causal launches.
    pub wave_balance: bool,

    /// Persistent workers; `None` uses the rayon pool size.
    pub num_workers: Option<usize>,
}

impl Default for FlashAttentionConfig {
    fn default() -> Self {
        Self {
            tile_shape: TileShape::M64N64,
            causal_mask: false,
            softmax_scale: None,
            dropout_p: 0.0,
            philox: PhiloxArgs::default(),
            return_softmax: false,
            wave_balance: true,
            num_workers: None,
        }
    }
}

impl FlashAttentionConfig {
    /// Small tiles with Q kept in registers, for short or ragged sequences.
    #[must_use]
    pub fn for_short_sequences() -> Self {
        Self {
            tile_shape: TileShape::M32N16,
            ..Self::default()
        }
    }

    /// Large query tiles for long sequences.
    #[must_use]
    pub fn for_long_sequences() -> Self {
        Self {
            tile_shape: TileShape::M128N64,
            ..Self::default()
        }
    }

    /// Enable causal (autoregressive) masking.
    #[must_use]
    pub const fn with_causal_mask(mut self) -> Self {
        self.causal_mask = true;
        self
    }

    /// Select a tile shape.
    #[must_use]
    pub const fn with_tile_shape(mut self, tile_shape: TileShape) -> Self {
        self.tile_shape = tile_shape;
        self
    }

    /// Set an explicit softmax scale.
    #[must_use]
    pub fn with_softmax_scale(mut self, scale: f32) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    /// Enable dropout with drop probability `p` and the given random stream.
    #[must_use]
    pub fn with_dropout(mut self, p: f32, philox: PhiloxArgs) -> Self {
        self.dropout_p = p;
        self.philox = philox;
        self
    }

    /// Also return the softmax probability matrix.
    #[must_use]
    pub const fn with_softmax_return(mut self) -> Self {
        self.return_softmax = true;
        self
    }

    /// Run every query tile as an independent full row.
    #[must_use]
    pub const fn without_wave_balance(mut self) -> Self {
        self.wave_balance = false;
        self
    }

    /// Set the number of persistent workers.
    #[must_use]
    pub const fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = Some(workers);
        self
    }

    /// Scheduling options consumed by the launcher.
    #[must_use]
    pub const fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            tile_shape: self.tile_shape,
            wave_balance: self.wave_balance,
            num_workers: self.num_workers,
        }
    }

    /// Scratch memory required per unit in bytes.
    ///
    /// Layout: Q tile (`BLOCK_M x head_dim`, also reused for the output
    /// tile), then one K and one V tile (`BLOCK_N x head_dim` each). When Q
    /// and K share scratch, K starts at offset zero.
    #[must_use]
    pub const fn shared_memory_bytes(&self, head_dim: usize, bytes_per_elem: usize) -> usize {
        let bm = self.tile_shape.block_m();
        let bn = self.tile_shape.block_n();
        let q = bm * head_dim;
        let k_offset = if self.tile_shape.share_q_k_smem() { 0 } else { q };
        let kv_end = k_offset + 2 * bn * head_dim;
        let elems = if kv_end > q { kv_end } else { q };
        elems * bytes_per_elem
    }

    /// Number of query tiles for a given sequence length.
    #[must_use]
    pub const fn num_q_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.tile_shape.block_m())
    }

    /// Number of key tiles for a given sequence length.
    #[must_use]
    pub const fn num_kv_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.tile_shape.block_n())
    }
}

/// Scheduling choices of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Block shape.
    pub tile_shape: TileShape,
    /// Wave balancing requested (applied to causal launches only).
    pub wave_balance: bool,
    /// Persistent workers; `None` uses the rayon pool size.
    pub num_workers: Option<usize>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        FlashAttentionConfig::default().launch_options()
    }
}

/// Code-path flags of one launch, selected once from the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVariant {
    /// Apply keyed dropout to the probabilities.
    pub is_dropout: bool,
    /// Causal masking.
    pub is_causal: bool,
    /// Sequence lengths are tile multiples and not variable-length, so no
    /// row or key bounds checks are needed.
    pub is_even_n: bool,
    /// The head dimension equals its padded size.
    pub is_even_k: bool,
    /// Write the probability matrix.
    pub return_softmax: bool,
    /// Mirrored tiles split long causal rows.
    pub wave_balance: bool,
}

impl KernelVariant {
    /// Derive the variant from the parameters, so the flags always agree
    /// with the data they describe.
    #[must_use]
    pub fn select(params: &ForwardParams, shape: TileShape, padded_hd: usize, wave_balance: bool) -> Self {
        let is_even_n = !params.is_varlen()
            && params.seqlen_q % shape.block_m() == 0
            && params.seqlen_k % shape.block_n() == 0;
        Self {
            is_dropout: params.p_dropout < 1.0,
            is_causal: params.is_causal,
            is_even_n,
            is_even_k: params.head_dim == padded_hd,
            return_softmax: params.return_softmax,
            wave_balance: wave_balance && params.is_causal,
        }
    }

    /// Whether fully masked rows may appear, so `-inf` maxima must be guarded.
    #[must_use]
    pub const fn check_inf(&self) -> bool {
        self.is_causal || !self.is_even_n
    }
}
