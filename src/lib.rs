//! # flash-wave
//!
//! Flash attention forward pass with wave-balanced causal scheduling.
//!
//! This crate computes fused scaled-dot-product attention tile by tile,
//! never materializing the full score matrix:
//!
//! - Block-tiled online softmax with causal and sequence-bound masking
//! - Grouped-query attention (GQA) and packed variable-length batches
//! - Keyed Philox dropout, reproducible from `(seed, offset)`
//! - Optional return of the probability matrix and the log-sum-exp
//! - Wave balancing: long causal rows are split between a tile and its
//!   mirror so every unit of the grid does similar work
//!
//! ## Status
//!
//! Kernels run on an emulated execution model: each unit (one query tile
//! of one head) runs on a CPU worker, with scratch and register storage
//! allocated once per worker and bulk memory shared through atomics.
//! Inputs and outputs are exchanged as [Candle](https://github.com/huggingface/candle)
//! tensors.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use flash_wave::kernels::{flash_attn_fwd, FlashAttentionConfig};
//!
//! let device = Device::Cpu;
//! let q = Tensor::randn(0.0f32, 1.0, (2, 64, 4, 64), &device)?;
//! let k = Tensor::randn(0.0f32, 1.0, (2, 64, 4, 64), &device)?;
//! let v = Tensor::randn(0.0f32, 1.0, (2, 64, 4, 64), &device)?;
//!
//! let config = FlashAttentionConfig::default().with_causal_mask();
//! let out = flash_attn_fwd(&q, &k, &v, &config)?;
//! assert_eq!(out.softmax_lse.dims(), &[2, 4, 64]);
//! # Ok::<(), flash_wave::FlashError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod kernels;
pub mod memory;

pub use error::{FlashError, Result};
