// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Flash attention forward kernel with wave-balanced causal scheduling.
//!
//! Computes `softmax(scale * Q Kᵀ + mask) V` one query tile at a time,
//! streaming key/value tiles through scratch memory and keeping a running
//! max and sum per query row, so the full score matrix is never stored.
//!
//! ## Wave balancing
//!
//! With a causal mask, the last query tile of a sequence sees every key
//! tile while the first sees one. Wave balancing pairs tile `m` with its
//! mirror `T - 1 - m`: the mirror (publisher) stops at a rendezvous key
//! tile and publishes its partial row statistics and output, and the
//! short tile (helper) finishes the mirror's remaining key tiles after its
//! own row, then merges the two partial softmax states. Every unit ends up
//! with about the same amount of work.
//!
//! ## Module layout
//!
//! - [`config`] - tile shapes, compile-time kernel traits, launch options
//! - [`params`] - layout descriptor and output buffers
//! - [`copy`] - staged tile copies between bulk and scratch memory
//! - [`gemm`] - tile matrix multiply over MMA atoms
//! - [`softmax`] - online softmax, masking, partial-state merge
//! - [`dropout`] - Philox keyed dropout
//! - [`wave`] - tile roles and rendezvous arithmetic
//! - [`launch`] - host-side launcher
//! - [`interop`] - candle tensor front end and dense reference

pub mod config;
pub mod copy;
pub mod dropout;
pub mod element;
pub mod gemm;
pub mod interop;
mod kernel;
pub mod launch;
pub mod params;
pub mod softmax;
pub mod wave;

pub use config::{FlashAttentionConfig, FwdTraits, KernelTraits, KernelVariant, LaunchOptions, TileShape};
pub use dropout::dropout_keep;
pub use element::Element;
pub use interop::{
    flash_attn_fwd, flash_attn_varlen_fwd, reference_attention, reference_softmax_lse, FlashAttentionOutput,
};
pub use launch::{completion_flags_for, run_flash_fwd};
pub use params::{BlockInfo, ForwardParams, FwdInputs, FwdOutputs, PhiloxArgs};
pub use softmax::{merge_softmax_states, RowState};
pub use wave::{TileRole, WavePlan};
