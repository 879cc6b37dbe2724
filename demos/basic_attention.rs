// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Basic attention example demonstrating the flash attention forward pass.
//!
//! This example shows how to:
//! - Configure a causal, wave-balanced launch with FlashAttentionConfig
//! - Run the forward pass on Q, K, V tensors with grouped-query heads
//! - Compare the result against the dense reference
//!
//! Run with: `cargo run --example basic_attention`

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use flash_wave::kernels::flash::{flash_attn_fwd, reference_attention, FlashAttentionConfig, PhiloxArgs};

fn main() -> Result<()> {
    println!("=== Flash Attention Example ===\n");

    let batch_size = 2;
    let seq_len = 200;
    let num_heads = 8;
    let num_kv_heads = 2;
    let head_dim = 64;

    let config = FlashAttentionConfig::for_long_sequences().with_causal_mask();

    println!("Configuration:");
    println!("  Tile shape: {:?}", config.tile_shape);
    println!("  Causal: {}", config.causal_mask);
    println!("  Wave balancing: {}", config.wave_balance);
    println!(
        "  Scratch per unit: {} bytes",
        config.shared_memory_bytes(head_dim, 4)
    );
    println!("  Query tiles per head: {}", config.num_q_tiles(seq_len));
    println!();

    let device = Device::Cpu;
    let q = Tensor::randn(0.0f32, 1.0, (batch_size, seq_len, num_heads, head_dim), &device)?;
    let k = Tensor::randn(0.0f32, 1.0, (batch_size, seq_len, num_kv_heads, head_dim), &device)?;
    let v = Tensor::randn(0.0f32, 1.0, (batch_size, seq_len, num_kv_heads, head_dim), &device)?;

    println!("Running forward pass...");
    let out = flash_attn_fwd(&q, &k, &v, &config)?;
    println!("Forward pass completed.\n");

    println!("Output:");
    println!("  Shape: {:?}", out.output.dims());
    println!("  LSE shape: {:?}", out.softmax_lse.dims());
    assert_eq!(out.output.dims(), q.dims(), "Output shape mismatch");

    let reference = reference_attention(&q, &k, &v, &config)?;
    let mae = (&out.output - &reference)?
        .abs()?
        .mean_all()?
        .to_scalar::<f32>()?;
    println!("  Mean absolute error vs reference: {mae:.2e}");
    assert!(mae < 1e-4, "Output differs from reference");
    println!("  Reference check: PASSED\n");

    println!("Running with dropout (p = 0.1, bf16)...");
    let philox = PhiloxArgs { seed: 42, offset: 0 };
    let dropout_config = config.with_dropout(0.1, philox);
    let (q, k, v) = (
        q.to_dtype(DType::BF16)?,
        k.to_dtype(DType::BF16)?,
        v.to_dtype(DType::BF16)?,
    );
    let first = flash_attn_fwd(&q, &k, &v, &dropout_config)?;
    let second = flash_attn_fwd(&q, &k, &v, &dropout_config)?;
    let diff = (first.output.to_dtype(DType::F32)? - second.output.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    println!("  RNG state: {:?}", first.rng_state);
    println!("  Max difference between repeated runs: {diff}");
    assert_eq!(diff, 0.0, "Dropout is not reproducible");

    println!("\n=== Example completed successfully! ===");

    Ok(())
}
