//! Flash attention forward benchmarks.
//!
//! Compares causal launches with and without wave balancing across tile
//! shapes and sequence lengths, and the tiled kernel against the dense
//! candle reference.
//!
//! Run with: `cargo bench --bench kernels`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flash_wave::kernels::flash::{flash_attn_fwd, reference_attention, FlashAttentionConfig, TileShape};

use candle_core::{Device, Tensor};

/// Benchmark configurations for testing various input sizes
const SEQ_LENS: &[usize] = &[256, 512, 1024];
const NUM_HEADS: usize = 8;
const HEAD_DIM: usize = 64;

fn qkv(batch_size: usize, seq_len: usize, device: &Device) -> Option<(Tensor, Tensor, Tensor)> {
    let shape = (batch_size, seq_len, NUM_HEADS, HEAD_DIM);
    let q = Tensor::randn(0.0f32, 1.0, shape, device).ok()?;
    let k = Tensor::randn(0.0f32, 1.0, shape, device).ok()?;
    let v = Tensor::randn(0.0f32, 1.0, shape, device).ok()?;
    Some((q, k, v))
}

/// Causal forward pass with and without wave balancing
fn benchmark_wave_balance(c: &mut Criterion) {
    let mut group = c.benchmark_group("flash_attention_causal");
    let device = Device::Cpu;

    for &seq_len in SEQ_LENS {
        let Some((q, k, v)) = qkv(1, seq_len, &device) else {
            continue;
        };

        for shape in [TileShape::M64N64, TileShape::M128N64] {
            let base = FlashAttentionConfig::default()
                .with_tile_shape(shape)
                .with_causal_mask();
            for (label, config) in [("wave", base), ("plain", base.without_wave_balance())] {
                let id = format!("{shape:?}_s{seq_len}");
                group.bench_with_input(BenchmarkId::new(label, &id), &config, |b, config| {
                    b.iter(|| flash_attn_fwd(&q, &k, &v, config).unwrap());
                });
            }
        }

        let smem = FlashAttentionConfig::for_long_sequences().shared_memory_bytes(HEAD_DIM, 4);
        println!("Scratch per unit (M128N64, head_dim={HEAD_DIM}, f32): {smem} bytes");
    }

    group.finish();
}

/// Tiled kernel against the dense candle reference
fn benchmark_vs_reference(c: &mut Criterion) {
    let mut group = c.benchmark_group("flash_vs_reference");
    let device = Device::Cpu;
    let config = FlashAttentionConfig::default().with_causal_mask();

    for &seq_len in &SEQ_LENS[..2] {
        let Some((q, k, v)) = qkv(1, seq_len, &device) else {
            continue;
        };
        let id = format!("s{seq_len}");
        group.bench_with_input(BenchmarkId::new("flash", &id), &config, |b, config| {
            b.iter(|| flash_attn_fwd(&q, &k, &v, config).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("reference", &id), &config, |b, config| {
            b.iter(|| reference_attention(&q, &k, &v, config).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .measurement_time(std::time::Duration::from_secs(5));
    targets = benchmark_wave_balance, benchmark_vs_reference
);
criterion_main!(benches);
