//! Attention kernels.

pub mod flash;

pub use flash::{flash_attn_fwd, flash_attn_varlen_fwd, FlashAttentionConfig, FlashAttentionOutput};
