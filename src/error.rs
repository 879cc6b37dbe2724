// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for flash-wave.
//!
//! The kernel body itself has no recoverable error paths; every variant here
//! is raised by host-side setup (parameter validation, launch, tensor
//! conversion) before or after the grid runs.

use thiserror::Error;

/// Result type alias for flash-wave operations.
pub type Result<T> = std::result::Result<T, FlashError>;

/// Errors that can occur while preparing or launching the forward kernel.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlashError {
    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Head dimension larger than any compiled kernel supports.
    #[error("unsupported head dimension {head_dim} (maximum {max})")]
    UnsupportedHeadDim {
        /// Requested head dimension
        head_dim: usize,
        /// Largest supported head dimension
        max: usize,
    },

    /// Element type without a compiled kernel.
    #[error("unsupported dtype: {0:?}")]
    UnsupportedDType(candle_core::DType),

    /// A bulk-memory buffer is smaller than the launch addresses.
    #[error("buffer `{name}` too small: required {required} elements, got {actual}")]
    BufferTooSmall {
        /// Buffer name
        name: &'static str,
        /// Required element count
        required: usize,
        /// Actual element count
        actual: usize,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
