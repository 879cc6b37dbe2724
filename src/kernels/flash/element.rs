// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Narrow element types accepted by the forward kernel.
//!
//! Operands are stored in the narrow type and widened to `f32` for every
//! multiply-accumulate; accumulators, softmax statistics and LSE stay in `f32`.

use std::fmt;

use candle_core::WithDType;
use half::{bf16, f16};

use crate::memory::Word;

/// An element type the kernel can be instantiated for.
pub trait Element: WithDType + Default + fmt::Debug {
    /// Raw bit pattern used for bulk-memory storage.
    type Bits: Word;

    /// Round an `f32` to this type.
    fn narrow(value: f32) -> Self;

    /// Widen to `f32` exactly.
    fn widen(self) -> f32;

    /// Reinterpret as raw bits.
    fn to_bits(self) -> Self::Bits;

    /// Reinterpret raw bits.
    fn from_bits(bits: Self::Bits) -> Self;
}

impl Element for f32 {
    type Bits = u32;

    #[inline]
    fn narrow(value: f32) -> Self {
        value
    }

    #[inline]
    fn widen(self) -> f32 {
        self
    }

    #[inline]
    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    #[inline]
    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

macro_rules! impl_half_element {
    ($ty:ty) => {
        impl Element for $ty {
            type Bits = u16;

            #[inline]
            fn narrow(value: f32) -> Self {
                <$ty>::from_f32(value)
            }

            #[inline]
            fn widen(self) -> f32 {
                self.to_f32()
            }

            #[inline]
            fn to_bits(self) -> u16 {
                <$ty>::to_bits(self)
            }

            #[inline]
            fn from_bits(bits: u16) -> Self {
                <$ty>::from_bits(bits)
            }
        }
    };
}

impl_half_element!(f16);
impl_half_element!(bf16);
