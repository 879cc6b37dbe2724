// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Bulk-memory buffers shared by every unit of a launch.
//!
//! Units run concurrently on worker threads and write disjoint regions of
//! the output buffers, except for the wave-balancing protocol where a helper
//! unit reads and then overwrites what its paired publisher wrote. Backing
//! every element with an atomic word keeps those accesses data-race free
//! without `unsafe`: element traffic is `Relaxed`, and the happens-before
//! edge between publisher and helper comes from the [`CompletionFlags`]
//! release/acquire pair.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::kernels::flash::Element;

/// A plain machine word that has an atomic counterpart.
pub trait Word: Copy + Default + Send + Sync + 'static {
    /// Atomic storage cell for this word.
    type Atomic: Send + Sync;

    /// Wrap a value in a fresh atomic cell.
    fn new_atomic(self) -> Self::Atomic;

    /// Relaxed load.
    fn load(cell: &Self::Atomic) -> Self;

    /// Relaxed store.
    fn store(cell: &Self::Atomic, value: Self);
}

macro_rules! impl_word {
    ($word:ty, $atomic:ty) => {
        impl Word for $word {
            type Atomic = $atomic;

            #[inline]
            fn new_atomic(self) -> Self::Atomic {
                <$atomic>::new(self)
            }

            #[inline]
            fn load(cell: &Self::Atomic) -> Self {
                cell.load(Ordering::Relaxed)
            }

            #[inline]
            fn store(cell: &Self::Atomic, value: Self) {
                cell.store(value, Ordering::Relaxed);
            }
        }
    };
}

impl_word!(u16, AtomicU16);
impl_word!(u32, AtomicU32);

/// A buffer in bulk (global) memory, readable and writable from every unit.
pub struct GlobalBuffer<E: Element> {
    cells: Box<[<E::Bits as Word>::Atomic]>,
    _element: PhantomData<E>,
}

impl<E: Element> GlobalBuffer<E> {
    /// Allocate a zero-filled buffer.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self::filled(len, E::narrow(0.0))
    }

    /// Allocate a buffer with every element set to `value`.
    #[must_use]
    pub fn filled(len: usize, value: E) -> Self {
        let bits = value.to_bits();
        Self {
            cells: (0..len).map(|_| bits.new_atomic()).collect(),
            _element: PhantomData,
        }
    }

    /// Copy host data into a new buffer.
    #[must_use]
    pub fn from_slice(data: &[E]) -> Self {
        Self {
            cells: data.iter().map(|v| v.to_bits().new_atomic()).collect(),
            _element: PhantomData,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read one element.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> E {
        E::from_bits(<E::Bits as Word>::load(&self.cells[index]))
    }

    /// Write one element.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn store(&self, index: usize, value: E) {
        <E::Bits as Word>::store(&self.cells[index], value.to_bits());
    }

    /// Copy the buffer back to host memory.
    #[must_use]
    pub fn to_vec(&self) -> Vec<E> {
        (0..self.len()).map(|i| self.load(i)).collect()
    }
}

impl<E: Element> fmt::Debug for GlobalBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalBuffer")
            .field("dtype", &E::DTYPE)
            .field("len", &self.len())
            .finish()
    }
}

/// Spins before the waiting thread starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// The per-launch grid of completion flags, indexed by (head, batch, query tile).
///
/// Owned by the launcher and passed into every wave-balanced launch. Each
/// flag is set exactly once by the publishing tile and never reset while the
/// grid runs; call [`CompletionFlags::reset`] between launches.
pub struct CompletionFlags {
    flags: Box<[AtomicU32]>,
    heads: usize,
    batch: usize,
    m_blocks: usize,
}

impl CompletionFlags {
    /// Allocate a cleared flag grid.
    #[must_use]
    pub fn zeroed(heads: usize, batch: usize, m_blocks: usize) -> Self {
        Self {
            flags: (0..heads * batch * m_blocks).map(|_| AtomicU32::new(0)).collect(),
            heads,
            batch,
            m_blocks,
        }
    }

    /// Grid dimensions as `(heads, batch, m_blocks)`.
    #[must_use]
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.heads, self.batch, self.m_blocks)
    }

    /// Whether every flag is zero.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.flags.iter().all(|f| f.load(Ordering::Acquire) == 0)
    }

    /// Clear every flag. Requires exclusive access, so no launch can be running.
    pub fn reset(&mut self) {
        for flag in self.flags.iter_mut() {
            *flag.get_mut() = 0;
        }
    }

    /// Whether the tile at `(head, batch, m_block)` has published.
    #[must_use]
    pub fn is_set(&self, head: usize, batch: usize, m_block: usize) -> bool {
        self.flags[self.index(head, batch, m_block)].load(Ordering::Acquire) != 0
    }

    #[inline]
    fn index(&self, head: usize, batch: usize, m_block: usize) -> usize {
        debug_assert!(head < self.heads && batch < self.batch && m_block < self.m_blocks);
        (head * self.batch + batch) * self.m_blocks + m_block
    }

    /// Signal that the partial state of `(head, batch, m_block)` is visible.
    ///
    /// All bulk-memory writes made by the calling unit before this call
    /// happen-before any read made after a matching [`wait`](Self::wait).
    pub(crate) fn publish(&self, head: usize, batch: usize, m_block: usize) {
        let previous = self.flags[self.index(head, batch, m_block)].fetch_or(1, Ordering::Release);
        debug_assert_eq!(previous, 0, "completion flag set twice");
    }

    /// Busy-wait until `(head, batch, m_block)` has published.
    ///
    /// There is no timeout: the publisher must be resident and making
    /// progress, which the launcher's dispatch order guarantees.
    pub(crate) fn wait(&self, head: usize, batch: usize, m_block: usize) {
        let flag = &self.flags[self.index(head, batch, m_block)];
        let mut spins = 0u32;
        while flag.load(Ordering::Acquire) == 0 {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl fmt::Debug for CompletionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFlags")
            .field("heads", &self.heads)
            .field("batch", &self.batch)
            .field("m_blocks", &self.m_blocks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use std::sync::Arc;

    #[test]
    fn test_global_buffer_roundtrip_f32() {
        let buf = GlobalBuffer::<f32>::zeros(4);
        buf.store(2, 1.5);
        assert_eq!(buf.to_vec(), vec![0.0, 0.0, 1.5, 0.0]);
    }

    #[test]
    fn test_global_buffer_f16_preserves_sign_bit() {
        let buf = GlobalBuffer::<f16>::filled(2, f16::from_f32(0.25));
        buf.store(1, f16::from_f32(-0.25));
        assert!(buf.load(1).is_sign_negative());
        assert_eq!(buf.load(0), f16::from_f32(0.25));
    }

    #[test]
    fn test_flags_publish_and_reset() {
        let mut flags = CompletionFlags::zeroed(2, 3, 4);
        assert!(flags.is_clear());
        flags.publish(1, 2, 3);
        assert!(flags.is_set(1, 2, 3));
        assert!(!flags.is_set(0, 2, 3));
        assert!(!flags.is_clear());
        flags.reset();
        assert!(flags.is_clear());
    }

    #[test]
    fn test_flag_wait_observes_published_data() {
        let flags = Arc::new(CompletionFlags::zeroed(1, 1, 2));
        let data = Arc::new(GlobalBuffer::<f32>::zeros(1));

        let publisher = {
            let flags = Arc::clone(&flags);
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                data.store(0, 42.0);
                flags.publish(0, 0, 1);
            })
        };

        flags.wait(0, 0, 1);
        assert_eq!(data.load(0), 42.0);
        publisher.join().unwrap();
    }
}
