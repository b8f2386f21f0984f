/*
Copyright 2025 The Ringeth Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Bitmap slab allocator for DMA buffers.
//!
//! [`Slab`] splits a fixed region into `N`-byte slots tracked by a flat
//! `FixedBitSet`. Requests larger than one slot take a contiguous run, which is
//! how descriptor tables and jumbo frame buffers come out of the same region as
//! regular frame buffers.
//!
//! The search is linear from the low end of the bitmap, using `fixedbitset`'s
//! word-wise iteration over zero bits. The most recently freed run is cached and
//! handed out first, so a buffer released by TX reclaim is usually the one the
//! next RX refill receives. That keeps the working set of a busy ring small.
//!
//! [`BufferPool`] wraps a slab in a `spin::Mutex` so the RX and TX paths can
//! share it from different threads.

use thiserror::Error;

use fixedbitset::FixedBitSet;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Region base {0:#x} is not slot aligned")]
    InvalidAlign(u64),
    #[error("Invalid free of {1} bytes at {0:#x}")]
    InvalidFree(u64, usize),
    #[error("Zero-length allocation")]
    InvalidArg,
    #[error("Region too small for a single slot")]
    EmptyRegion,
    #[error("Out of DMA memory")]
    OutOfMemory,
    #[error("Address overflow")]
    Overflow,
}

/// A block of DMA memory handed out by a [`BufferProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// Bus address of the first byte.
    pub addr: u64,
    /// Length in bytes, rounded up to whole slots.
    pub len: usize,
}

/// Source of DMA buffers.
pub trait BufferProvider {
    /// Allocate at least `len` bytes.
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError>;

    /// Free a previously allocated block.
    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError>;

    /// Bytes currently free.
    fn free_bytes(&self) -> usize;
}

impl<P: BufferProvider> BufferProvider for alloc::sync::Arc<P> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }

    fn free_bytes(&self) -> usize {
        (**self).free_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base_addr: u64,
    used_slots: FixedBitSet,
    /// Most recently freed run, reused before searching the bitmap.
    last_free_run: Option<Allocation>,
}

impl<const N: usize> Slab<N> {
    /// Create a slab over `[base_addr, base_addr + region_len)`.
    /// The region is rounded down to a multiple of N.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        let num_slots = region_len / N;

        if !base_addr.is_multiple_of(N as u64) {
            return Err(AllocError::InvalidAlign(base_addr));
        }

        if num_slots == 0 {
            return Err(AllocError::EmptyRegion);
        }

        Ok(Self {
            base_addr,
            used_slots: FixedBitSet::with_capacity(num_slots),
            last_free_run: None,
        })
    }

    #[inline]
    fn addr_of(&self, slot_idx: usize) -> Option<u64> {
        self.base_addr
            .checked_add((slot_idx as u64).checked_mul(N as u64)?)
    }

    #[inline]
    fn slot_of(&self, addr: u64) -> usize {
        ((addr - self.base_addr) as usize) / N
    }

    fn maybe_invalidate_last_run(&mut self, alloc: Allocation) {
        if let Some(run) = &self.last_free_run {
            let new_end = alloc.addr + alloc.len as u64;
            let run_end = run.addr + run.len as u64;

            if alloc.addr < run_end && run.addr < new_end {
                self.last_free_run = None;
            }
        }
    }

    /// Find the first run of `slots_num` free slots.
    pub fn find_slots(&mut self, slots_num: usize) -> Option<usize> {
        debug_assert!(slots_num > 0);

        if let Some(run) = self.last_free_run
            && run.len >= slots_num * N
        {
            self.last_free_run = None;
            return Some(self.slot_of(run.addr));
        }

        let total = self.used_slots.len();
        self.used_slots.zeroes().find(|&start| {
            start + slots_num <= total
                && self.used_slots.count_zeroes(start..start + slots_num) == slots_num
        })
    }

    /// Allocate at least `len` bytes.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }

        let need_slots = len.div_ceil(N);
        if need_slots > self.used_slots.len() {
            return Err(AllocError::OutOfMemory);
        }

        let idx = self.find_slots(need_slots).ok_or(AllocError::OutOfMemory)?;
        self.used_slots.insert_range(idx..idx + need_slots);
        let addr = self.addr_of(idx).ok_or(AllocError::Overflow)?;

        let alloc = Allocation {
            addr,
            len: need_slots * N,
        };

        self.maybe_invalidate_last_run(alloc);
        Ok(alloc)
    }

    /// Free a block returned by [`Slab::alloc`].
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let Allocation { addr, len } = alloc;
        if len == 0 || !len.is_multiple_of(N) || addr < self.base_addr {
            return Err(AllocError::InvalidFree(addr, len));
        }
        let off = (addr - self.base_addr) as usize;
        if !off.is_multiple_of(N) {
            return Err(AllocError::InvalidFree(addr, len));
        }
        let start = off / N;
        let count = len / N;
        if start + count > self.used_slots.len() {
            return Err(AllocError::InvalidFree(addr, len));
        }

        // double free
        if !self.used_slots.contains_all_in_range(start..start + count) {
            return Err(AllocError::InvalidFree(addr, len));
        }

        self.used_slots.remove_range(start..start + count);
        self.last_free_run = Some(alloc);

        Ok(())
    }

    pub fn free_bytes(&self) -> usize {
        self.used_slots.count_zeroes(..) * N
    }

    /// Total bytes managed by this slab.
    pub fn capacity(&self) -> usize {
        self.used_slots.len() * N
    }

    pub fn range(&self) -> core::ops::Range<u64> {
        self.base_addr..self.base_addr + self.capacity() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(&addr)
    }
}

/// Thread-safe slab of `SLOT`-byte buffers.
#[derive(Debug)]
pub struct BufferPool<const SLOT: usize = 2048> {
    inner: spin::Mutex<Slab<SLOT>>,
}

impl<const SLOT: usize> BufferPool<SLOT> {
    /// Slot size in bytes.
    pub const SLOT_SIZE: usize = SLOT;

    /// Create a pool over a fixed region.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        Ok(Self {
            inner: spin::Mutex::new(Slab::new(base_addr, region_len)?),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.inner.lock().contains(addr)
    }
}

impl<const SLOT: usize> BufferProvider for BufferPool<SLOT> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        self.inner.lock().alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        self.inner.lock().dealloc(alloc)
    }

    fn free_bytes(&self) -> usize {
        self.inner.lock().free_bytes()
    }
}


#[cfg(test)]
mod fuzz {
    use alloc::vec::Vec;

    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::*;

    const SLOT: usize = 256;
    const SLOTS: usize = 32;

    #[derive(Clone, Debug)]
    enum Op {
        Alloc(usize),
        /// free the i-th live allocation (mod live count)
        Free(usize),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                Op::Alloc(usize::arbitrary(g) % (SLOT * 4) + 1)
            } else {
                Op::Free(usize::arbitrary(g))
            }
        }
    }

    fn overlaps(a: &Allocation, b: &Allocation) -> bool {
        a.addr < b.addr + b.len as u64 && b.addr < a.addr + a.len as u64
    }

    fn prop_no_overlap_and_accounting(ops: Vec<Op>) -> bool {
        let mut slab = Slab::<SLOT>::new(0x4000, SLOT * SLOTS).unwrap();
        let mut live: Vec<Allocation> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(len) => {
                    if let Ok(a) = slab.alloc(len) {
                        if a.len < len || live.iter().any(|b| overlaps(&a, b)) {
                            return false;
                        }
                        if !slab.contains(a.addr) {
                            return false;
                        }
                        live.push(a);
                    }
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let a = live.swap_remove(i % live.len());
                        if slab.dealloc(a).is_err() {
                            return false;
                        }
                    }
                }
            }

            let used: usize = live.iter().map(|a| a.len).sum();
            if slab.free_bytes() + used != slab.capacity() {
                return false;
            }
        }
        true
    }

    #[test]
    fn fuzz_slab_allocations_never_overlap() {
        QuickCheck::new()
            .tests(500)
            .quickcheck(prop_no_overlap_and_accounting as fn(Vec<Op>) -> bool);
    }
}
