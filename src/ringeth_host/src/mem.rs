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

//! DMA-visible memory for descriptor tables and frame buffers.
//!
//! [`DmaRegion`] owns one page-aligned, zeroed allocation and carves it into
//! slots with a [`BufferPool`]. Bus addresses are the host virtual addresses of
//! the region, which is what a device model sharing the process expects. A port
//! to real hardware swaps this for a coherent mapping with the same traits.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, Ordering};

use ringeth_common::PAGE_SIZE;
use ringeth_common::dma::{AllocError, Allocation, BufferPool, BufferProvider, DmaMemory};
use thiserror::Error;
use tracing::{Span, instrument};

use crate::{Result, RingEthError};

/// Slot size of the region's buffer pool. A standard frame fits one slot.
pub const DMA_SLOT_SIZE: usize = 2048;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaAccessError {
    #[error("Access of {len} bytes at {addr:#x} is outside the DMA region")]
    OutOfBounds { addr: u64, len: usize },
    #[error("Atomic access at {0:#x} is misaligned")]
    Misaligned(u64),
}

/// A zeroed, page-aligned block of DMA memory with a slot allocator on top.
pub struct DmaRegion {
    base: NonNull<u8>,
    layout: Layout,
    pool: BufferPool<DMA_SLOT_SIZE>,
}

// SAFETY: the region is plain memory. Concurrent access is coordinated by the
// descriptor ownership protocol and the atomic accessors below.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate a region of at least `len` bytes, rounded up to whole pages.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(len: usize) -> Result<Self> {
        let len = len.max(DMA_SLOT_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| RingEthError::InvalidConfig(format!("DMA region of {len} bytes: {e}")))?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            RingEthError::OutOfMemory(format!("cannot allocate a {len} byte DMA region"))
        })?;

        let pool = match BufferPool::new(base.as_ptr() as u64, len) {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: allocated above with the same layout
                unsafe { dealloc(base.as_ptr(), layout) };
                return Err(e.into());
            }
        };

        log::debug!("DMA region of {len} bytes at {:#x}", base.as_ptr() as u64);
        Ok(Self { base, layout, pool })
    }

    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn pool(&self) -> &BufferPool<DMA_SLOT_SIZE> {
        &self.pool
    }

    /// Return every buffer in `bufs` to the pool. A failed free does not stop
    /// the rest; the first error is returned once all were attempted.
    pub(crate) fn dealloc_all(&self, bufs: impl IntoIterator<Item = Allocation>) -> Result<()> {
        let mut first_err = None;
        for buf in bufs {
            if let Err(e) = self.pool.dealloc(buf) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), |e| Err(e.into()))
    }

    fn ptr_for(&self, addr: u64, len: usize) -> std::result::Result<*mut u8, DmaAccessError> {
        let oob = DmaAccessError::OutOfBounds { addr, len };
        let off = addr.checked_sub(self.base_addr()).ok_or(oob)? as usize;
        let end = off.checked_add(len).ok_or(oob)?;
        if end > self.len() {
            return Err(oob);
        }
        Ok(self.base.as_ptr().wrapping_add(off))
    }

    /// Borrow `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The range must belong to a buffer the caller exclusively owns, so that
    /// neither the device nor another thread writes it while the slice lives.
    pub(crate) unsafe fn slice(&self, addr: u64, len: usize) -> std::result::Result<&[u8], DmaAccessError> {
        let ptr = self.ptr_for(addr, len)?;
        // SAFETY: bounds checked above, exclusivity guaranteed by the caller
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    fn atomic_u16(&self, addr: u64) -> std::result::Result<&AtomicU16, DmaAccessError> {
        if !addr.is_multiple_of(2) {
            return Err(DmaAccessError::Misaligned(addr));
        }
        let ptr = self.ptr_for(addr, 2)?;
        // SAFETY: in bounds, 2-byte aligned, and the region outlives the reference
        Ok(unsafe { AtomicU16::from_ptr(ptr.cast::<u16>()) })
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with this layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("len", &self.len())
            .field("free", &self.pool.free_bytes())
            .finish()
    }
}

impl DmaMemory for DmaRegion {
    type Error = DmaAccessError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> std::result::Result<usize, Self::Error> {
        let src = self.ptr_for(addr, dst.len())?;
        // SAFETY: bounds checked; dst cannot alias the region through a &mut
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> std::result::Result<usize, Self::Error> {
        let dst = self.ptr_for(addr, src.len())?;
        // SAFETY: bounds checked
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn fill(&self, addr: u64, byte: u8, len: usize) -> std::result::Result<(), Self::Error> {
        let dst = self.ptr_for(addr, len)?;
        // SAFETY: bounds checked
        unsafe { ptr::write_bytes(dst, byte, len) };
        Ok(())
    }

    fn load_acquire(&self, addr: u64) -> std::result::Result<u16, Self::Error> {
        Ok(self.atomic_u16(addr)?.load(Ordering::Acquire))
    }

    fn store_release(&self, addr: u64, val: u16) -> std::result::Result<(), Self::Error> {
        self.atomic_u16(addr)?.store(val, Ordering::Release);
        Ok(())
    }
}

impl BufferProvider for DmaRegion {
    fn alloc(&self, len: usize) -> std::result::Result<Allocation, AllocError> {
        self.pool.alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> std::result::Result<(), AllocError> {
        self.pool.dealloc(alloc)
    }

    fn free_bytes(&self) -> usize {
        self.pool.free_bytes()
    }
}
