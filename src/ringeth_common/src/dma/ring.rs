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

//! Descriptor ring with monotonic cursors.
//!
//! A [`DescRing`] owns a descriptor table in DMA memory and two cursors:
//!
//! - `head`: the next slot the host produces into
//! - `tail`: the next slot the host expects the device to complete
//!
//! Cursors only ever grow; the table index of a cursor is `cursor % table_len`.
//! The device sees the ring through index registers, where `cpu_idx == dma_idx`
//! means "nothing to do". A full ring would look the same, so a ring able to
//! hold `capacity` in-flight buffers uses `capacity + 1` descriptors and at
//! most `capacity` of them are ever outstanding:
//!
//! ```text
//!             tail                head
//!              v                   v
//!   +-----+-----+-----+-----+-----+-----+
//!   |  .  | dev | dev | dev | dev |  .  |     0 <= head - tail <= capacity
//!   +-----+-----+-----+-----+-----+-----+
//! ```
//!
//! The ring only moves cursors and reads/writes descriptors. Which buffer sits
//! behind a slot is tracked by the engine that owns the ring.

use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{AllocError, Allocation, BufferProvider, DescTable, Descriptor, DmaMemory};

/// Largest capacity an index register (12 bits) can express.
pub const MAX_RING_CAPACITY: usize = 4095;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Descriptor ring is full")]
    Full,
    #[error("Descriptor ring is empty")]
    Empty,
    #[error("Ring capacity must be between 1 and 4095, got {0}")]
    InvalidCapacity(usize),
    #[error("Out of DMA memory for the descriptor table")]
    OutOfMemory,
    #[error("Cursor {cursor} outside live window {tail}..{head}")]
    CursorOutOfRange { cursor: u64, tail: u64, head: u64 },
    #[error("Backend memory error")]
    MemError,
    #[error("Descriptor table allocation failed: {0}")]
    Alloc(AllocError),
}

impl From<AllocError> for RingError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => RingError::OutOfMemory,
            other => RingError::Alloc(other),
        }
    }
}

/// A descriptor table plus producer/consumer cursors.
#[derive(Debug)]
pub struct DescRing<M> {
    mem: M,
    table: DescTable,
    storage: Allocation,
    capacity: usize,
    head: u64,
    tail: u64,
}

impl<M: DmaMemory> DescRing<M> {
    /// Allocate a zeroed table able to hold `capacity` in-flight descriptors.
    ///
    /// Both cursors start at zero. Fails with [`RingError::OutOfMemory`] when the
    /// provider cannot supply the table.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(mem, pool), parent = Span::current(), level = "Trace"))]
    pub fn allocate<P: BufferProvider + ?Sized>(
        mem: M,
        pool: &P,
        capacity: usize,
    ) -> Result<Self, RingError> {
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(RingError::InvalidCapacity(capacity));
        }

        let table_len = capacity + 1;
        let storage = pool.alloc(DescTable::query_size(table_len))?;

        if mem.fill(storage.addr, 0, storage.len).is_err() {
            let _ = pool.dealloc(storage);
            return Err(RingError::MemError);
        }

        // SAFETY: storage was just handed out by the provider and is at least
        // query_size(table_len) bytes; slot sizes are multiples of 16.
        let table = unsafe { DescTable::from_raw_parts(storage.addr, table_len) };

        log::trace!(
            "descriptor ring allocated: capacity={capacity} base={:#x}",
            storage.addr
        );

        Ok(Self {
            mem,
            table,
            storage,
            capacity,
            head: 0,
            tail: 0,
        })
    }

    /// Number of in-flight descriptors the ring can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of descriptors in the table (`capacity + 1`).
    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    pub fn table(&self) -> DescTable {
        self.table
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Descriptors produced and not yet consumed.
    pub fn in_flight(&self) -> usize {
        (self.head - self.tail) as usize
    }

    /// Table slots not holding an in-flight descriptor, sentinel included.
    pub fn free_slots(&self) -> usize {
        self.table_len() - self.in_flight()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.in_flight() == self.capacity
    }

    /// Table index of `cursor`.
    #[inline]
    pub fn slot_index(&self, cursor: u64) -> usize {
        (cursor % self.table_len() as u64) as usize
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }

    fn slot_addr(&self, cursor: u64) -> Result<u64, RingError> {
        self.table
            .desc_addr(self.slot_index(cursor))
            .ok_or(RingError::CursorOutOfRange {
                cursor,
                tail: self.tail,
                head: self.head,
            })
    }

    /// Read the descriptor at `cursor mod N` with acquire ordering on its flags.
    pub fn slot_at(&self, cursor: u64) -> Result<Descriptor, RingError> {
        let addr = self.slot_addr(cursor)?;
        Descriptor::read_acquire(&self.mem, addr).map_err(|_| RingError::MemError)
    }

    /// Overwrite the descriptor of an in-flight slot.
    pub fn rearm(&mut self, cursor: u64, desc: Descriptor) -> Result<(), RingError> {
        if cursor < self.tail || cursor >= self.head {
            return Err(RingError::CursorOutOfRange {
                cursor,
                tail: self.tail,
                head: self.head,
            });
        }
        let addr = self.slot_addr(cursor)?;
        desc.write_release(&self.mem, addr)
            .map_err(|_| RingError::MemError)
    }

    /// Publish `desc` at the producer cursor and advance it.
    ///
    /// Returns the cursor the descriptor was written at.
    pub fn produce(&mut self, desc: Descriptor) -> Result<u64, RingError> {
        if self.is_full() {
            return Err(RingError::Full);
        }

        let cursor = self.head;
        let addr = self.slot_addr(cursor)?;
        desc.write_release(&self.mem, addr)
            .map_err(|_| RingError::MemError)?;
        self.head += 1;

        debug_assert!(self.head - self.tail <= self.capacity as u64);
        Ok(cursor)
    }

    /// Advance the consumer cursor past the slot at `tail`.
    ///
    /// Returns the cursor that was consumed.
    pub fn consume(&mut self) -> Result<u64, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty);
        }

        let cursor = self.tail;
        self.tail += 1;
        Ok(cursor)
    }

    /// Zero every descriptor and rewind both cursors.
    ///
    /// Only valid once the device has stopped and released every slot.
    pub fn reset(&mut self) -> Result<(), RingError> {
        self.mem
            .fill(self.storage.addr, 0, self.storage.len)
            .map_err(|_| RingError::MemError)?;
        self.head = 0;
        self.tail = 0;
        Ok(())
    }

    /// Return the table storage to `pool`.
    pub fn release<P: BufferProvider + ?Sized>(self, pool: &P) -> Result<(), RingError> {
        pool.dealloc(self.storage)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use alloc::rc::Rc;
    use core::cell::UnsafeCell;
    use core::ptr;
    use core::sync::atomic::{AtomicU16, Ordering};

    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::dma::BufferPool;

    /// Heap-backed DMA memory for tests.
    ///
    /// Addresses are host pointers derived from the Vec's base pointer so that
    /// provenance is preserved.
    #[derive(Debug)]
    pub struct TestMem {
        storage: UnsafeCell<Vec<u8>>,
        base_addr: u64,
    }

    impl TestMem {
        pub fn new(size: usize) -> Self {
            let storage = vec![0u8; size];
            let base_addr = storage.as_ptr() as u64;
            Self {
                storage: UnsafeCell::new(storage),
                base_addr,
            }
        }

        fn ptr_for_addr(&self, addr: u64) -> *mut u8 {
            let storage = unsafe { &mut *self.storage.get() };
            let offset = (addr - self.base_addr) as usize;
            assert!(offset < storage.len());
            storage.as_mut_ptr().wrapping_add(offset)
        }

        pub fn base_addr(&self) -> u64 {
            self.base_addr
        }
    }

    impl DmaMemory for Rc<TestMem> {
        type Error = core::convert::Infallible;

        fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
            let src = self.ptr_for_addr(addr);
            unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
            Ok(dst.len())
        }

        fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
            let dst = self.ptr_for_addr(addr);
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
            Ok(src.len())
        }

        fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
            let ptr = self.ptr_for_addr(addr).cast::<T>();
            Ok(unsafe { ptr::read_volatile(ptr) })
        }

        fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
            let ptr = self.ptr_for_addr(addr).cast::<T>();
            unsafe { ptr::write_volatile(ptr, val) };
            Ok(())
        }

        fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
            let ptr = self.ptr_for_addr(addr).cast::<AtomicU16>();
            Ok(unsafe { (*ptr).load(Ordering::Acquire) })
        }

        fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
            let ptr = self.ptr_for_addr(addr).cast::<AtomicU16>();
            unsafe { (*ptr).store(val, Ordering::Release) };
            Ok(())
        }
    }

    pub const SLOT: usize = 256;

    /// A pool and memory pair carved out of one [`TestMem`].
    pub struct TestRegion {
        pub mem: Rc<TestMem>,
        pub pool: BufferPool<SLOT>,
    }

    impl TestRegion {
        pub fn new(slots: usize) -> Self {
            let mem = Rc::new(TestMem::new((slots + 1) * SLOT));
            let base = (mem.base_addr() + SLOT as u64 - 1) & !(SLOT as u64 - 1);
            let pool = BufferPool::new(base, slots * SLOT).unwrap();
            Self { mem, pool }
        }

        pub fn ring(&self, capacity: usize) -> DescRing<Rc<TestMem>> {
            DescRing::allocate(self.mem.clone(), &self.pool, capacity).unwrap()
        }
    }

    /// Play the device: complete the descriptor at `cursor`.
    pub fn device_complete(ring: &DescRing<Rc<TestMem>>, cursor: u64, frame_len: u16) {
        let idx = ring.slot_index(cursor);
        let addr = ring.table().desc_addr(idx).unwrap();
        let mut d = Descriptor::read_acquire(ring.mem(), addr).unwrap();
        assert!(d.is_device_owned(), "device completed a host-owned slot");
        d.mark_done(frame_len);
        d.write_release(ring.mem(), addr).unwrap();
    }

    #[test]
    fn allocate_zeroes_table_and_resets_cursors() {
        let region = TestRegion::new(8);
        let ring = region.ring(4);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.table_len(), 5);
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);
        for i in 0..5 {
            let d = ring.slot_at(i).unwrap();
            assert_eq!(d, Descriptor::zeroed());
        }
    }

    #[test]
    fn allocate_rejects_zero_capacity() {
        let region = TestRegion::new(8);
        let err = DescRing::allocate(region.mem.clone(), &region.pool, 0).unwrap_err();
        assert_eq!(err, RingError::InvalidCapacity(0));
    }

    #[test]
    fn allocate_reports_out_of_memory() {
        let region = TestRegion::new(1);
        // 64 descriptors need 1040 bytes, the pool has 256
        let err = DescRing::allocate(region.mem.clone(), &region.pool, 64).unwrap_err();
        assert_eq!(err, RingError::OutOfMemory);
    }

    #[test]
    fn slot_at_wraps_modulo_table_len() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(3);
        for i in 0..3 {
            ring.produce(Descriptor::armed(0x1000 + i, 64)).unwrap();
        }
        assert_eq!(ring.slot_at(0).unwrap(), ring.slot_at(4).unwrap());
        assert_eq!(ring.slot_at(2).unwrap(), ring.slot_at(6).unwrap());
        assert_eq!(ring.slot_index(9), 1);
    }

    #[test]
    fn produce_stops_at_capacity() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(2);
        ring.produce(Descriptor::armed(0x1000, 64)).unwrap();
        ring.produce(Descriptor::armed(0x2000, 64)).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.free_slots(), 1);
        assert_eq!(
            ring.produce(Descriptor::armed(0x3000, 64)).unwrap_err(),
            RingError::Full
        );
    }

    #[test]
    fn consume_on_empty_ring_fails() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(2);
        assert_eq!(ring.consume().unwrap_err(), RingError::Empty);
    }

    #[test]
    fn completion_round_trip_through_memory() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(4);
        let c = ring.produce(Descriptor::armed(0xabc0, 1536)).unwrap();
        assert!(ring.slot_at(c).unwrap().is_device_owned());
        device_complete(&ring, c, 99);
        let d = ring.slot_at(ring.tail()).unwrap();
        assert!(d.is_complete());
        assert_eq!(d.frame_len, 99);
        assert_eq!(d.addr, 0xabc0);
        assert_eq!(ring.consume().unwrap(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn rearm_only_inside_live_window() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(4);
        let c = ring.produce(Descriptor::armed(0x1000, 64)).unwrap();
        ring.rearm(c, Descriptor::armed(0x2000, 64)).unwrap();
        assert_eq!(ring.slot_at(c).unwrap().addr, 0x2000);
        assert!(matches!(
            ring.rearm(c + 1, Descriptor::armed(0x3000, 64)),
            Err(RingError::CursorOutOfRange { .. })
        ));
    }

    #[test]
    fn reset_zeroes_and_rewinds() {
        let region = TestRegion::new(8);
        let mut ring = region.ring(4);
        ring.produce(Descriptor::armed(0x1000, 64)).unwrap();
        ring.produce(Descriptor::armed(0x2000, 64)).unwrap();
        ring.consume().unwrap();
        ring.reset().unwrap();
        assert_eq!((ring.head(), ring.tail()), (0, 0));
        assert_eq!(ring.slot_at(1).unwrap(), Descriptor::zeroed());
    }

    #[test]
    fn release_returns_storage() {
        let region = TestRegion::new(8);
        let before = region.pool.free_bytes();
        let ring = region.ring(4);
        assert!(region.pool.free_bytes() < before);
        ring.release(&region.pool).unwrap();
        assert_eq!(region.pool.free_bytes(), before);
    }
}
