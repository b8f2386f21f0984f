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

//! Transfer Descriptor Format
//!
//! One [`Descriptor`] describes one DMA buffer. The layout is shared with the
//! device: 16 bytes, little endian, flags last so they can be published with a
//! single release store.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::DmaMemory;

bitflags! {
    /// Ownership and completion bits of a descriptor.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// The device may read or write the buffer; the host must not touch the slot.
        const DEVICE_OWNED = 1 << 0;
        /// The device finished with the buffer (frame received or transmitted).
        const DONE         = 1 << 1;
        /// The buffer holds the last segment of a frame.
        const LAST_SEGMENT = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Bus address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes (TX: bytes to send).
    pub len: u32,
    /// Frame length reported by the device on receive completion.
    pub frame_len: u16,
    /// Flags (DEVICE_OWNED, DONE, LAST_SEGMENT).
    pub flags: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FRAME_LEN_OFFSET == 12);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 14);

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FRAME_LEN_OFFSET: usize = core::mem::offset_of!(Self, frame_len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    pub fn new(addr: u64, len: u32, flags: DescFlags) -> Self {
        Self {
            addr,
            len,
            frame_len: 0,
            flags: flags.bits(),
        }
    }

    /// A descriptor handed to the device: buffer bound, done bit clear.
    #[inline]
    pub fn armed(addr: u64, len: u32) -> Self {
        Self::new(addr, len, DescFlags::DEVICE_OWNED | DescFlags::LAST_SEGMENT)
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_device_owned(&self) -> bool {
        self.flags().contains(DescFlags::DEVICE_OWNED)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.flags().contains(DescFlags::DONE)
    }

    /// Has the device handed this slot back with its transfer finished?
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.is_done() && !self.is_device_owned()
    }

    /// Give the slot to the device. Clears a stale done bit.
    #[inline]
    pub fn mark_device_owned(&mut self) {
        let mut f = self.flags();
        f.insert(DescFlags::DEVICE_OWNED);
        f.remove(DescFlags::DONE);
        self.flags = f.bits();
    }

    /// Device side of the protocol: finish the transfer and return the slot.
    #[inline]
    pub fn mark_done(&mut self, frame_len: u16) {
        let mut f = self.flags();
        f.remove(DescFlags::DEVICE_OWNED);
        f.insert(DescFlags::DONE);
        self.flags = f.bits();
        self.frame_len = frame_len;
    }

    /// Read a descriptor with acquire semantics on the flags word.
    ///
    /// The flags are loaded first, so the remaining fields are at least as new as
    /// the ownership state the caller acts on.
    pub fn read_acquire<M: DmaMemory>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        let flags = mem.load_acquire(addr + Self::FLAGS_OFFSET as u64)?;
        let buf_addr: u64 = mem.read_val(addr + Self::ADDR_OFFSET as u64)?;
        let len: u32 = mem.read_val(addr + Self::LEN_OFFSET as u64)?;
        let frame_len: u16 = mem.read_val(addr + Self::FRAME_LEN_OFFSET as u64)?;

        Ok(Self {
            addr: buf_addr,
            len,
            frame_len,
            flags,
        })
    }

    /// Write a descriptor, publishing the flags word last with release semantics.
    pub fn write_release<M: DmaMemory>(&self, mem: &M, addr: u64) -> Result<(), M::Error> {
        mem.write_val(addr + Self::ADDR_OFFSET as u64, self.addr)?;
        mem.write_val(addr + Self::LEN_OFFSET as u64, self.len)?;
        mem.write_val(addr + Self::FRAME_LEN_OFFSET as u64, self.frame_len)?;
        mem.store_release(addr + Self::FLAGS_OFFSET as u64, self.flags)?;
        Ok(())
    }
}

/// Location of a descriptor table in DMA memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescTable {
    base_addr: u64,
    len: usize,
}

impl DescTable {
    /// Describe a table of `len` descriptors starting at `base_addr`.
    ///
    /// # Safety
    ///
    /// - `base_addr` must be valid for reads and writes of `len` descriptors
    /// - the memory must stay valid for as long as the table is used
    pub unsafe fn from_raw_parts(base_addr: u64, len: usize) -> Self {
        debug_assert!(base_addr.is_multiple_of(Descriptor::ALIGN as u64));
        Self { base_addr, len }
    }

    /// Bytes needed to hold `len` descriptors.
    pub const fn query_size(len: usize) -> usize {
        len * Descriptor::SIZE
    }

    /// Address of descriptor `idx`, or None if `idx` is out of bounds.
    pub fn desc_addr(&self, idx: usize) -> Option<u64> {
        if idx >= self.len {
            return None;
        }

        Some(self.base_addr + (idx as u64 * Descriptor::SIZE as u64))
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Number of descriptors in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_descriptor_is_device_owned() {
        let d = Descriptor::armed(0x1000, 2048);
        assert!(d.is_device_owned());
        assert!(!d.is_done());
        assert!(!d.is_complete());
        assert!(d.flags().contains(DescFlags::LAST_SEGMENT));
    }

    #[test]
    fn mark_done_returns_ownership() {
        let mut d = Descriptor::armed(0x1000, 2048);
        d.mark_done(60);
        assert!(d.is_complete());
        assert_eq!(d.frame_len, 60);
        assert!(!d.is_device_owned());
    }

    #[test]
    fn rearm_clears_stale_done_bit() {
        let mut d = Descriptor::armed(0x1000, 2048);
        d.mark_done(128);
        d.mark_device_owned();
        assert!(d.is_device_owned());
        assert!(!d.is_done());
        assert!(d.flags().contains(DescFlags::LAST_SEGMENT));
    }

    #[test]
    fn zeroed_descriptor_is_host_owned_and_idle() {
        let d = Descriptor::zeroed();
        assert!(!d.is_device_owned());
        assert!(!d.is_complete());
    }

    #[test]
    fn desc_table_get_out_of_bounds() {
        let mut vec = vec![Descriptor::zeroed(); 4];
        let ptr = vec.as_mut_ptr();
        let table = unsafe { DescTable::from_raw_parts(ptr.addr() as u64, 4) };
        assert_eq!(table.desc_addr(0), Some(ptr.addr() as u64));
        assert_eq!(
            table.desc_addr(3),
            Some(ptr.addr() as u64 + 3 * Descriptor::SIZE as u64)
        );
        assert!(table.desc_addr(4).is_none());
    }

    #[test]
    fn query_size_is_sixteen_bytes_per_slot() {
        assert_eq!(DescTable::query_size(129), 129 * 16);
    }
}
