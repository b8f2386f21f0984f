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

//! DMA Memory Access
//!
//! The [`DmaMemory`] trait is the only way ring and engine code touches memory the
//! device can see. A real port implements it over a coherent mapping, tests and
//! device models implement it over plain heap memory.

use bytemuck::Pod;

/// Backend-provided access to DMA-visible memory.
///
/// Addresses are bus addresses as programmed into descriptors and ring base
/// registers. Implementations translate them to host pointers.
///
/// # Safety
///
/// Implementations must ensure that:
/// - accesses stay inside the region the implementation owns
/// - `load_acquire`/`store_release` are real atomic accesses, since the device side
///   polls the same words concurrently
/// - unaligned or out-of-range addresses are reported as errors, never dereferenced
pub trait DmaMemory {
    type Error;

    /// Copy `dst.len()` bytes starting at `addr` into `dst`.
    ///
    /// Returns the number of bytes copied.
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Copy `src` into memory starting at `addr`.
    ///
    /// Returns the number of bytes copied.
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Fill `len` bytes starting at `addr` with `byte`.
    fn fill(&self, addr: u64, byte: u8, len: usize) -> Result<(), Self::Error> {
        let chunk = [byte; 64];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            self.write(addr + done as u64, &chunk[..n])?;
            done += n;
        }
        Ok(())
    }

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must be 2-byte aligned. This is how the host observes descriptor
    /// flags written by the device.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must be 2-byte aligned. Everything written before this store is
    /// visible to the device once it observes the new value.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Read a Pod value at `addr`.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error>
    where
        Self: Sized,
    {
        let mut val = T::zeroed();
        self.read(addr, bytemuck::bytes_of_mut(&mut val))?;
        Ok(val)
    }

    /// Write a Pod value at `addr`.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error>
    where
        Self: Sized,
    {
        self.write(addr, bytemuck::bytes_of(&val))?;
        Ok(())
    }
}

impl<M: DmaMemory> DmaMemory for alloc::sync::Arc<M> {
    type Error = M::Error;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(addr, src)
    }

    fn fill(&self, addr: u64, byte: u8, len: usize) -> Result<(), Self::Error> {
        (**self).fill(addr, byte, len)
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        (**self).load_acquire(addr)
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        (**self).store_release(addr, val)
    }
}
