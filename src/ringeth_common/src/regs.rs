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

//! Register map of the ringeth DMA block.
//!
//! Offsets are relative to the device's MMIO window. The layout is ours: one
//! global block, one RX ring block and up to four TX ring blocks.

use bitflags::bitflags;

/// Memory-mapped register access.
///
/// Accesses are side-effecting and must not be cached, merged or reordered by
/// the implementation. Implementations are shared between the interrupt top
/// half, the bottom half and frame producers, hence `Send + Sync`.
pub trait RegisterIo: Send + Sync {
    fn read_register(&self, offset: u32) -> u32;

    fn write_register(&self, offset: u32, value: u32);

    /// Read-modify-write setting `bits`.
    fn set_bits(&self, offset: u32, bits: u32) {
        let v = self.read_register(offset);
        self.write_register(offset, v | bits);
    }

    /// Read-modify-write clearing `bits`.
    fn clear_bits(&self, offset: u32, bits: u32) {
        let v = self.read_register(offset);
        self.write_register(offset, v & !bits);
    }

    /// Program a 64 bit bus address into a LO/HI register pair.
    fn write_addr(&self, lo: u32, hi: u32, addr: u64) {
        self.write_register(hi, (addr >> 32) as u32);
        self.write_register(lo, addr as u32);
    }

    fn read_addr(&self, lo: u32, hi: u32) -> u64 {
        (u64::from(self.read_register(hi)) << 32) | u64::from(self.read_register(lo))
    }
}

impl<R: RegisterIo + ?Sized> RegisterIo for alloc::sync::Arc<R> {
    fn read_register(&self, offset: u32) -> u32 {
        (**self).read_register(offset)
    }

    fn write_register(&self, offset: u32, value: u32) {
        (**self).write_register(offset, value)
    }
}

/// Pending interrupt causes, write one to clear.
pub const INT_STATUS: u32 = 0x000;
/// Unmasked interrupt causes.
pub const INT_ENABLE: u32 = 0x004;
pub const DMA_GLO_CFG: u32 = 0x008;
/// Writing a bit resets the matching ring's device index to zero.
pub const RST_IDX: u32 = 0x00c;
pub const DLY_INT_CFG: u32 = 0x010;
pub const MAC_ADDR_HI: u32 = 0x020;
pub const MAC_ADDR_LO: u32 = 0x024;

pub const RX_BASE_LO: u32 = 0x100;
pub const RX_BASE_HI: u32 = 0x104;
pub const RX_MAX_CNT: u32 = 0x108;
/// Host producer index: slots before it are armed.
pub const RX_CPU_IDX: u32 = 0x10c;
/// Device consumer index: the next slot the device fills.
pub const RX_DMA_IDX: u32 = 0x110;

/// Number of TX rings the block implements.
pub const MAX_TX_RINGS: usize = 4;

const TX_RING_BLOCK: u32 = 0x200;
const TX_RING_STRIDE: u32 = 0x20;

#[inline]
const fn tx_reg(ring: usize, off: u32) -> u32 {
    TX_RING_BLOCK + ring as u32 * TX_RING_STRIDE + off
}

pub const fn tx_base_lo(ring: usize) -> u32 {
    tx_reg(ring, 0x00)
}

pub const fn tx_base_hi(ring: usize) -> u32 {
    tx_reg(ring, 0x04)
}

pub const fn tx_max_cnt(ring: usize) -> u32 {
    tx_reg(ring, 0x08)
}

/// Doorbell: the host producer index of TX ring `ring`.
pub const fn tx_cpu_idx(ring: usize) -> u32 {
    tx_reg(ring, 0x0c)
}

/// Device consumer index of TX ring `ring`.
pub const fn tx_dma_idx(ring: usize) -> u32 {
    tx_reg(ring, 0x10)
}

/// Which TX ring a register offset belongs to, if any.
pub const fn tx_ring_of(offset: u32) -> Option<(usize, u32)> {
    if offset < TX_RING_BLOCK || offset >= TX_RING_BLOCK + MAX_TX_RINGS as u32 * TX_RING_STRIDE
    {
        return None;
    }
    let rel = offset - TX_RING_BLOCK;
    Some(((rel / TX_RING_STRIDE) as usize, rel % TX_RING_STRIDE))
}

bitflags! {
    /// `DMA_GLO_CFG` bits.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GloCfg: u32 {
        const TX_DMA_EN   = 1 << 0;
        const TX_DMA_BUSY = 1 << 1;
        const RX_DMA_EN   = 1 << 2;
        const RX_DMA_BUSY = 1 << 3;
    }
}

bitflags! {
    /// `RST_IDX` bits.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RstIdx: u32 {
        const TX0 = 1 << 0;
        const TX1 = 1 << 1;
        const TX2 = 1 << 2;
        const TX3 = 1 << 3;
        const RX  = 1 << 16;
    }
}

impl RstIdx {
    /// Reset bits for the first `rings` TX rings.
    pub fn tx_rings(rings: usize) -> Self {
        RstIdx::from_bits_truncate((1u32 << rings.min(MAX_TX_RINGS)) - 1)
    }
}

/// Hardware interrupt coalescing for one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DelayInterrupt {
    /// Raise the interrupt once this many completions are pending (1..=127).
    pub max_pending: u8,
    /// Or once the oldest completion waited this long, in microseconds.
    pub max_delay_us: u32,
}

impl DelayInterrupt {
    /// Delay granularity of the hardware timer.
    pub const DELAY_UNIT_US: u32 = 20;

    /// Encode as one 16 bit half of `DLY_INT_CFG`:
    /// bits 0-7 delay in 20 us units, bits 8-14 pending count, bit 15 enable.
    pub fn encode(&self) -> u16 {
        let units = (self.max_delay_us / Self::DELAY_UNIT_US).clamp(1, 0xff) as u16;
        let pending = u16::from(self.max_pending.clamp(1, 0x7f));
        (1 << 15) | (pending << 8) | units
    }

    /// `DLY_INT_CFG` value with RX in the low half and TX in the high half.
    pub fn register_value(rx: Option<DelayInterrupt>, tx: Option<DelayInterrupt>) -> u32 {
        let rx = rx.map(|d| d.encode()).unwrap_or(0);
        let tx = tx.map(|d| d.encode()).unwrap_or(0);
        (u32::from(tx) << 16) | u32::from(rx)
    }
}
