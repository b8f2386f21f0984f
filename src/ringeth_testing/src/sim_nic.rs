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

//! A software model of the ringeth DMA block.
//!
//! [`SimNic`] implements [`RegisterIo`] and [`IrqLine`] on top of any
//! [`DmaMemory`], so the host engine can be driven without hardware. Device
//! activity is explicit: tests call [`SimNic::inject_rx`] or
//! [`SimNic::complete_tx`] to make the "hardware" move, and the interrupt
//! handler runs synchronously on the calling thread when an unmasked cause is
//! pending. Register writes never invoke the handler.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use ringeth_common::dma::{DescFlags, Descriptor, DmaMemory};
use ringeth_common::irq::{IntCause, IrqError, IrqHandler, IrqLine};
use ringeth_common::regs::{self, GloCfg, MAX_TX_RINGS, RegisterIo, RstIdx};

/// Size of the modelled register window in bytes.
const REG_WINDOW: usize = 0x280;

/// Enable bit of one `DLY_INT_CFG` half.
const DELAY_ENABLE: u32 = 1 << 15;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Simulated NIC sharing `mem` with the host.
pub struct SimNic<M> {
    mem: M,
    regs: [AtomicU32; REG_WINDOW / 4],
    handler: Mutex<Option<IrqHandler>>,
    // held for reading while the handler runs so free() can wait it out
    handler_gate: RwLock<()>,
    transmitted: [Mutex<Vec<Vec<u8>>>; MAX_TX_RINGS],
    tx_doorbells: [AtomicU64; MAX_TX_RINGS],
    rx_doorbells: AtomicU64,
    interrupts: AtomicU64,
    rx_missed: AtomicU64,
}

impl<M: DmaMemory + Send + Sync> SimNic<M> {
    pub fn new(mem: M) -> Self {
        Self {
            mem,
            regs: std::array::from_fn(|_| AtomicU32::new(0)),
            handler: Mutex::new(None),
            handler_gate: RwLock::new(()),
            transmitted: std::array::from_fn(|_| Mutex::new(Vec::new())),
            tx_doorbells: std::array::from_fn(|_| AtomicU64::new(0)),
            rx_doorbells: AtomicU64::new(0),
            interrupts: AtomicU64::new(0),
            rx_missed: AtomicU64::new(0),
        }
    }

    fn reg(&self, offset: u32) -> Option<&AtomicU32> {
        if !offset.is_multiple_of(4) {
            return None;
        }
        self.regs.get(offset as usize / 4)
    }

    fn load(&self, offset: u32) -> u32 {
        self.reg(offset).map_or(0, |r| r.load(Ordering::SeqCst))
    }

    fn store(&self, offset: u32, value: u32) {
        if let Some(r) = self.reg(offset) {
            r.store(value, Ordering::SeqCst);
        }
    }

    /// Store a producer index. Only a write that moves the index is a doorbell;
    /// rewriting the value the device already holds (as ring programming does
    /// after an index reset) is not.
    fn publish(&self, offset: u32, value: u32) -> bool {
        self.reg(offset)
            .is_some_and(|r| r.swap(value, Ordering::SeqCst) != value)
    }

    fn glo_cfg(&self) -> GloCfg {
        GloCfg::from_bits_truncate(self.load(regs::DMA_GLO_CFG))
    }

    fn delay_enabled(&self, tx: bool) -> bool {
        let cfg = self.load(regs::DLY_INT_CFG);
        let half = if tx { cfg >> 16 } else { cfg };
        half & DELAY_ENABLE != 0
    }

    fn desc_addr(&self, base: u64, idx: u32) -> u64 {
        base + u64::from(idx) * Descriptor::SIZE as u64
    }

    fn read_desc(&self, addr: u64) -> Option<Descriptor> {
        Descriptor::read_acquire(&self.mem, addr).ok()
    }

    /// Latch `cause` in `INT_STATUS` and assert the line if it is unmasked.
    pub fn raise(&self, cause: IntCause) {
        if let Some(r) = self.reg(regs::INT_STATUS) {
            r.fetch_or(cause.bits(), Ordering::SeqCst);
        }
        if self.int_status().intersects(self.int_enable()) {
            self.fire();
        }
    }

    /// Run the handler regardless of the enable mask, as a spurious or shared
    /// interrupt would.
    pub fn force_interrupt(&self) {
        self.fire();
    }

    fn fire(&self) {
        let _gate = self.handler_gate.read().unwrap_or_else(|e| e.into_inner());
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            handler();
        }
    }

    /// Receive `frame` into the next device-owned RX slot.
    ///
    /// Returns false, counting a missed frame, when RX DMA is off or the host
    /// has no buffer armed.
    pub fn inject_rx(&self, frame: &[u8]) -> bool {
        self.receive(|mem, desc| {
            let n = frame.len().min(desc.len as usize);
            mem.write(desc.addr, &frame[..n]).ok()?;
            Some(frame.len() as u16)
        })
    }

    /// Complete the next RX slot claiming `frame_len` bytes without writing data.
    pub fn inject_rx_bad_len(&self, frame_len: u16) -> bool {
        self.receive(|_, _| Some(frame_len))
    }

    fn receive(&self, fill: impl FnOnce(&M, &Descriptor) -> Option<u16>) -> bool {
        let done = self.try_receive(fill).is_some();
        if done {
            let cause = if self.delay_enabled(false) {
                IntCause::RX_DELAY
            } else {
                IntCause::RX_DONE
            };
            self.raise(cause);
        } else {
            self.rx_missed.fetch_add(1, Ordering::SeqCst);
        }
        done
    }

    fn try_receive(&self, fill: impl FnOnce(&M, &Descriptor) -> Option<u16>) -> Option<()> {
        if !self.glo_cfg().contains(GloCfg::RX_DMA_EN) {
            return None;
        }
        let count = self.load(regs::RX_MAX_CNT);
        let dma = self.load(regs::RX_DMA_IDX);
        if count == 0 || dma == self.load(regs::RX_CPU_IDX) {
            return None;
        }

        let base = self.read_addr(regs::RX_BASE_LO, regs::RX_BASE_HI);
        let addr = self.desc_addr(base, dma);
        let mut desc = self.read_desc(addr)?;
        if !desc.is_device_owned() {
            return None;
        }
        let frame_len = fill(&self.mem, &desc)?;
        desc.mark_done(frame_len);
        desc.write_release(&self.mem, addr).ok()?;
        self.store(regs::RX_DMA_IDX, (dma + 1) % count);
        Some(())
    }

    /// Transmit up to `max` queued frames from TX ring `ring`.
    ///
    /// Returns how many frames went out. Raises the ring's completion cause when
    /// any did.
    pub fn complete_tx(&self, ring: usize, max: usize) -> usize {
        let sent = self.walk_tx(ring, max, true);
        if sent > 0 {
            let cause = if self.delay_enabled(true) {
                IntCause::TX_DELAY
            } else {
                IntCause::tx_done(ring)
            };
            self.raise(cause);
        }
        sent
    }

    /// Advance the TX DMA index past up to `max` frames without completing
    /// their descriptors or raising an interrupt, like a DMA engine that lost
    /// its completion writes.
    pub fn wedge_tx(&self, ring: usize, max: usize) -> usize {
        self.walk_tx(ring, max, false)
    }

    fn walk_tx(&self, ring: usize, max: usize, complete: bool) -> usize {
        if ring >= MAX_TX_RINGS || !self.glo_cfg().contains(GloCfg::TX_DMA_EN) {
            return 0;
        }
        let count = self.load(regs::tx_max_cnt(ring));
        if count == 0 {
            return 0;
        }
        let base = self.read_addr(regs::tx_base_lo(ring), regs::tx_base_hi(ring));
        let cpu = self.load(regs::tx_cpu_idx(ring));
        let mut dma = self.load(regs::tx_dma_idx(ring));

        let mut sent = 0;
        while sent < max && dma != cpu {
            if complete {
                let addr = self.desc_addr(base, dma);
                let Some(mut desc) = self.read_desc(addr) else {
                    break;
                };
                if !desc.is_device_owned() {
                    break;
                }
                let mut frame = vec![0u8; desc.len as usize];
                if self.mem.read(desc.addr, &mut frame).is_err() {
                    break;
                }
                desc.mark_done(desc.len as u16);
                if desc.write_release(&self.mem, addr).is_err() {
                    break;
                }
                lock(&self.transmitted[ring]).push(frame);
            }
            dma = (dma + 1) % count;
            sent += 1;
        }
        self.store(regs::tx_dma_idx(ring), dma);
        sent
    }

    /// Frames transmitted on `ring` since the last call.
    pub fn take_transmitted(&self, ring: usize) -> Vec<Vec<u8>> {
        self.transmitted
            .get(ring)
            .map(|t| std::mem::take(&mut *lock(t)))
            .unwrap_or_default()
    }

    /// Frames queued on `ring` that the device has not consumed yet.
    pub fn tx_queued(&self, ring: usize) -> usize {
        let count = self.load(regs::tx_max_cnt(ring));
        if count == 0 {
            return 0;
        }
        let cpu = self.load(regs::tx_cpu_idx(ring));
        let dma = self.load(regs::tx_dma_idx(ring));
        ((cpu + count - dma) % count) as usize
    }

    /// RX buffers currently armed for the device.
    pub fn rx_armed(&self) -> usize {
        let count = self.load(regs::RX_MAX_CNT);
        if count == 0 {
            return 0;
        }
        let cpu = self.load(regs::RX_CPU_IDX);
        let dma = self.load(regs::RX_DMA_IDX);
        ((cpu + count - dma) % count) as usize
    }

    /// Every RX descriptor between the DMA and CPU index that is not armed.
    pub fn rx_unarmed_slots(&self) -> Vec<u32> {
        let count = self.load(regs::RX_MAX_CNT);
        let base = self.read_addr(regs::RX_BASE_LO, regs::RX_BASE_HI);
        let cpu = self.load(regs::RX_CPU_IDX);
        let mut idx = self.load(regs::RX_DMA_IDX);
        let mut bad = Vec::new();
        while count != 0 && idx != cpu {
            let armed = self
                .read_desc(self.desc_addr(base, idx))
                .is_some_and(|d| d.flags().contains(DescFlags::DEVICE_OWNED) && d.addr != 0);
            if !armed {
                bad.push(idx);
            }
            idx = (idx + 1) % count;
        }
        bad
    }

    pub fn tx_doorbells(&self, ring: usize) -> u64 {
        self.tx_doorbells
            .get(ring)
            .map_or(0, |d| d.load(Ordering::SeqCst))
    }

    pub fn rx_doorbells(&self) -> u64 {
        self.rx_doorbells.load(Ordering::SeqCst)
    }

    /// Times the handler ran.
    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Frames the device could not place for lack of an armed buffer.
    pub fn rx_missed(&self) -> u64 {
        self.rx_missed.load(Ordering::SeqCst)
    }

    pub fn int_enable(&self) -> IntCause {
        IntCause::from_bits_truncate(self.load(regs::INT_ENABLE))
    }

    pub fn int_status(&self) -> IntCause {
        IntCause::from_bits_truncate(self.load(regs::INT_STATUS))
    }

    pub fn dma_enabled(&self) -> bool {
        self.glo_cfg().contains(GloCfg::TX_DMA_EN | GloCfg::RX_DMA_EN)
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.handler).is_some()
    }

    pub fn mem(&self) -> &M {
        &self.mem
    }
}

impl<M: DmaMemory + Send + Sync> RegisterIo for SimNic<M> {
    fn read_register(&self, offset: u32) -> u32 {
        self.load(offset)
    }

    fn write_register(&self, offset: u32, value: u32) {
        match offset {
            regs::INT_STATUS => {
                if let Some(r) = self.reg(offset) {
                    r.fetch_and(!value, Ordering::SeqCst);
                }
            }
            regs::RST_IDX => {
                let rst = RstIdx::from_bits_truncate(value);
                for ring in 0..MAX_TX_RINGS {
                    if rst.contains(RstIdx::from_bits_truncate(1 << ring)) {
                        self.store(regs::tx_dma_idx(ring), 0);
                        self.store(regs::tx_cpu_idx(ring), 0);
                    }
                }
                if rst.contains(RstIdx::RX) {
                    self.store(regs::RX_DMA_IDX, 0);
                    self.store(regs::RX_CPU_IDX, 0);
                }
            }
            regs::RX_DMA_IDX => {}
            regs::RX_CPU_IDX => {
                if self.publish(offset, value) {
                    self.rx_doorbells.fetch_add(1, Ordering::SeqCst);
                }
            }
            _ => match regs::tx_ring_of(offset) {
                Some((ring, _)) if offset == regs::tx_dma_idx(ring) => {}
                Some((ring, _)) if offset == regs::tx_cpu_idx(ring) => {
                    if self.publish(offset, value)
                        && let Some(d) = self.tx_doorbells.get(ring)
                    {
                        d.fetch_add(1, Ordering::SeqCst);
                    }
                }
                _ => self.store(offset, value),
            },
        }
    }
}

impl<M: DmaMemory + Send + Sync> IrqLine for SimNic<M> {
    fn on_interrupt(&self, handler: IrqHandler) -> Result<(), IrqError> {
        let mut slot = lock(&self.handler);
        if slot.is_some() {
            return Err(IrqError::Busy);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn free(&self) {
        lock(&self.handler).take();
        // wait for a handler that is still running
        drop(self.handler_gate.write().unwrap_or_else(|e| e.into_inner()));
    }
}
