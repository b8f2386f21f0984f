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

//! Transmit engine.
//!
//! Frames are copied into a DMA buffer outside the ring lock, then published
//! at the head together with the doorbell write. Reclaim walks completed slots
//! from the tail in ring order and frees their buffers after the lock is
//! dropped.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ringeth_common::dma::{
    Allocation, BufferProvider, DescRing, Descriptor, DmaMemory, RingError,
};
use ringeth_common::regs::{self, RegisterIo};
use smallvec::SmallVec;

use crate::mem::DmaRegion;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::stats::DeviceStats;
use crate::{Result, RingEthError};

/// Free slots a ring must keep ahead of the producer: one for the frame being
/// queued and one as margin.
const MIN_FREE_SLOTS: usize = 2;

/// Outcome of one reclaim pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TxReclaim {
    pub(crate) reclaimed: usize,
    /// Backpressure was cleared; the producer should be told to resume.
    pub(crate) woke: bool,
}

struct TxState {
    ring: DescRing<Arc<DmaRegion>>,
    /// Buffer awaiting completion in each table slot.
    pending: Vec<Option<Allocation>>,
    backpressured: bool,
    /// Last time the tail moved, or the ring went from empty to busy.
    last_progress: Instant,
}

impl TxState {
    fn can_accept(&self) -> bool {
        !self.backpressured && self.ring.free_slots() >= MIN_FREE_SLOTS
    }

    fn take_pending(&mut self) -> Vec<Allocation> {
        self.pending.iter_mut().filter_map(Option::take).collect()
    }
}

/// One TX ring of a device.
pub(crate) struct TxRing {
    id: usize,
    state: Mutex<TxState>,
    region: Arc<DmaRegion>,
    regs: Arc<dyn RegisterIo>,
    stats: Arc<DeviceStats>,
    max_frame_len: usize,
    min_frame_len: Option<usize>,
    wake_threshold: usize,
}

impl TxRing {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        region: Arc<DmaRegion>,
        regs: Arc<dyn RegisterIo>,
        stats: Arc<DeviceStats>,
        capacity: usize,
        max_frame_len: usize,
        min_frame_len: Option<usize>,
        wake_threshold: usize,
    ) -> Result<Self> {
        let ring = DescRing::allocate(region.clone(), &*region, capacity).map_err(|e| match e {
            RingError::OutOfMemory => {
                RingEthError::OutOfMemory(format!("TX descriptor table of {capacity} slots"))
            }
            e => e.into(),
        })?;
        let pending = vec![None; ring.table_len()];
        Ok(Self {
            id,
            state: Mutex::new(TxState {
                ring,
                pending,
                backpressured: false,
                last_progress: Instant::now(),
            }),
            region,
            regs,
            stats,
            max_frame_len,
            min_frame_len,
            wake_threshold,
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Point the device at the table and publish the producer index.
    pub(crate) fn program(&self) -> Result<()> {
        let st = self.state.lock()?;
        self.program_locked(&st);
        Ok(())
    }

    fn program_locked(&self, st: &TxState) {
        let table = st.ring.table();
        self.regs.write_addr(
            regs::tx_base_lo(self.id),
            regs::tx_base_hi(self.id),
            table.base_addr(),
        );
        self.regs
            .write_register(regs::tx_max_cnt(self.id), table.len() as u32);
        self.regs.write_register(
            regs::tx_cpu_idx(self.id),
            st.ring.slot_index(st.ring.head()) as u32,
        );
    }

    fn reject_backpressure(&self) -> RingEthError {
        DeviceStats::inc(&self.stats.tx_backpressure);
        RingEthError::TxBackpressure { ring: self.id }
    }

    fn drop_frame(&self, reason: &'static str) {
        DeviceStats::inc(&self.stats.tx_dropped);
        CounterMetric::tx_dropped(reason, 1).emit();
    }

    /// Queue `frame` for transmission and ring the doorbell.
    pub(crate) fn submit(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_len {
            self.drop_frame("too_large");
            return Err(RingEthError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }
        // cheap early exit, re-checked once the buffer is ready
        if !self.state.lock()?.can_accept() {
            return Err(self.reject_backpressure());
        }

        let len = self.min_frame_len.map_or(frame.len(), |min| frame.len().max(min));
        let buf = match self.region.alloc(len) {
            Ok(buf) => buf,
            Err(source) => {
                tracing::debug!(ring = self.id, len, "cannot map TX frame: {source}");
                DeviceStats::inc(&self.stats.tx_errors);
                self.drop_frame("map");
                return Err(RingEthError::TxMapError { len, source });
            }
        };
        if let Err(e) = self.copy_in(buf, frame, len) {
            self.region.dealloc(buf)?;
            return Err(e);
        }

        let mut st = self.state.lock()?;
        if !st.can_accept() {
            drop(st);
            self.region.dealloc(buf)?;
            return Err(self.reject_backpressure());
        }
        if st.ring.is_empty() {
            st.last_progress = Instant::now();
        }
        let cursor = st.ring.produce(Descriptor::armed(buf.addr, len as u32))?;
        let slot = st.ring.slot_index(cursor);
        st.pending[slot] = Some(buf);
        self.regs.write_register(
            regs::tx_cpu_idx(self.id),
            st.ring.slot_index(st.ring.head()) as u32,
        );

        let stopped = st.ring.free_slots() < MIN_FREE_SLOTS;
        if stopped {
            st.backpressured = true;
        }
        drop(st);

        if stopped {
            log::warn!("TX ring {} full, stopping queue", self.id);
            CounterMetric::tx_backpressure(self.id).emit();
        }
        DeviceStats::inc(&self.stats.tx_packets);
        DeviceStats::add(&self.stats.tx_bytes, len as u64);
        Ok(())
    }

    fn copy_in(&self, buf: Allocation, frame: &[u8], len: usize) -> Result<()> {
        self.region.write(buf.addr, frame)?;
        if len > frame.len() {
            self.region
                .fill(buf.addr + frame.len() as u64, 0, len - frame.len())?;
        }
        Ok(())
    }

    /// Release the buffers of completed frames in ring order.
    pub(crate) fn reclaim(&self) -> Result<TxReclaim> {
        let mut freed: SmallVec<[Allocation; 16]> = SmallVec::new();
        let woke = {
            let mut st = self.state.lock()?;
            while !st.ring.is_empty() {
                let tail = st.ring.tail();
                if !st.ring.slot_at(tail)?.is_complete() {
                    break;
                }
                let slot = st.ring.slot_index(tail);
                // a completion without a pending frame is left for check_progress
                let Some(buf) = st.pending[slot].take() else {
                    break;
                };
                st.ring.consume()?;
                freed.push(buf);
            }
            if !freed.is_empty() {
                st.last_progress = Instant::now();
            }
            let woke = st.backpressured
                && (st.ring.free_slots() > self.wake_threshold || st.ring.is_empty());
            if woke {
                st.backpressured = false;
            }
            woke
        };

        self.region.dealloc_all(freed.iter().copied())?;
        DeviceStats::add(&self.stats.tx_reclaimed, freed.len() as u64);
        if woke {
            log::debug!("TX ring {} has room again, waking queue", self.id);
        }
        Ok(TxReclaim {
            reclaimed: freed.len(),
            woke,
        })
    }

    /// Is a completion waiting at the tail?
    pub(crate) fn has_pending(&self) -> Result<bool> {
        let st = self.state.lock()?;
        if st.ring.is_empty() {
            return Ok(false);
        }
        Ok(st.ring.slot_at(st.ring.tail())?.is_complete())
    }

    /// Report the ring as wedged when frames have been in flight without the
    /// tail moving for `timeout` and the device claims progress the host never
    /// sees: its DMA index is past the tail, or the tail slot is done with no
    /// frame behind it.
    pub(crate) fn check_progress(&self, now: Instant, timeout: Duration) -> Result<()> {
        let mut st = self.state.lock()?;
        if st.ring.is_empty() {
            st.last_progress = now;
            return Ok(());
        }
        let stuck_for = now.saturating_duration_since(st.last_progress);
        if stuck_for < timeout {
            return Ok(());
        }

        let tail = st.ring.tail();
        let slot = st.ring.slot_index(tail);
        let dma_idx = self.regs.read_register(regs::tx_dma_idx(self.id)) as usize;
        let orphan = st.ring.slot_at(tail)?.is_complete() && st.pending[slot].is_none();
        if dma_idx != slot || orphan {
            return Err(RingEthError::DeviceWedged {
                ring: self.id,
                pending: st.ring.in_flight(),
                stuck_for,
            });
        }
        Ok(())
    }

    /// Drop every pending frame and rewind the ring after the device indexes
    /// were reset. Returns whether the ring was backpressured.
    pub(crate) fn reset(&self) -> Result<bool> {
        let (dropped, was_stopped) = {
            let mut st = self.state.lock()?;
            let dropped = st.take_pending();
            st.ring.reset()?;
            let was_stopped = std::mem::take(&mut st.backpressured);
            st.last_progress = Instant::now();
            self.program_locked(&st);
            (dropped, was_stopped)
        };

        if !dropped.is_empty() {
            log::debug!("TX ring {} reset, dropped {} frames", self.id, dropped.len());
            DeviceStats::add(&self.stats.tx_dropped, dropped.len() as u64);
            CounterMetric::tx_dropped("reset", dropped.len() as u64).emit();
        }
        self.region.dealloc_all(dropped)?;
        Ok(was_stopped)
    }

    /// Free pending frames and the descriptor table. DMA must be stopped.
    pub(crate) fn teardown(self) -> Result<usize> {
        let mut st = self
            .state
            .into_inner()
            .map_err(|e| RingEthError::LockAttemptFailed(e.to_string()))?;
        let dropped = st.take_pending();
        let n = dropped.len();
        if n > 0 {
            DeviceStats::add(&self.stats.tx_dropped, n as u64);
            CounterMetric::tx_dropped("close", n as u64).emit();
        }
        let freed = self.region.dealloc_all(dropped);
        st.ring.release(&*self.region)?;
        freed.map(|()| n)
    }

    pub(crate) fn is_backpressured(&self) -> Result<bool> {
        Ok(self.state.lock()?.backpressured)
    }

    pub(crate) fn in_flight(&self) -> Result<usize> {
        Ok(self.state.lock()?.ring.in_flight())
    }
}
