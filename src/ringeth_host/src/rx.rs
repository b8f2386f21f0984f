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

//! Receive engine.
//!
//! The RX ring is kept full: every one of its `capacity` slots holds an armed
//! buffer. A poll pass walks completed slots from the tail and, for each one,
//! swaps in a fresh buffer at the head in the same critical section, so the
//! slot just consumed becomes the sentinel and the ring never runs dry.
//!
//! ```text
//!   before:  [ C | A | A | A | . ]      C complete, A armed, . sentinel
//!              t               h
//!   after:   [ . | A | A | A | A ]      old buffer of C delivered upward
//!                  t           h
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ringeth_common::dma::{Allocation, BufferProvider, DescRing, Descriptor, RingError};
use ringeth_common::regs::{self, RegisterIo};
use tracing::{Span, instrument};

use crate::device::NetStack;
use crate::mem::DmaRegion;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::stats::DeviceStats;
use crate::{Result, RingEthError};

/// A received frame. Its buffer goes back to the DMA pool when dropped.
pub struct RxFrame {
    region: Arc<DmaRegion>,
    buf: Allocation,
    len: usize,
}

impl RxFrame {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer was detached from the ring before the frame was
        // built, so neither the device nor the engine writes it any more.
        unsafe { self.region.slice(self.buf.addr, self.len) }.unwrap_or(&[])
    }

    /// Copy the payload out so the DMA buffer can be returned early.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }
}

impl AsRef<[u8]> for RxFrame {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for RxFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxFrame")
            .field("addr", &format_args!("{:#x}", self.buf.addr))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for RxFrame {
    fn drop(&mut self) {
        if let Err(e) = self.region.dealloc(self.buf) {
            log::error!("failed to return RX buffer {:#x}: {e}", self.buf.addr);
        }
    }
}

/// Outcome of one RX poll pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxPoll {
    /// Completed descriptors handled, delivered or dropped.
    pub processed: usize,
    /// The pass stopped at a slot the device still owns.
    pub drained: bool,
    /// A replacement buffer could not be allocated.
    pub retry: bool,
}

impl RxPoll {
    pub fn needs_reschedule(&self) -> bool {
        self.retry || !self.drained
    }
}

pub(crate) struct RxState {
    ring: DescRing<Arc<DmaRegion>>,
    /// Buffer bound to each table slot.
    bufs: Vec<Option<Allocation>>,
    generation: u64,
}

impl RxState {
    /// Move the buffer of the tail slot to the head, re-armed with `fresh` or,
    /// when `fresh` is None, with the buffer it already had. Returns the buffer
    /// that left the ring.
    fn rotate(
        &mut self,
        fresh: Option<Allocation>,
        buf_len: u32,
        io: &dyn RegisterIo,
    ) -> Result<Option<Allocation>> {
        let cursor = self.ring.consume()?;
        let old = self.bufs[self.ring.slot_index(cursor)].take();
        let (armed, detached) = match fresh {
            Some(fresh) => (Some(fresh), old),
            None => (old, None),
        };
        let Some(armed) = armed else {
            return Err(RingEthError::Error(format!(
                "RX slot {} has no buffer bound",
                self.ring.slot_index(cursor)
            )));
        };

        let head = self.ring.produce(Descriptor::armed(armed.addr, buf_len))?;
        self.bufs[self.ring.slot_index(head)] = Some(armed);
        io.write_register(regs::RX_CPU_IDX, self.ring.slot_index(self.ring.head()) as u32);
        Ok(detached)
    }
}

/// The receive side of one device.
pub(crate) struct RxRing {
    state: Mutex<RxState>,
    region: Arc<DmaRegion>,
    regs: Arc<dyn RegisterIo>,
    stats: Arc<DeviceStats>,
    /// Length of each RX buffer, which is also the largest acceptable frame.
    buf_len: usize,
}

impl RxRing {
    pub(crate) fn new(
        region: Arc<DmaRegion>,
        regs: Arc<dyn RegisterIo>,
        stats: Arc<DeviceStats>,
        capacity: usize,
        buf_len: usize,
    ) -> Result<Self> {
        let ring = DescRing::allocate(region.clone(), &*region, capacity).map_err(|e| match e {
            RingError::OutOfMemory => {
                RingEthError::OutOfMemory(format!("RX descriptor table of {capacity} slots"))
            }
            e => e.into(),
        })?;
        let bufs = vec![None; ring.table_len()];
        Ok(Self {
            state: Mutex::new(RxState {
                ring,
                bufs,
                generation: 0,
            }),
            region,
            regs,
            stats,
            buf_len,
        })
    }

    /// Arm every slot with a fresh buffer.
    ///
    /// Buffers are allocated before the ring is touched; if any allocation
    /// fails they are all returned and the ring stays empty.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn prefill(&self) -> Result<()> {
        let capacity = self.state.lock()?.ring.capacity();
        let mut fresh = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match self.region.alloc(self.buf_len) {
                Ok(buf) => fresh.push(buf),
                Err(e) => {
                    if let Err(free_err) = self.region.dealloc_all(fresh) {
                        log::error!("failed to return RX prefill buffers: {free_err}");
                    }
                    return Err(RingEthError::OutOfMemory(format!(
                        "RX prefill of {capacity} buffers: {e}"
                    )));
                }
            }
        }

        let mut st = self.state.lock()?;
        for buf in fresh {
            let cursor = st.ring.produce(Descriptor::armed(buf.addr, self.buf_len as u32))?;
            let slot = st.ring.slot_index(cursor);
            st.bufs[slot] = Some(buf);
        }
        log::debug!("RX ring prefilled with {capacity} buffers");
        Ok(())
    }

    /// Point the device at the table and publish the producer index.
    pub(crate) fn program(&self) -> Result<()> {
        let st = self.state.lock()?;
        let table = st.ring.table();
        self.regs
            .write_addr(regs::RX_BASE_LO, regs::RX_BASE_HI, table.base_addr());
        self.regs
            .write_register(regs::RX_MAX_CNT, table.len() as u32);
        self.regs.write_register(
            regs::RX_CPU_IDX,
            st.ring.slot_index(st.ring.head()) as u32,
        );
        Ok(())
    }

    /// Is a completed frame waiting at the tail?
    pub(crate) fn has_pending(&self) -> Result<bool> {
        let st = self.state.lock()?;
        if st.ring.is_empty() {
            return Ok(false);
        }
        Ok(st.ring.slot_at(st.ring.tail())?.is_complete())
    }

    /// Deliver up to `budget` completed frames to `stack` in ring order.
    pub(crate) fn poll(&self, budget: usize, stack: &dyn NetStack) -> Result<RxPoll> {
        let mut res = RxPoll::default();

        while res.processed < budget {
            let (cursor, desc, generation) = {
                let st = self.state.lock()?;
                if st.ring.is_empty() {
                    res.drained = true;
                    break;
                }
                let cursor = st.ring.tail();
                let desc = st.ring.slot_at(cursor)?;
                if !desc.is_complete() {
                    res.drained = true;
                    break;
                }
                (cursor, desc, st.generation)
            };
            res.processed += 1;

            let len = desc.frame_len as usize;
            if len == 0 || len > self.buf_len {
                let err = RingEthError::RxFrameError {
                    len,
                    max: self.buf_len,
                };
                tracing::debug!(cursor, len, "dropping RX frame: {err}");
                DeviceStats::inc(&self.stats.rx_errors);
                DeviceStats::inc(&self.stats.rx_length_errors);
                CounterMetric::rx_dropped("length").emit();
                if !self.commit(cursor, generation, None, stack)? {
                    break;
                }
                continue;
            }

            match self.region.alloc(self.buf_len) {
                Ok(fresh) => {
                    if !self.commit(cursor, generation, Some((fresh, len)), stack)? {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("RX buffer allocation failed, dropping frame: {e}");
                    DeviceStats::inc(&self.stats.rx_dropped);
                    DeviceStats::inc(&self.stats.rx_alloc_failures);
                    CounterMetric::rx_dropped("alloc").emit();
                    self.commit(cursor, generation, None, stack)?;
                    res.retry = true;
                    break;
                }
            }
        }

        Ok(res)
    }

    /// Rotate the slot at `cursor` and deliver its old buffer when `fresh`
    /// replaces it. Returns false if the ring was reset since `cursor` was read;
    /// `fresh` is then freed and nothing is delivered.
    fn commit(
        &self,
        cursor: u64,
        generation: u64,
        fresh: Option<(Allocation, usize)>,
        stack: &dyn NetStack,
    ) -> Result<bool> {
        let detached = {
            let mut st = self.state.lock()?;
            if st.generation != generation || st.ring.tail() != cursor {
                None
            } else {
                Some(st.rotate(fresh.map(|(buf, _)| buf), self.buf_len as u32, &*self.regs)?)
            }
        };

        let Some(detached) = detached else {
            tracing::debug!(cursor, "RX ring reset during poll, abandoning pass");
            if let Some((buf, _)) = fresh {
                self.region.dealloc(buf)?;
            }
            return Ok(false);
        };

        if let (Some(buf), Some((_, len))) = (detached, fresh) {
            DeviceStats::inc(&self.stats.rx_packets);
            DeviceStats::add(&self.stats.rx_bytes, len as u64);
            stack.deliver_received_frame(RxFrame {
                region: self.region.clone(),
                buf,
                len,
            });
        }
        Ok(true)
    }

    /// Re-arm every bound buffer after the device indexes were reset.
    ///
    /// The caller has stopped RX DMA. Frames that completed but were not polled
    /// are lost.
    pub(crate) fn reset(&self) -> Result<()> {
        let mut st = self.state.lock()?;
        let bound: Vec<Allocation> = st.bufs.iter_mut().filter_map(Option::take).collect();
        st.ring.reset()?;
        st.generation += 1;
        for buf in bound {
            let cursor = st.ring.produce(Descriptor::armed(buf.addr, self.buf_len as u32))?;
            let slot = st.ring.slot_index(cursor);
            st.bufs[slot] = Some(buf);
        }
        drop(st);
        self.program()
    }

    /// Free every buffer and the descriptor table. DMA must be stopped.
    pub(crate) fn teardown(self) -> Result<()> {
        let st = self
            .state
            .into_inner()
            .map_err(|e| RingEthError::LockAttemptFailed(e.to_string()))?;
        let freed = self.region.dealloc_all(st.bufs.into_iter().flatten());
        st.ring.release(&*self.region)?;
        freed
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.ring.head(), st.ring.tail())
    }
}
