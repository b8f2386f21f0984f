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

//! The ring engine of one open device: rings, coordinator, top half and the
//! bottom-half passes.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, bounded};
use ringeth_common::irq::IntCause;
use ringeth_common::regs::{self, DelayInterrupt, GloCfg, RegisterIo, RstIdx};
use tracing::{Span, instrument};

use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, Next, WORK_QUEUE_DEPTH, WorkItem, Worklet};
use crate::device::NetStack;
use crate::mem::DmaRegion;
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::rx::RxRing;
use crate::stats::DeviceStats;
use crate::tx::TxRing;
use crate::{Result, RingEthError};

const DMA_EN: GloCfg = GloCfg::TX_DMA_EN.union(GloCfg::RX_DMA_EN);

pub(crate) struct Engine {
    config: EngineConfig,
    regs: Arc<dyn RegisterIo>,
    stack: Arc<dyn NetStack>,
    stats: Arc<DeviceStats>,
    rx: RxRing,
    tx: Vec<TxRing>,
    coord: Coordinator,
}

impl Engine {
    /// Allocate every ring and prefill RX. On failure everything allocated so
    /// far goes back to the region.
    pub(crate) fn new(
        config: EngineConfig,
        region: Arc<DmaRegion>,
        regs: Arc<dyn RegisterIo>,
        stack: Arc<dyn NetStack>,
        stats: Arc<DeviceStats>,
    ) -> Result<(Arc<Self>, Receiver<WorkItem>)> {
        let max_frame_len = config.max_frame_len();
        let rx = RxRing::new(
            region.clone(),
            regs.clone(),
            stats.clone(),
            config.rx_ring_size(),
            max_frame_len,
        )?;

        let mut tx = Vec::with_capacity(config.tx_ring_count());
        for id in 0..config.tx_ring_count() {
            let ring = TxRing::new(
                id,
                region.clone(),
                regs.clone(),
                stats.clone(),
                config.tx_ring_size(),
                max_frame_len,
                config.min_frame_len(),
                config.tx_wake_threshold(),
            );
            match ring {
                Ok(ring) => tx.push(ring),
                Err(e) => {
                    release(rx, tx);
                    return Err(e);
                }
            }
        }
        if let Err(e) = rx.prefill() {
            release(rx, tx);
            return Err(e);
        }

        let (queue, work) = bounded(WORK_QUEUE_DEPTH);
        let coord = Coordinator::new(config.poll_mode(), config.enabled_causes(), queue, regs.clone());
        let engine = Arc::new(Self {
            config,
            regs,
            stack,
            stats,
            rx,
            tx,
            coord,
        });
        Ok((engine, work))
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.coord
    }

    /// Write ring, station address and delay interrupt registers.
    pub(crate) fn program(&self) -> Result<()> {
        self.rx.program()?;
        for ring in &self.tx {
            ring.program()?;
        }
        if let Some(mac) = self.config.mac_address() {
            let (hi, lo) = mac.to_register_pair();
            self.regs.write_register(regs::MAC_ADDR_HI, hi);
            self.regs.write_register(regs::MAC_ADDR_LO, lo);
        }
        let delay = self.config.delay_interrupt();
        self.regs.write_register(
            regs::DLY_INT_CFG,
            DelayInterrupt::register_value(delay, delay),
        );
        Ok(())
    }

    /// Clear stale causes, enable DMA and unmask interrupts.
    pub(crate) fn start(&self) -> Result<()> {
        self.regs
            .write_register(regs::INT_STATUS, self.coord.causes().bits());
        self.regs.set_bits(regs::DMA_GLO_CFG, DMA_EN.bits());
        self.coord.unmask_idle()
    }

    /// Stop DMA and force the device indexes back to zero so the host owns
    /// every descriptor.
    pub(crate) fn stop_dma(&self) {
        self.regs.clear_bits(regs::DMA_GLO_CFG, DMA_EN.bits());
        let rst = RstIdx::tx_rings(self.tx.len()) | RstIdx::RX;
        self.regs.write_register(regs::RST_IDX, rst.bits());
    }

    pub(crate) fn submit(&self, ring: usize, frame: &[u8]) -> Result<()> {
        let tx = self.tx.get(ring).ok_or(RingEthError::NoSuchRing(ring))?;
        tx.submit(frame)
    }

    /// Top half: acknowledge the pending causes and schedule their worklets.
    pub(crate) fn handle_interrupt(&self) {
        let status = IntCause::from_bits_truncate(self.regs.read_register(regs::INT_STATUS));
        let handled = status & self.coord.causes();
        if handled.is_empty() {
            return;
        }
        self.regs.write_register(regs::INT_STATUS, handled.bits());
        DeviceStats::inc(&self.stats.interrupts);

        for &w in self.coord.worklets() {
            if !handled.intersects(self.coord.causes_of(w)) {
                continue;
            }
            match self.coord.raise(w) {
                Ok(true) => {}
                Ok(false) => DeviceStats::inc(&self.stats.coalesced_interrupts),
                Err(e) => log::error!("interrupt could not schedule {}: {e}", w.name()),
            }
        }
    }

    /// Run one bottom-half pass of `w`. Returns None for a stale work item.
    pub(crate) fn run(&self, w: Worklet) -> Result<Option<Next>> {
        if !self.coord.begin(w) {
            return Ok(None);
        }
        DeviceStats::inc(&self.stats.poll_passes);

        let next = match HistogramMetric::time_poll(w.name(), || self.pass(w)) {
            Ok(next) => next,
            Err(e) => {
                self.coord.finish(w, Next::Idle)?;
                return Err(e);
            }
        };
        if next != Next::Idle {
            tracing::trace!(worklet = w.name(), ?next, "rescheduling");
            DeviceStats::inc(&self.stats.poll_reschedules);
            CounterMetric::poll_reschedule(w.name()).emit();
        }
        self.coord.finish(w, next)?;

        // completions that landed between the last check and the unmask
        // raised no interrupt
        if next == Next::Idle && self.has_work(w)? {
            self.coord.raise(w)?;
        }
        Ok(Some(next))
    }

    fn pass(&self, w: Worklet) -> Result<Next> {
        match w {
            Worklet::Napi => {
                self.reclaim_all()?;
                self.poll_rx()
            }
            Worklet::Rx => self.poll_rx(),
            Worklet::Tx => {
                self.reclaim_all()?;
                Ok(Next::Idle)
            }
        }
    }

    fn poll_rx(&self) -> Result<Next> {
        let res = self.rx.poll(self.config.rx_budget(), &*self.stack)?;
        Ok(if res.retry {
            Next::Later
        } else if res.needs_reschedule() {
            Next::Now
        } else {
            Next::Idle
        })
    }

    fn reclaim_all(&self) -> Result<usize> {
        let mut reclaimed = 0;
        for ring in &self.tx {
            let res = ring.reclaim()?;
            reclaimed += res.reclaimed;
            if res.woke {
                self.stack.resume_tx(ring.id());
            }
        }
        Ok(reclaimed)
    }

    fn has_work(&self, w: Worklet) -> Result<bool> {
        let tx_pending = || -> Result<bool> {
            for ring in &self.tx {
                if ring.has_pending()? {
                    return Ok(true);
                }
            }
            Ok(false)
        };
        match w {
            Worklet::Napi => Ok(self.rx.has_pending()? || tx_pending()?),
            Worklet::Rx => self.rx.has_pending(),
            Worklet::Tx => tx_pending(),
        }
    }

    /// Periodic pass: reclaim every TX ring and look for wedged rings.
    ///
    /// A wedged ring is logged and counted; with `reset_on_wedge` the rings are
    /// reset, otherwise the error is returned.
    pub(crate) fn housekeeping(&self, now: Instant) -> Result<()> {
        self.reclaim_all()?;

        let mut wedged = None;
        for ring in &self.tx {
            match ring.check_progress(now, self.config.tx_timeout()) {
                Ok(()) => {}
                Err(e @ RingEthError::DeviceWedged { .. }) => {
                    log::error!("{e}");
                    DeviceStats::inc(&self.stats.wedge_events);
                    CounterMetric::device_wedged(ring.id()).emit();
                    wedged.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match wedged {
            Some(_) if self.config.reset_on_wedge() => self.reset(),
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reinitialize every ring. Pending TX frames are dropped, RX keeps its
    /// buffers.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub(crate) fn reset(&self) -> Result<()> {
        let mask = self.coord.mask();
        mask.mask_all()?;
        self.stop_dma();

        let mut stopped = Vec::new();
        for ring in &self.tx {
            if ring.reset()? {
                stopped.push(ring.id());
            }
        }
        self.rx.reset()?;

        self.start()?;
        DeviceStats::inc(&self.stats.resets);
        CounterMetric::device_reset().emit();
        log::info!("rings reset, {} TX rings resumed", stopped.len());

        for id in stopped {
            self.stack.resume_tx(id);
        }
        Ok(())
    }

    /// Free every buffer and descriptor table. DMA must be stopped.
    pub(crate) fn teardown(self) -> Result<()> {
        let Self { rx, tx, .. } = self;
        let mut first_err = None;
        for ring in tx {
            if let Err(e) = ring.teardown() {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = rx.teardown() {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    #[cfg(test)]
    pub(crate) fn tx_ring(&self, ring: usize) -> Option<&TxRing> {
        self.tx.get(ring)
    }
}

fn release(rx: RxRing, tx: Vec<TxRing>) {
    for ring in tx {
        if let Err(e) = ring.teardown() {
            log::error!("failed to release TX ring: {e}");
        }
    }
    if let Err(e) = rx.teardown() {
        log::error!("failed to release RX ring: {e}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use ringeth_common::dma::BufferProvider;
    use ringeth_testing::SimNic;

    use super::*;
    use crate::config::PollMode;
    use crate::rx::RxFrame;

    #[derive(Default)]
    pub(crate) struct Collect {
        pub(crate) frames: Mutex<Vec<Vec<u8>>>,
        pub(crate) resumed: Mutex<Vec<usize>>,
    }

    impl NetStack for Collect {
        fn deliver_received_frame(&self, frame: RxFrame) {
            self.frames.lock().unwrap().push(frame.as_slice().to_vec());
        }

        fn resume_tx(&self, ring: usize) {
            self.resumed.lock().unwrap().push(ring);
        }
    }

    pub(crate) struct Harness {
        pub(crate) region: Arc<DmaRegion>,
        pub(crate) nic: Arc<SimNic<Arc<DmaRegion>>>,
        pub(crate) stack: Arc<Collect>,
        pub(crate) stats: Arc<DeviceStats>,
        pub(crate) engine: Arc<Engine>,
        pub(crate) work: Receiver<WorkItem>,
    }

    pub(crate) fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.set_rx_ring_size(8);
        cfg.set_tx_ring_size(4);
        cfg
    }

    pub(crate) fn harness(config: EngineConfig) -> Harness {
        let region = Arc::new(DmaRegion::new(config.dma_region_size()).unwrap());
        harness_in(config, region)
    }

    pub(crate) fn harness_in(config: EngineConfig, region: Arc<DmaRegion>) -> Harness {
        let nic = Arc::new(SimNic::new(region.clone()));
        let stack = Arc::new(Collect::default());
        let stats = Arc::new(DeviceStats::default());
        let (engine, work) = Engine::new(
            config,
            region.clone(),
            nic.clone(),
            stack.clone(),
            stats.clone(),
        )
        .unwrap();
        engine.program().unwrap();
        engine.start().unwrap();
        Harness {
            region,
            nic,
            stack,
            stats,
            engine,
            work,
        }
    }

    fn next_item(h: &Harness) -> Option<Worklet> {
        match h.work.try_recv() {
            Ok(WorkItem::Run(w)) => Some(w),
            _ => None,
        }
    }

    #[test]
    fn interrupt_schedules_once_and_masks_its_causes() {
        let h = harness(config());
        assert!(h.nic.int_enable().contains(IntCause::RX_DONE));

        assert!(h.nic.inject_rx(&[1; 60]));
        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), Some(Worklet::Napi));
        assert!(!h.nic.int_enable().intersects(IntCause::RX_DONE));
        assert!(h.nic.int_status().is_empty());

        // a second interrupt while scheduled is folded into the pending pass
        assert!(h.nic.inject_rx(&[2; 60]));
        h.nic.raise(IntCause::RX_DONE);
        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), None);

        assert_eq!(h.engine.run(Worklet::Napi).unwrap(), Some(Next::Idle));
        assert_eq!(*h.stack.frames.lock().unwrap(), vec![vec![1; 60], vec![2; 60]]);
        assert!(h.nic.int_enable().contains(IntCause::RX_DONE));

        let stats = h.stats.snapshot();
        assert_eq!(stats.interrupts, 2);
        assert_eq!(stats.coalesced_interrupts, 1);
        assert_eq!(stats.poll_passes, 1);
    }

    #[test]
    fn stale_work_item_is_skipped() {
        let h = harness(config());
        assert_eq!(h.engine.run(Worklet::Napi).unwrap(), None);
        assert_eq!(h.stats.snapshot().poll_passes, 0);
    }

    #[test]
    fn exhausted_budget_reschedules_without_unmasking() {
        let mut cfg = config();
        cfg.set_rx_budget(2);
        let h = harness(cfg);
        for i in 0..5 {
            assert!(h.nic.inject_rx(&[i; 64]));
        }
        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), Some(Worklet::Napi));

        assert_eq!(h.engine.run(Worklet::Napi).unwrap(), Some(Next::Now));
        assert!(!h.nic.int_enable().intersects(IntCause::RX_DONE));
        assert_eq!(next_item(&h), Some(Worklet::Napi));
        assert_eq!(h.engine.run(Worklet::Napi).unwrap(), Some(Next::Now));
        assert_eq!(next_item(&h), Some(Worklet::Napi));
        assert_eq!(h.engine.run(Worklet::Napi).unwrap(), Some(Next::Idle));
        assert_eq!(next_item(&h), None);

        let frames = h.stack.frames.lock().unwrap();
        let firsts: Vec<u8> = frames.iter().map(|f| f[0]).collect();
        assert_eq!(firsts, vec![0, 1, 2, 3, 4]);
        assert_eq!(h.stats.snapshot().poll_reschedules, 2);
    }

    #[test]
    fn tx_completion_is_reclaimed_by_the_bottom_half() {
        let h = harness(config());
        h.engine.submit(0, &[7; 100]).unwrap();
        assert_eq!(h.nic.tx_doorbells(0), 1);
        assert_eq!(h.nic.complete_tx(0, 8), 1);
        assert_eq!(h.nic.take_transmitted(0), vec![vec![7; 100]]);

        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), Some(Worklet::Napi));
        h.engine.run(Worklet::Napi).unwrap();
        assert_eq!(h.engine.tx_ring(0).unwrap().in_flight().unwrap(), 0);
        assert_eq!(h.stats.snapshot().tx_reclaimed, 1);
    }

    #[test]
    fn submit_to_unknown_ring_fails() {
        let h = harness(config());
        assert!(matches!(
            h.engine.submit(3, &[0; 64]),
            Err(RingEthError::NoSuchRing(3))
        ));
    }

    #[test]
    fn split_mode_masks_only_the_raised_direction() {
        let mut cfg = config();
        cfg.set_poll_mode(PollMode::Split);
        let h = harness(cfg);

        assert!(h.nic.inject_rx(&[1; 64]));
        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), Some(Worklet::Rx));
        assert_eq!(next_item(&h), None);
        assert!(!h.nic.int_enable().intersects(IntCause::RX_DONE));
        assert!(h.nic.int_enable().contains(IntCause::tx_done(0)));

        h.engine.submit(0, &[2; 64]).unwrap();
        h.nic.complete_tx(0, 1);
        h.engine.handle_interrupt();
        assert_eq!(next_item(&h), Some(Worklet::Tx));

        assert_eq!(h.engine.run(Worklet::Tx).unwrap(), Some(Next::Idle));
        assert_eq!(h.engine.run(Worklet::Rx).unwrap(), Some(Next::Idle));
        assert_eq!(h.stack.frames.lock().unwrap().len(), 1);
        assert_eq!(h.nic.int_enable(), h.engine.coordinator().causes());
    }

    #[test]
    fn wedged_ring_is_reported() {
        let mut cfg = config();
        cfg.set_reset_on_wedge(false);
        let h = harness(cfg);
        h.engine.submit(0, &[1; 64]).unwrap();
        assert_eq!(h.nic.wedge_tx(0, 1), 1);

        h.engine.housekeeping(Instant::now()).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(matches!(
            h.engine.housekeeping(later),
            Err(RingEthError::DeviceWedged { ring: 0, pending: 1, .. })
        ));
        let stats = h.stats.snapshot();
        assert_eq!(stats.wedge_events, 1);
        assert_eq!(stats.resets, 0);
    }

    #[test]
    fn wedged_ring_is_reset() {
        let h = harness(config());
        h.engine.submit(0, &[1; 64]).unwrap();
        h.nic.wedge_tx(0, 1);

        h.engine
            .housekeeping(Instant::now() + Duration::from_secs(60))
            .unwrap();
        let stats = h.stats.snapshot();
        assert_eq!(stats.wedge_events, 1);
        assert_eq!(stats.resets, 1);
        assert_eq!(stats.tx_dropped, 1);
        assert_eq!(h.engine.tx_ring(0).unwrap().in_flight().unwrap(), 0);
        assert!(h.nic.dma_enabled());

        // the ring works again after the reset
        h.engine.submit(0, &[2; 64]).unwrap();
        assert_eq!(h.nic.complete_tx(0, 1), 1);
        assert_eq!(h.nic.take_transmitted(0), vec![vec![2; 64]]);
    }

    #[test]
    fn reset_resumes_stopped_rings() {
        let h = harness(config());
        for _ in 0..4 {
            h.engine.submit(0, &[0; 64]).unwrap();
        }
        assert!(h.engine.tx_ring(0).unwrap().is_backpressured().unwrap());

        h.engine.reset().unwrap();
        assert!(!h.engine.tx_ring(0).unwrap().is_backpressured().unwrap());
        assert_eq!(*h.stack.resumed.lock().unwrap(), vec![0]);
        assert_eq!(h.nic.rx_armed(), 8);
    }

    #[test]
    fn teardown_returns_every_buffer() {
        let cfg = config();
        let region = Arc::new(DmaRegion::new(cfg.dma_region_size()).unwrap());
        let free = region.free_bytes();
        let h = harness_in(cfg, region);
        h.engine.submit(0, &[0; 64]).unwrap();
        assert!(h.nic.inject_rx(&[0; 64]));

        h.engine.stop_dma();
        let Harness { engine, region, .. } = h;
        let engine = Arc::try_unwrap(engine).ok().unwrap();
        engine.teardown().unwrap();
        assert_eq!(region.free_bytes(), free);
    }
}
