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

//! Bottom-half execution.
//!
//! A [`Scheduler`] drains the work queue, holds back worklets that asked to be
//! retried later and runs housekeeping every `tx_timeout`. It either owns a
//! worker thread or is driven by [`crate::NetDevice::poll`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::coordinator::{Next, WorkItem, Worklet};
use crate::engine::Engine;
use crate::{Result, RingEthError};

const WORKER_THREAD_NAME: &str = "ringeth-bh";

pub(crate) struct Scheduler {
    engine: Arc<Engine>,
    work: Receiver<WorkItem>,
    /// Worklets waiting for their retry backoff, with their deadline.
    deferred: Vec<(Instant, Worklet)>,
    next_housekeeping: Instant,
    housekeeping_interval: Duration,
    retry_backoff: Duration,
}

impl Scheduler {
    pub(crate) fn new(engine: Arc<Engine>, work: Receiver<WorkItem>) -> Self {
        let housekeeping_interval = engine.config().tx_timeout();
        let retry_backoff = engine.config().rx_retry_backoff();
        Self {
            engine,
            work,
            deferred: Vec::new(),
            next_housekeeping: Instant::now() + housekeeping_interval,
            housekeeping_interval,
            retry_backoff,
        }
    }

    fn dispatch(&mut self, w: Worklet) {
        match self.engine.run(w) {
            Ok(Some(Next::Later)) => {
                self.deferred
                    .push((Instant::now() + self.retry_backoff, w));
            }
            Ok(_) => {}
            Err(e) => log::error!("{} pass failed: {e}", w.name()),
        }
    }

    fn take_due(&mut self, now: Instant) -> Vec<Worklet> {
        let mut due = Vec::new();
        self.deferred.retain(|&(deadline, w)| {
            if deadline <= now {
                due.push(w);
                false
            } else {
                true
            }
        });
        due
    }

    fn housekeep_if_due(&mut self, now: Instant) -> Result<()> {
        if now < self.next_housekeeping {
            return Ok(());
        }
        self.next_housekeeping = now + self.housekeeping_interval;
        self.engine.housekeeping(now)
    }

    fn next_deadline(&self) -> Instant {
        self.deferred
            .iter()
            .map(|(deadline, _)| *deadline)
            .fold(self.next_housekeeping, Instant::min)
    }

    /// Run due work and up to `max_passes` queued worklets without blocking.
    pub(crate) fn poll(&mut self, max_passes: usize) -> Result<usize> {
        let now = Instant::now();
        self.housekeep_if_due(now)?;

        let mut passes = 0;
        for w in self.take_due(now) {
            self.dispatch(w);
            passes += 1;
        }
        while passes < max_passes {
            match self.work.try_recv() {
                Ok(WorkItem::Run(w)) => {
                    self.dispatch(w);
                    passes += 1;
                }
                Ok(WorkItem::Shutdown) | Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(RingEthError::WorkQueueClosed),
            }
        }
        Ok(passes)
    }

    fn run_worker(mut self) {
        log::debug!("bottom-half worker started");
        loop {
            let now = Instant::now();
            if let Err(e) = self.housekeep_if_due(now) {
                log::error!("housekeeping failed: {e}");
            }
            for w in self.take_due(now) {
                self.dispatch(w);
            }

            match self.work.recv_deadline(self.next_deadline()) {
                Ok(WorkItem::Run(w)) => self.dispatch(w),
                Ok(WorkItem::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        log::debug!("bottom-half worker stopped");
    }

    /// Move the scheduler onto its own thread.
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || self.run_worker())?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ringeth_common::dma::{Allocation, BufferProvider};
    use ringeth_common::irq::IntCause;

    use super::*;
    use crate::engine::tests::{Harness, config, harness};
    use crate::mem::DMA_SLOT_SIZE;

    fn scheduler(h: Harness) -> (Harness, Scheduler) {
        let s = Scheduler::new(h.engine.clone(), h.work.clone());
        (h, s)
    }

    fn hog(h: &Harness) -> Vec<Allocation> {
        let mut hog = Vec::new();
        while let Ok(a) = h.region.alloc(DMA_SLOT_SIZE) {
            hog.push(a);
        }
        hog
    }

    fn frame_count(h: &Harness) -> usize {
        h.stack.frames.lock().unwrap().len()
    }

    #[test]
    fn poll_runs_queued_worklets() {
        let (h, mut s) = scheduler(harness(config()));
        assert_eq!(s.poll(8).unwrap(), 0);

        assert!(h.nic.inject_rx(&[1; 64]));
        assert!(h.nic.inject_rx(&[2; 64]));
        h.engine.handle_interrupt();
        assert_eq!(s.poll(8).unwrap(), 1);
        assert_eq!(frame_count(&h), 2);
        assert!(h.nic.int_enable().contains(IntCause::RX_DONE));
    }

    #[test]
    fn poll_stops_after_max_passes() {
        let mut cfg = config();
        cfg.set_rx_budget(1);
        let (h, mut s) = scheduler(harness(cfg));
        for i in 0..3 {
            assert!(h.nic.inject_rx(&[i; 64]));
        }
        h.engine.handle_interrupt();

        assert_eq!(s.poll(2).unwrap(), 2);
        assert_eq!(frame_count(&h), 2);
        // third frame, then the pass that finds the ring drained
        assert_eq!(s.poll(8).unwrap(), 2);
        assert_eq!(frame_count(&h), 3);
    }

    #[test]
    fn failed_allocation_is_retried_after_backoff() {
        let mut cfg = config();
        cfg.set_rx_retry_backoff(Duration::ZERO);
        let (h, mut s) = scheduler(harness(cfg));
        let hogged = hog(&h);

        assert!(h.nic.inject_rx(&[1; 64]));
        assert!(h.nic.inject_rx(&[2; 64]));
        h.engine.handle_interrupt();
        assert_eq!(s.poll(8).unwrap(), 1);
        assert_eq!(frame_count(&h), 0);
        assert_eq!(h.stats.snapshot().rx_alloc_failures, 1);
        // still masked while the retry is pending
        assert!(!h.nic.int_enable().intersects(IntCause::RX_DONE));
        assert!(h.nic.rx_unarmed_slots().is_empty());

        for a in hogged {
            h.region.dealloc(a).unwrap();
        }
        assert_eq!(s.poll(8).unwrap(), 1);
        assert_eq!(*h.stack.frames.lock().unwrap(), vec![vec![2; 64]]);
        assert!(h.nic.int_enable().contains(IntCause::RX_DONE));
    }

    #[test]
    fn housekeeping_resets_a_wedged_ring() {
        let mut cfg = config();
        cfg.set_tx_timeout(Duration::from_millis(1));
        let (h, mut s) = scheduler(harness(cfg));
        h.engine.submit(0, &[1; 64]).unwrap();
        h.nic.wedge_tx(0, 1);

        std::thread::sleep(Duration::from_millis(5));
        s.poll(8).unwrap();
        let stats = h.stats.snapshot();
        assert_eq!(stats.wedge_events, 1);
        assert_eq!(stats.resets, 1);
    }

    #[test]
    fn worker_thread_drains_queue_until_shutdown() {
        let (h, s) = scheduler(harness(config()));
        let handle = s.spawn().unwrap();
        assert_eq!(handle.thread().name(), Some(WORKER_THREAD_NAME));

        assert!(h.nic.inject_rx(&[3; 64]));
        h.engine.handle_interrupt();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frame_count(&h) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(frame_count(&h), 1);

        h.engine.coordinator().shutdown();
        handle.join().unwrap();
    }
}
