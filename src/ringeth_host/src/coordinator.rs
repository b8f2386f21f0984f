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

//! Interrupt/poll coordination.
//!
//! Each worklet moves through `IDLE -> SCHEDULED -> RUNNING -> (IDLE | SCHEDULED)`.
//! Only the `IDLE -> SCHEDULED` edge queues a work item and masks the
//! worklet's interrupt causes, so interrupts arriving while work is already
//! queued or running are coalesced and every worklet has at most one item in
//! the queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError};
use ringeth_common::irq::IntCause;
use ringeth_common::regs::{self, RegisterIo};

use crate::config::PollMode;
use crate::{Result, RingEthError};

/// Depth of the bottom-half queue. At most two worklets plus a shutdown
/// request are ever queued.
pub(crate) const WORK_QUEUE_DEPTH: usize = 4;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;

/// A unit of bottom-half work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Worklet {
    /// Reclaim every TX ring, then drain RX.
    Napi,
    Rx,
    Tx,
}

impl Worklet {
    fn index(self) -> usize {
        match self {
            Worklet::Napi => 0,
            Worklet::Rx => 1,
            Worklet::Tx => 2,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Worklet::Napi => "napi",
            Worklet::Rx => "rx",
            Worklet::Tx => "tx",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WorkItem {
    Run(Worklet),
    Shutdown,
}

/// What a worklet wants after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Next {
    /// Drained: re-arm interrupts.
    Idle,
    /// Budget exhausted: run again right away, interrupts stay masked.
    Now,
    /// Starved for buffers: run again after a backoff, interrupts stay masked.
    Later,
}

/// Shadow of `INT_ENABLE`.
pub(crate) struct InterruptMask {
    regs: Arc<dyn RegisterIo>,
    enabled: Mutex<IntCause>,
}

impl InterruptMask {
    pub(crate) fn new(regs: Arc<dyn RegisterIo>) -> Self {
        Self {
            regs,
            enabled: Mutex::new(IntCause::empty()),
        }
    }

    fn update(&self, f: impl FnOnce(IntCause) -> IntCause) -> Result<IntCause> {
        self.update_if(|e| Some(f(e))).map(|(prev, _)| prev)
    }

    /// Apply `f` under the mask lock, writing the register only when it
    /// returns a new mask. Returns the previous mask and whether it was written.
    fn update_if(
        &self,
        f: impl FnOnce(IntCause) -> Option<IntCause>,
    ) -> Result<(IntCause, bool)> {
        let mut enabled = self.enabled.lock()?;
        let prev = *enabled;
        let Some(next) = f(prev) else {
            return Ok((prev, false));
        };
        *enabled = next;
        self.regs.write_register(regs::INT_ENABLE, next.bits());
        Ok((prev, true))
    }

    pub(crate) fn unmask(&self, causes: IntCause) -> Result<()> {
        self.update(|e| e | causes).map(|_| ())
    }

    /// Mask everything, returning what was enabled.
    pub(crate) fn mask_all(&self) -> Result<IntCause> {
        self.update(|_| IntCause::empty())
    }

    pub(crate) fn enabled(&self) -> Result<IntCause> {
        Ok(*self.enabled.lock()?)
    }
}

pub(crate) struct Coordinator {
    mode: PollMode,
    /// Causes the device is configured to raise.
    causes: IntCause,
    states: [AtomicU8; 3],
    queue: Sender<WorkItem>,
    mask: InterruptMask,
}

impl Coordinator {
    pub(crate) fn new(
        mode: PollMode,
        causes: IntCause,
        queue: Sender<WorkItem>,
        regs: Arc<dyn RegisterIo>,
    ) -> Self {
        Self {
            mode,
            causes,
            states: std::array::from_fn(|_| AtomicU8::new(IDLE)),
            queue,
            mask: InterruptMask::new(regs),
        }
    }

    pub(crate) fn worklets(&self) -> &'static [Worklet] {
        match self.mode {
            PollMode::Napi => &[Worklet::Napi],
            PollMode::Split => &[Worklet::Rx, Worklet::Tx],
        }
    }

    pub(crate) fn causes(&self) -> IntCause {
        self.causes
    }

    /// Interrupt causes serviced by `w`.
    pub(crate) fn causes_of(&self, w: Worklet) -> IntCause {
        match w {
            Worklet::Napi => self.causes,
            Worklet::Rx => self.causes & IntCause::rx_causes(),
            Worklet::Tx => self.causes & IntCause::tx_causes(),
        }
    }

    pub(crate) fn mask(&self) -> &InterruptMask {
        &self.mask
    }

    fn state(&self, w: Worklet) -> &AtomicU8 {
        &self.states[w.index()]
    }

    fn transition(&self, w: Worklet, from: u8, to: u8) -> bool {
        self.state(w)
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_idle(&self, w: Worklet) -> bool {
        self.state(w).load(Ordering::Acquire) == IDLE
    }

    fn send(&self, w: Worklet) -> Result<()> {
        match self.queue.try_send(WorkItem::Run(w)) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("cannot queue {} worklet: {e}", w.name());
                self.go_idle(w)?;
                Err(RingEthError::WorkQueueClosed)
            }
        }
    }

    /// Return `w` to idle and unmask its causes. Both happen under the mask
    /// lock so a concurrent [`Coordinator::raise`] either sees the worklet busy
    /// or masks after this unmask.
    fn go_idle(&self, w: Worklet) -> Result<()> {
        let causes = self.causes_of(w);
        self.mask
            .update_if(|e| {
                self.state(w).store(IDLE, Ordering::Release);
                Some(e | causes)
            })
            .map(|_| ())
    }

    /// Schedule `w` if it is idle. Returns false when the request was coalesced
    /// into work that is already scheduled or running.
    pub(crate) fn raise(&self, w: Worklet) -> Result<bool> {
        let causes = self.causes_of(w);
        let (_, scheduled) = self
            .mask
            .update_if(|e| self.transition(w, IDLE, SCHEDULED).then_some(e - causes))?;
        if !scheduled {
            return Ok(false);
        }
        self.send(w)?;
        Ok(true)
    }

    /// Claim a dequeued item. False means the item is stale and must be skipped.
    pub(crate) fn begin(&self, w: Worklet) -> bool {
        self.transition(w, SCHEDULED, RUNNING)
    }

    /// End a pass of `w`.
    pub(crate) fn finish(&self, w: Worklet, next: Next) -> Result<()> {
        match next {
            Next::Idle => self.go_idle(w),
            Next::Now => {
                self.state(w).store(SCHEDULED, Ordering::Release);
                self.send(w)
            }
            // the scheduler holds on to the item until the backoff expires
            Next::Later => {
                self.state(w).store(SCHEDULED, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Unmask the causes of every idle worklet, leaving busy ones masked.
    pub(crate) fn unmask_idle(&self) -> Result<()> {
        let causes = self
            .worklets()
            .iter()
            .filter(|w| self.is_idle(**w))
            .fold(IntCause::empty(), |acc, w| acc | self.causes_of(*w));
        self.mask.unmask(causes)
    }

    pub(crate) fn shutdown(&self) {
        match self.queue.try_send(WorkItem::Shutdown) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => log::error!("bottom-half queue full at shutdown"),
        }
    }
}
