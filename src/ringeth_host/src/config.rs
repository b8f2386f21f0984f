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

use std::cmp::{max, min};
use std::time::Duration;

use ringeth_common::PAGE_SIZE;
use ringeth_common::dma::{DescTable, MAX_RING_CAPACITY};
use ringeth_common::frame::{
    MAX_JUMBO_MTU, MAX_MTU, MIN_FRAME_LEN, MIN_MTU, MacAddress, frame_len_for_mtu,
};
use ringeth_common::irq::IntCause;
use ringeth_common::regs::{DelayInterrupt, MAX_TX_RINGS};
use tracing::{Span, instrument};

use crate::mem::DMA_SLOT_SIZE;
use crate::{Result, RingEthError};

/// How interrupt causes are grouped into bottom-half worklets.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PollMode {
    /// One worklet reclaims every TX ring and then drains RX with the budget.
    #[default]
    Napi,
    /// Independent RX and TX worklets, each masking only its own causes.
    Split,
}

/// Where bottom-half worklets run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum BottomHalf {
    /// A dedicated worker thread.
    #[default]
    Worker,
    /// The caller drives work through [`crate::NetDevice::poll`].
    Cooperative,
}

/// The complete set of configuration needed to bring up a device
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Number of RX buffers the device can hold at once.
    rx_ring_size: usize,
    /// Number of frames each TX ring can hold in flight.
    tx_ring_size: usize,
    tx_ring_count: usize,
    /// Descriptors one RX pass may process before yielding.
    rx_budget: usize,
    // A backpressured TX ring accepts frames again once it has more free slots
    // than this.
    tx_wake_threshold: usize,
    poll_mode: PollMode,
    bottom_half: BottomHalf,
    /// Short frames are zero padded up to this length. `None` disables padding.
    min_frame_len: Option<usize>,
    jumbo_frames: bool,
    mtu: usize,
    mac_address: Option<MacAddress>,
    delay_interrupt: Option<DelayInterrupt>,
    /// Interval of the housekeeping pass and the stall time after which a TX
    /// ring counts as wedged.
    tx_timeout: Duration,
    /// Delay before an RX pass that could not get a buffer runs again.
    rx_retry_backoff: Duration,
    reset_on_wedge: bool,
    /// Size of the DMA region in bytes, 0 computes it from the ring sizes.
    dma_region_size: usize,
}

impl EngineConfig {
    /// The default number of RX descriptors
    pub const DEFAULT_RX_RING_SIZE: usize = 128;
    /// The default number of descriptors per TX ring
    pub const DEFAULT_TX_RING_SIZE: usize = 128;
    /// The minimum ring size
    pub const MIN_RING_SIZE: usize = 1;
    /// The maximum ring size, bounded by the 12 bit index registers
    pub const MAX_RING_SIZE: usize = MAX_RING_CAPACITY;
    /// The default number of TX rings
    pub const DEFAULT_TX_RING_COUNT: usize = 1;
    /// The maximum number of TX rings
    pub const MAX_TX_RING_COUNT: usize = MAX_TX_RINGS;
    /// The default RX budget per poll pass
    pub const DEFAULT_RX_BUDGET: usize = 64;
    /// The minimum RX budget per poll pass
    pub const MIN_RX_BUDGET: usize = 1;
    /// The maximum RX budget per poll pass
    pub const MAX_RX_BUDGET: usize = 1024;
    /// The default and minimum TX low-water mark
    pub const DEFAULT_TX_WAKE_THRESHOLD: usize = 2;
    /// The default housekeeping interval and wedge timeout
    pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_millis(20);
    /// The minimum housekeeping interval
    pub const MIN_TX_TIMEOUT: Duration = Duration::from_millis(1);
    /// The maximum housekeeping interval
    pub const MAX_TX_TIMEOUT: Duration = Duration::from_secs(10);
    /// The default RX allocation retry delay
    pub const DEFAULT_RX_RETRY_BACKOFF: Duration = Duration::from_millis(1);
    /// The maximum RX allocation retry delay
    pub const MAX_RX_RETRY_BACKOFF: Duration = Duration::from_secs(1);
    /// The default MTU
    pub const DEFAULT_MTU: usize = MAX_MTU;
    /// Pending-count limit of a delay interrupt
    pub const MAX_DELAY_PENDING: u8 = 0x7f;

    /// Set the number of RX descriptors, clamped to `MIN_RING_SIZE..=MAX_RING_SIZE`
    pub fn set_rx_ring_size(&mut self, rx_ring_size: usize) {
        self.rx_ring_size = rx_ring_size.clamp(Self::MIN_RING_SIZE, Self::MAX_RING_SIZE);
    }

    pub fn rx_ring_size(&self) -> usize {
        self.rx_ring_size
    }

    /// Set the number of descriptors per TX ring, clamped to
    /// `MIN_RING_SIZE..=MAX_RING_SIZE`. The wake threshold is clamped again.
    pub fn set_tx_ring_size(&mut self, tx_ring_size: usize) {
        self.tx_ring_size = tx_ring_size.clamp(Self::MIN_RING_SIZE, Self::MAX_RING_SIZE);
        self.set_tx_wake_threshold(self.tx_wake_threshold);
    }

    pub fn tx_ring_size(&self) -> usize {
        self.tx_ring_size
    }

    /// Set the number of TX rings, clamped to `1..=MAX_TX_RING_COUNT`
    pub fn set_tx_ring_count(&mut self, tx_ring_count: usize) {
        self.tx_ring_count = tx_ring_count.clamp(1, Self::MAX_TX_RING_COUNT);
    }

    pub fn tx_ring_count(&self) -> usize {
        self.tx_ring_count
    }

    /// Set the RX budget, clamped to `MIN_RX_BUDGET..=MAX_RX_BUDGET`
    pub fn set_rx_budget(&mut self, rx_budget: usize) {
        self.rx_budget = rx_budget.clamp(Self::MIN_RX_BUDGET, Self::MAX_RX_BUDGET);
    }

    pub fn rx_budget(&self) -> usize {
        self.rx_budget
    }

    /// Set the TX low-water mark. It is clamped to at least
    /// `DEFAULT_TX_WAKE_THRESHOLD` and at most the TX ring size, which is the
    /// largest number of free slots a ring can report.
    pub fn set_tx_wake_threshold(&mut self, tx_wake_threshold: usize) {
        self.tx_wake_threshold = min(
            max(tx_wake_threshold, Self::DEFAULT_TX_WAKE_THRESHOLD),
            max(self.tx_ring_size, Self::DEFAULT_TX_WAKE_THRESHOLD),
        );
    }

    pub fn tx_wake_threshold(&self) -> usize {
        self.tx_wake_threshold
    }

    pub fn set_poll_mode(&mut self, poll_mode: PollMode) {
        self.poll_mode = poll_mode;
    }

    pub fn poll_mode(&self) -> PollMode {
        self.poll_mode
    }

    pub fn set_bottom_half(&mut self, bottom_half: BottomHalf) {
        self.bottom_half = bottom_half;
    }

    pub fn bottom_half(&self) -> BottomHalf {
        self.bottom_half
    }

    /// Pad outbound frames shorter than `min_frame_len`, or never pad with `None`
    pub fn set_min_frame_len(&mut self, min_frame_len: Option<usize>) {
        self.min_frame_len = min_frame_len;
    }

    pub fn min_frame_len(&self) -> Option<usize> {
        self.min_frame_len
    }

    pub fn set_jumbo_frames(&mut self, jumbo_frames: bool) {
        self.jumbo_frames = jumbo_frames;
    }

    pub fn jumbo_frames(&self) -> bool {
        self.jumbo_frames
    }

    /// Set the MTU, clamped to `MIN_MTU..=MAX_JUMBO_MTU`. [`Self::validate`]
    /// rejects an MTU above `MAX_MTU` without jumbo frames.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu.clamp(MIN_MTU, MAX_JUMBO_MTU);
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest MTU accepted with the current jumbo frame setting
    pub fn max_mtu(&self) -> usize {
        if self.jumbo_frames {
            MAX_JUMBO_MTU
        } else {
            MAX_MTU
        }
    }

    /// Largest frame the device may receive or be asked to send
    pub fn max_frame_len(&self) -> usize {
        frame_len_for_mtu(self.mtu)
    }

    pub fn set_mac_address(&mut self, mac_address: MacAddress) {
        self.mac_address = Some(mac_address);
    }

    pub fn mac_address(&self) -> Option<MacAddress> {
        self.mac_address
    }

    /// Enable hardware interrupt coalescing for both directions
    pub fn set_delay_interrupt(&mut self, delay_interrupt: Option<DelayInterrupt>) {
        self.delay_interrupt = delay_interrupt;
    }

    pub fn delay_interrupt(&self) -> Option<DelayInterrupt> {
        self.delay_interrupt
    }

    /// Set the housekeeping interval. If set to 0 it is reset to
    /// `DEFAULT_TX_TIMEOUT`, otherwise clamped to `MIN_TX_TIMEOUT..=MAX_TX_TIMEOUT`.
    pub fn set_tx_timeout(&mut self, tx_timeout: Duration) {
        self.tx_timeout = match tx_timeout.as_nanos() {
            0 => Self::DEFAULT_TX_TIMEOUT,
            1.. => tx_timeout.clamp(Self::MIN_TX_TIMEOUT, Self::MAX_TX_TIMEOUT),
        };
    }

    pub fn tx_timeout(&self) -> Duration {
        self.tx_timeout
    }

    /// Set the RX allocation retry delay, at most `MAX_RX_RETRY_BACKOFF`
    pub fn set_rx_retry_backoff(&mut self, rx_retry_backoff: Duration) {
        self.rx_retry_backoff = rx_retry_backoff.min(Self::MAX_RX_RETRY_BACKOFF);
    }

    pub fn rx_retry_backoff(&self) -> Duration {
        self.rx_retry_backoff
    }

    pub fn set_reset_on_wedge(&mut self, reset_on_wedge: bool) {
        self.reset_on_wedge = reset_on_wedge;
    }

    pub fn reset_on_wedge(&self) -> bool {
        self.reset_on_wedge
    }

    /// Set the DMA region size in bytes. 0 sizes the region from the rings.
    pub fn set_dma_region_size(&mut self, dma_region_size: usize) {
        self.dma_region_size = dma_region_size;
    }

    /// Bytes of DMA memory the device needs: every descriptor table, a buffer per
    /// descriptor, and one RX budget worth of replacements for frames the stack
    /// still holds.
    pub fn dma_region_size(&self) -> usize {
        if self.dma_region_size != 0 {
            return self.dma_region_size;
        }
        let table = |capacity: usize| {
            DescTable::query_size(capacity + 1).next_multiple_of(DMA_SLOT_SIZE)
        };
        let buffer = self.max_frame_len().next_multiple_of(DMA_SLOT_SIZE);

        let rx = table(self.rx_ring_size) + (self.rx_ring_size + self.rx_budget) * buffer;
        let tx = self.tx_ring_count * (table(self.tx_ring_size) + self.tx_ring_size * buffer);
        (rx + tx).next_multiple_of(PAGE_SIZE)
    }

    /// Interrupt causes the device raises for this configuration
    pub fn enabled_causes(&self) -> IntCause {
        match self.delay_interrupt {
            Some(_) => IntCause::RX_DELAY | IntCause::TX_DELAY,
            None => IntCause::RX_DONE | IntCause::tx_done_rings(self.tx_ring_count),
        }
    }

    /// Reject combinations that cannot be brought up
    pub fn validate(&self) -> Result<()> {
        if self.mtu > self.max_mtu() {
            return Err(RingEthError::InvalidMtu {
                mtu: self.mtu,
                min: MIN_MTU,
                max: self.max_mtu(),
            });
        }
        if let Some(min_len) = self.min_frame_len
            && min_len > self.max_frame_len()
        {
            return Err(RingEthError::InvalidConfig(format!(
                "minimum frame length {min_len} exceeds the {} byte maximum",
                self.max_frame_len()
            )));
        }
        if let Some(delay) = self.delay_interrupt
            && (delay.max_pending == 0 || delay.max_pending > Self::MAX_DELAY_PENDING)
        {
            return Err(RingEthError::InvalidConfig(format!(
                "delay interrupt pending count {} is outside 1..={}",
                delay.max_pending,
                Self::MAX_DELAY_PENDING
            )));
        }
        if self.dma_region_size != 0 && self.dma_region_size < DMA_SLOT_SIZE {
            return Err(RingEthError::InvalidConfig(format!(
                "DMA region of {} bytes is smaller than one buffer slot",
                self.dma_region_size
            )));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rx_ring_size: Self::DEFAULT_RX_RING_SIZE,
            tx_ring_size: Self::DEFAULT_TX_RING_SIZE,
            tx_ring_count: Self::DEFAULT_TX_RING_COUNT,
            rx_budget: Self::DEFAULT_RX_BUDGET,
            tx_wake_threshold: Self::DEFAULT_TX_WAKE_THRESHOLD,
            poll_mode: PollMode::default(),
            bottom_half: BottomHalf::default(),
            min_frame_len: Some(MIN_FRAME_LEN),
            jumbo_frames: false,
            mtu: Self::DEFAULT_MTU,
            mac_address: None,
            delay_interrupt: None,
            tx_timeout: Self::DEFAULT_TX_TIMEOUT,
            rx_retry_backoff: Self::DEFAULT_RX_RETRY_BACKOFF,
            reset_on_wedge: true,
            dma_region_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use ringeth_common::frame::MAX_FRAME_LEN;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rx_ring_size(), 128);
        assert_eq!(cfg.tx_ring_size(), 128);
        assert_eq!(cfg.tx_ring_count(), 1);
        assert_eq!(cfg.rx_budget(), 64);
        assert_eq!(cfg.tx_wake_threshold(), 2);
        assert_eq!(cfg.poll_mode(), PollMode::Napi);
        assert_eq!(cfg.bottom_half(), BottomHalf::Worker);
        assert_eq!(cfg.min_frame_len(), Some(64));
        assert_eq!(cfg.max_frame_len(), MAX_FRAME_LEN);
        assert_eq!(cfg.tx_timeout(), Duration::from_millis(20));
        assert!(cfg.reset_on_wedge());
        cfg.validate().unwrap();
    }

    #[test]
    fn setters_clamp_into_range() {
        let mut cfg = EngineConfig::default();
        cfg.set_rx_ring_size(0);
        assert_eq!(cfg.rx_ring_size(), EngineConfig::MIN_RING_SIZE);
        cfg.set_tx_ring_size(100_000);
        assert_eq!(cfg.tx_ring_size(), EngineConfig::MAX_RING_SIZE);
        cfg.set_tx_ring_count(9);
        assert_eq!(cfg.tx_ring_count(), 4);
        cfg.set_rx_budget(0);
        assert_eq!(cfg.rx_budget(), 1);
        cfg.set_tx_timeout(Duration::ZERO);
        assert_eq!(cfg.tx_timeout(), EngineConfig::DEFAULT_TX_TIMEOUT);
        cfg.set_tx_timeout(Duration::from_secs(60));
        assert_eq!(cfg.tx_timeout(), EngineConfig::MAX_TX_TIMEOUT);
    }

    #[test]
    fn wake_threshold_follows_ring_size() {
        let mut cfg = EngineConfig::default();
        cfg.set_tx_wake_threshold(0);
        assert_eq!(cfg.tx_wake_threshold(), 2);
        cfg.set_tx_wake_threshold(64);
        assert_eq!(cfg.tx_wake_threshold(), 64);
        cfg.set_tx_ring_size(4);
        assert_eq!(cfg.tx_wake_threshold(), 4);
        cfg.set_tx_ring_size(1);
        assert_eq!(cfg.tx_wake_threshold(), 2);
    }

    #[test]
    fn jumbo_mtu_needs_jumbo_frames() {
        let mut cfg = EngineConfig::default();
        cfg.set_mtu(4000);
        assert!(matches!(
            cfg.validate(),
            Err(RingEthError::InvalidMtu { mtu: 4000, .. })
        ));
        cfg.set_jumbo_frames(true);
        cfg.validate().unwrap();
        assert_eq!(cfg.max_frame_len(), 4036);
    }

    #[test]
    fn region_size_covers_rings() {
        let mut cfg = EngineConfig::default();
        cfg.set_rx_ring_size(4);
        cfg.set_tx_ring_size(4);
        cfg.set_rx_budget(2);
        cfg.set_tx_ring_count(2);
        // rx: 1 table slot + 6 buffers, tx: 2 * (1 table slot + 4 buffers),
        // 17 slots rounded up to whole pages
        assert_eq!(cfg.dma_region_size(), 9 * PAGE_SIZE);
        cfg.set_dma_region_size(8192);
        assert_eq!(cfg.dma_region_size(), 8192);
    }

    #[test]
    fn delay_interrupts_switch_causes() {
        let mut cfg = EngineConfig::default();
        cfg.set_tx_ring_count(2);
        assert_eq!(
            cfg.enabled_causes(),
            IntCause::RX_DONE | IntCause::TX_DONE0 | IntCause::TX_DONE1
        );
        cfg.set_delay_interrupt(Some(DelayInterrupt {
            max_pending: 8,
            max_delay_us: 100,
        }));
        assert_eq!(cfg.enabled_causes(), IntCause::RX_DELAY | IntCause::TX_DELAY);

        cfg.set_delay_interrupt(Some(DelayInterrupt {
            max_pending: 0,
            max_delay_us: 100,
        }));
        assert!(matches!(cfg.validate(), Err(RingEthError::InvalidConfig(_))));
    }
}
