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

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use ringeth_common::frame::{MIN_MTU, MacAddress};
use ringeth_common::irq::{IrqLine, IntCause};
use ringeth_common::regs::RegisterIo;
use tracing::{Span, instrument};

use crate::bottom_half::Scheduler;
use crate::config::{BottomHalf, EngineConfig};
use crate::engine::Engine;
use crate::mem::DmaRegion;
use crate::rx::RxFrame;
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::{Result, RingEthError, new_error};

/// The network stack above the device.
pub trait NetStack: Send + Sync {
    /// Called once per received frame, in arrival order. Must not block.
    fn deliver_received_frame(&self, frame: RxFrame);

    /// A TX ring that rejected frames with backpressure has room again.
    fn resume_tx(&self, _ring: usize) {}
}

/// Operations a network stack performs on a device.
pub trait NetDevice {
    /// Allocate rings, start the bottom half and enable the device.
    fn open(&mut self) -> Result<()>;

    /// Stop the device and free every ring and buffer. No-op when closed.
    fn close(&mut self) -> Result<()>;

    /// Queue a frame on the default TX ring.
    fn submit(&self, frame: &[u8]) -> Result<()>;

    /// Run up to `max_passes` queued bottom-half passes on the calling thread.
    /// Returns the passes run; always 0 with a worker thread.
    fn poll(&self, max_passes: usize) -> Result<usize>;

    fn stats(&self) -> StatsSnapshot;
}

enum BottomHalfHandle {
    Worker(JoinHandle<()>),
    Cooperative(Mutex<Scheduler>),
}

struct Running {
    engine: Arc<Engine>,
    bottom_half: BottomHalfHandle,
}

/// A descriptor-ring Ethernet device.
pub struct RingEthDevice {
    config: EngineConfig,
    region: Arc<DmaRegion>,
    regs: Arc<dyn RegisterIo>,
    irq: Arc<dyn IrqLine>,
    stack: Arc<dyn NetStack>,
    stats: Arc<DeviceStats>,
    /// The region was allocated by [`RingEthDevice::new`] and may be regrown
    /// at open when the configuration outgrows it.
    owns_region: bool,
    running: Option<Running>,
}

impl RingEthDevice {
    /// Create a closed device with its own DMA region sized from `config`.
    pub fn new(
        config: EngineConfig,
        regs: Arc<dyn RegisterIo>,
        irq: Arc<dyn IrqLine>,
        stack: Arc<dyn NetStack>,
    ) -> Result<Self> {
        config.validate()?;
        let region = Arc::new(DmaRegion::new(config.dma_region_size())?);
        let mut dev = Self::with_region(config, region, regs, irq, stack)?;
        dev.owns_region = true;
        Ok(dev)
    }

    /// Create a closed device whose rings and buffers live in `region`.
    ///
    /// The region is used as given; sizing it for later MTU changes is up to
    /// the caller.
    pub fn with_region(
        mut config: EngineConfig,
        region: Arc<DmaRegion>,
        regs: Arc<dyn RegisterIo>,
        irq: Arc<dyn IrqLine>,
        stack: Arc<dyn NetStack>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.mac_address().is_some_and(|m| m.is_valid_unicast()) {
            let mac = MacAddress::with_fallback_prefix(rand::random());
            match config.mac_address() {
                Some(bad) => log::warn!("invalid MAC address {bad}, using {mac}"),
                None => log::warn!("no MAC address configured, using {mac}"),
            }
            config.set_mac_address(mac);
        }
        Ok(Self {
            config,
            region,
            regs,
            irq,
            stack,
            stats: Arc::new(DeviceStats::default()),
            owns_region: false,
            running: None,
        })
    }

    fn engine(&self) -> Result<&Arc<Engine>> {
        self.running
            .as_ref()
            .map(|r| &r.engine)
            .ok_or(RingEthError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The DMA region backing the rings.
    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// Queue a frame on TX ring `ring`.
    pub fn submit_to(&self, ring: usize, frame: &[u8]) -> Result<()> {
        self.engine()?.submit(ring, frame)
    }

    /// Reinitialize the rings of a running device.
    pub fn reset(&self) -> Result<()> {
        self.engine()?.reset()
    }

    /// Reclaim TX rings and run wedge detection now instead of waiting for the
    /// next housekeeping pass.
    pub fn check_health(&self) -> Result<()> {
        self.engine()?.housekeeping(Instant::now())
    }

    /// Interrupt causes currently unmasked.
    pub fn enabled_interrupts(&self) -> Result<IntCause> {
        self.engine()?.coordinator().mask().enabled()
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu()
    }

    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn set_mtu(&mut self, mtu: usize) -> Result<()> {
        if self.is_running() {
            return Err(RingEthError::DeviceBusy("change the MTU"));
        }
        let max = self.config.max_mtu();
        if !(MIN_MTU..=max).contains(&mtu) {
            return Err(RingEthError::InvalidMtu {
                mtu,
                min: MIN_MTU,
                max,
            });
        }
        self.config.set_mtu(mtu);
        Ok(())
    }

    /// Replace an owned region that is smaller than the current configuration
    /// needs, e.g. after a jumbo MTU was set. Frames still held by the stack
    /// keep the old region alive until they are dropped.
    fn grow_region(&mut self) -> Result<()> {
        let needed = self.config.dma_region_size();
        if !self.owns_region || self.region.len() >= needed {
            return Ok(());
        }
        log::debug!(
            "growing DMA region from {} to {needed} bytes",
            self.region.len()
        );
        self.region = Arc::new(DmaRegion::new(needed)?);
        Ok(())
    }

    pub fn mac_address(&self) -> Option<MacAddress> {
        self.config.mac_address()
    }

    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn set_mac_address(&mut self, mac: MacAddress) -> Result<()> {
        if self.is_running() {
            return Err(RingEthError::DeviceBusy("change the MAC address"));
        }
        if !mac.is_valid_unicast() {
            return Err(RingEthError::InvalidMacAddress(mac));
        }
        self.config.set_mac_address(mac);
        Ok(())
    }
}

impl NetDevice for RingEthDevice {
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn open(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(RingEthError::AlreadyOpen);
        }
        self.config.validate()?;
        self.grow_region()?;

        let (engine, work) = Engine::new(
            self.config,
            self.region.clone(),
            self.regs.clone(),
            self.stack.clone(),
            self.stats.clone(),
        )?;

        let fail = |engine: Arc<Engine>, e: RingEthError| -> RingEthError {
            engine.stop_dma();
            match Arc::try_unwrap(engine) {
                Ok(engine) => {
                    if let Err(te) = engine.teardown() {
                        log::error!("teardown after failed open: {te}");
                    }
                }
                Err(_) => log::error!("engine still referenced after failed open"),
            }
            e
        };

        if let Err(e) = engine.program() {
            return Err(fail(engine, e));
        }

        let weak = Arc::downgrade(&engine);
        let handler = Arc::new(move || {
            if let Some(engine) = weak.upgrade() {
                engine.handle_interrupt();
            }
        });
        if let Err(e) = self.irq.on_interrupt(handler) {
            return Err(fail(engine, e.into()));
        }

        let scheduler = Scheduler::new(engine.clone(), work);
        let bottom_half = match self.config.bottom_half() {
            BottomHalf::Worker => match scheduler.spawn() {
                Ok(handle) => BottomHalfHandle::Worker(handle),
                Err(e) => {
                    self.irq.free();
                    return Err(fail(engine, e));
                }
            },
            BottomHalf::Cooperative => BottomHalfHandle::Cooperative(Mutex::new(scheduler)),
        };

        if let Err(e) = engine.start() {
            self.running = Some(Running {
                engine,
                bottom_half,
            });
            if let Err(ce) = self.close() {
                log::warn!("close after failed start: {ce}");
            }
            return Err(e);
        }
        self.running = Some(Running {
            engine,
            bottom_half,
        });

        log::info!(
            "device up: mac {}, mtu {}, {} TX rings",
            self.config.mac_address().unwrap_or(MacAddress::ZERO),
            self.config.mtu(),
            self.config.tx_ring_count()
        );
        Ok(())
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    fn close(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let engine = running.engine;

        self.irq.free();
        engine.coordinator().mask().mask_all()?;

        match running.bottom_half {
            BottomHalfHandle::Worker(handle) => {
                engine.coordinator().shutdown();
                if handle.join().is_err() {
                    log::error!("bottom-half worker panicked");
                }
            }
            BottomHalfHandle::Cooperative(scheduler) => drop(scheduler),
        }

        engine.stop_dma();
        let engine = Arc::try_unwrap(engine)
            .map_err(|_| new_error!("ring engine still referenced at close"))?;
        engine.teardown()?;

        log::info!("device down");
        Ok(())
    }

    fn submit(&self, frame: &[u8]) -> Result<()> {
        self.submit_to(0, frame)
    }

    fn poll(&self, max_passes: usize) -> Result<usize> {
        let running = self.running.as_ref().ok_or(RingEthError::NotRunning)?;
        match &running.bottom_half {
            BottomHalfHandle::Worker(_) => Ok(0),
            BottomHalfHandle::Cooperative(scheduler) => scheduler.lock()?.poll(max_passes),
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for RingEthDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("close on drop failed: {e}");
        }
    }
}
