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
use std::time::{Duration, Instant};

use ringeth_common::dma::{Allocation, BufferProvider};
use ringeth_host::mem::DMA_SLOT_SIZE;
use ringeth_host::{BottomHalf, DmaRegion, EngineConfig, NetStack, RingEthDevice, RxFrame};
use ringeth_testing::SimNic;

pub type Nic = SimNic<Arc<DmaRegion>>;

/// A network stack that keeps every frame it is handed.
#[derive(Default)]
pub struct CollectingStack {
    frames: Mutex<Vec<Vec<u8>>>,
    resumed: Mutex<Vec<usize>>,
}

impl CollectingStack {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Rings passed to `resume_tx`, in call order.
    pub fn resumed(&self) -> Vec<usize> {
        self.resumed.lock().unwrap().clone()
    }
}

impl NetStack for CollectingStack {
    fn deliver_received_frame(&self, frame: RxFrame) {
        self.frames.lock().unwrap().push(frame.as_slice().to_vec());
    }

    fn resume_tx(&self, ring: usize) {
        self.resumed.lock().unwrap().push(ring);
    }
}

pub struct TestBed {
    pub device: RingEthDevice,
    pub nic: Arc<Nic>,
    pub stack: Arc<CollectingStack>,
    pub region: Arc<DmaRegion>,
}

impl TestBed {
    /// Take every free DMA slot so the next allocation fails.
    pub fn hog_region(&self) -> Vec<Allocation> {
        let mut hog = Vec::new();
        while let Ok(a) = self.region.alloc(DMA_SLOT_SIZE) {
            hog.push(a);
        }
        hog
    }

    pub fn release(&self, hog: Vec<Allocation>) {
        for a in hog {
            self.region.dealloc(a).unwrap();
        }
    }

    /// Block until the stack holds `n` frames or five seconds pass.
    pub fn wait_for_frames(&self, n: usize) -> usize {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.stack.frame_count() < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.stack.frame_count()
    }
}

/// Small rings driven from the test thread.
pub fn small_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.set_rx_ring_size(8);
    cfg.set_tx_ring_size(4);
    cfg.set_bottom_half(BottomHalf::Cooperative);
    cfg
}

/// A closed device on a fresh simulated NIC.
pub fn new_test_bed(cfg: EngineConfig) -> TestBed {
    let region = Arc::new(DmaRegion::new(cfg.dma_region_size()).unwrap());
    let nic = Arc::new(SimNic::new(region.clone()));
    let stack = Arc::new(CollectingStack::default());
    let device = RingEthDevice::with_region(
        cfg,
        region.clone(),
        nic.clone(),
        nic.clone(),
        stack.clone(),
    )
    .unwrap();
    TestBed {
        device,
        nic,
        stack,
        region,
    }
}

/// Runs a test with an open device using `cfg`.
pub fn with_device<F>(cfg: EngineConfig, f: F)
where
    F: FnOnce(&mut TestBed),
{
    let mut bed = new_test_bed(cfg);
    ringeth_host::NetDevice::open(&mut bed.device).unwrap();
    f(&mut bed);
}
