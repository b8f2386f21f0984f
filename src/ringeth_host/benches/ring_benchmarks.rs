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

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ringeth_host::{
    BottomHalf, DmaRegion, EngineConfig, NetDevice, NetStack, RingEthDevice, RxFrame,
};
use ringeth_testing::SimNic;

struct Sink;

impl NetStack for Sink {
    fn deliver_received_frame(&self, frame: RxFrame) {
        black_box(frame.len());
    }
}

fn open_device(ring_size: usize) -> (RingEthDevice, Arc<SimNic<Arc<DmaRegion>>>) {
    let mut cfg = EngineConfig::default();
    cfg.set_rx_ring_size(ring_size);
    cfg.set_tx_ring_size(ring_size);
    cfg.set_bottom_half(BottomHalf::Cooperative);

    let region = Arc::new(DmaRegion::new(cfg.dma_region_size()).unwrap());
    let nic = Arc::new(SimNic::new(region.clone()));
    let mut dev =
        RingEthDevice::with_region(cfg, region, nic.clone(), nic.clone(), Arc::new(Sink)).unwrap();
    dev.open().unwrap();
    (dev, nic)
}

// Submit a burst, let the device send it, reclaim in one pass
fn bench_tx_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("tx_burst");

    for burst in [1usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), burst, |b, &burst| {
            let (dev, nic) = open_device(256);
            let frame = [0x5au8; 1514];
            b.iter(|| {
                for _ in 0..burst {
                    dev.submit(black_box(&frame)).unwrap();
                }
                nic.complete_tx(0, burst);
                nic.take_transmitted(0);
                dev.poll(8).unwrap();
            });
        });
    }
    group.finish();
}

// Frames injected by the device, delivered by one bottom-half pass
fn bench_rx_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("rx_burst");

    for burst in [1usize, 16, 64].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), burst, |b, &burst| {
            let (dev, nic) = open_device(256);
            let frame = [0xa5u8; 1514];
            b.iter(|| {
                for _ in 0..burst {
                    nic.inject_rx(black_box(&frame));
                }
                dev.poll(8).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tx_burst, bench_rx_burst);
criterion_main!(benches);
