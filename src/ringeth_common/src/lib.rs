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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub const PAGE_SIZE: usize = 0x1_000; // 4KB

extern crate alloc;

/// Descriptor rings shared between the host CPU and a DMA engine.
///
/// The host produces descriptors into a ring that lives in DMA-visible memory and
/// the device consumes them, flipping the ownership bits back once a transfer is
/// done. Everything here is agnostic of how that memory is obtained; see
/// [`dma::DmaMemory`] and [`dma::BufferProvider`].
pub mod dma;

/// Ethernet framing limits and the station address type.
pub mod frame;

/// Interrupt causes and the interrupt line abstraction.
pub mod irq;

/// The device register map and the [`regs::RegisterIo`] accessor trait.
pub mod regs;
