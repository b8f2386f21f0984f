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
//! Host-side driver core for a descriptor-ring Ethernet DMA engine.
//!
//! [`RingEthDevice`] owns one RX ring and one or more TX rings in a
//! [`DmaRegion`], services the device interrupt with a short top half and
//! defers ring work to a bottom half that runs either on its own worker
//! thread or on the caller via [`NetDevice::poll`].

/// Bottom-half scheduling of poll passes
pub(crate) mod bottom_half;
/// Engine configuration and its defaults
pub mod config;
/// Interrupt masking and worklet state
pub(crate) mod coordinator;
/// The device object and the traits the network stack sees
pub mod device;
/// Rings, doorbells and the top half wired together
pub(crate) mod engine;
/// Errors returned by this crate
pub mod error;
/// DMA-visible memory
pub mod mem;
/// Metric definitions
pub(crate) mod metrics;
/// The receive ring and received frames
pub mod rx;
/// Device counters
pub mod stats;
/// The transmit rings
pub(crate) mod tx;

pub use config::{BottomHalf, EngineConfig, PollMode};
pub use device::{NetDevice, NetStack, RingEthDevice};
pub use error::RingEthError;
pub use mem::{DMA_SLOT_SIZE, DmaRegion};
pub use ringeth_common::frame::MacAddress;
pub use ringeth_common::irq::{IntCause, IrqLine};
pub use ringeth_common::regs::{DelayInterrupt, RegisterIo};
pub use rx::{RxFrame, RxPoll};
pub use stats::{DeviceStats, StatsSnapshot};

/// The Result type used by this crate
pub type Result<T> = core::result::Result<T, RingEthError>;
