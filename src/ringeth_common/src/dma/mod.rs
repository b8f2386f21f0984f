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

//! Descriptor Rings for DMA Packet I/O
//!
//! This module provides the primitives a NIC driver needs to exchange buffers with
//! a DMA engine through fixed-size descriptor rings.
//!
//! # Architecture
//!
//! - **Memory access** ([`DmaMemory`]): how the host reads and writes DMA-visible
//!   memory, with acquire/release accessors for the descriptor flags word.
//!
//! - **Descriptors** ([`Descriptor`], [`DescFlags`], [`DescTable`]): the 16 byte
//!   record shared with the device and the table that holds them.
//!
//! - **Rings** ([`DescRing`]): a descriptor table plus the monotonic `head`/`tail`
//!   cursors the host uses to produce and reclaim slots.
//!
//! - **Buffers** ([`BufferPool`], [`Slab`]): a bitmap allocator that hands out the
//!   descriptor tables and frame buffers from one DMA region.
//!
//! # Ownership protocol
//!
//! The host fills a descriptor and publishes it by setting `DEVICE_OWNED` with a
//! release store. The device fills or drains the buffer, then clears
//! `DEVICE_OWNED` and sets `DONE`. The host only touches a slot again after it
//! observed `DONE` with an acquire load.
//!
//! ```ignore
//! let mut ring = DescRing::allocate(mem, &pool, capacity)?;
//! ring.produce(Descriptor::armed(buf.addr, buf.len as u32))?;
//! // ... device completes the slot ...
//! let desc = ring.slot_at(ring.tail())?;
//! if desc.is_complete() {
//!     ring.consume()?;
//! }
//! ```

mod access;
mod desc;
mod pool;
mod ring;

pub use access::*;
pub use desc::*;
pub use pool::*;
pub use ring::*;
