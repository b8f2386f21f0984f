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

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_stats {
    ($( $(#[$doc:meta])* $field:ident ),* $(,)?) => {
        /// Live device counters. Every field is a relaxed atomic.
        #[derive(Debug, Default)]
        pub struct DeviceStats {
            $( $(#[$doc])* pub(crate) $field: AtomicU64, )*
        }

        /// A point-in-time copy of [`DeviceStats`].
        ///
        /// Fields are read one by one, so a snapshot taken while the device runs
        /// is not atomic across counters.
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
        pub struct StatsSnapshot {
            $( $(#[$doc])* pub $field: u64, )*
        }

        impl DeviceStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

define_stats! {
    /// Frames delivered to the stack
    rx_packets,
    rx_bytes,
    /// Completed RX descriptors that were not delivered
    rx_errors,
    /// RX descriptors with a zero or oversized length claim
    rx_length_errors,
    /// Frames dropped because no replacement buffer was available
    rx_dropped,
    rx_alloc_failures,
    /// Frames accepted for transmission
    tx_packets,
    tx_bytes,
    /// Completions reclaimed from TX rings
    tx_reclaimed,
    /// Frames dropped before transmission, including those pending at close or reset
    tx_dropped,
    /// Frames that could not be mapped for DMA
    tx_errors,
    /// Submissions rejected with backpressure
    tx_backpressure,
    /// Interrupts taken by the top half
    interrupts,
    /// Causes that found their worklet already scheduled
    coalesced_interrupts,
    poll_passes,
    /// Passes that re-queued instead of re-arming interrupts
    poll_reschedules,
    wedge_events,
    resets,
}

impl DeviceStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
