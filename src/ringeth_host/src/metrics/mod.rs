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

use std::time::{Duration, Instant};

use metrics_macro::NamedMetric;

#[macro_use]
pub(crate) mod metrics_macro;

static LABEL_REASON: &str = "reason";
static LABEL_RING: &str = "ring";
static LABEL_WORKLET: &str = "worklet";

// Every metric this crate emits
define_metrics! {
    counter CounterMetric {
        RxDropped { reason: &'static str } => {
            name: "ringeth_rx_dropped_total",
            description: "Number of received frames dropped by the host",
            unit: metrics::Unit::Count,
        },
        TxDropped { reason: &'static str, frames: u64 } => {
            name: "ringeth_tx_dropped_total",
            description: "Number of outbound frames dropped before transmit completion",
            unit: metrics::Unit::Count,
        },
        TxBackpressure { ring: usize } => {
            name: "ringeth_tx_backpressure_total",
            description: "Number of times a TX ring stopped accepting frames",
            unit: metrics::Unit::Count,
        },
        PollReschedules { worklet: &'static str } => {
            name: "ringeth_poll_reschedules_total",
            description: "Number of poll passes that re-queued themselves instead of re-arming interrupts",
            unit: metrics::Unit::Count,
        },
        DeviceWedged { ring: usize } => {
            name: "ringeth_device_wedged_total",
            description: "Number of times a TX ring was found stuck",
            unit: metrics::Unit::Count,
        },
        DeviceResets => {
            name: "ringeth_device_resets_total",
            description: "Number of ring resets",
            unit: metrics::Unit::Count,
        },
    }
    histogram HistogramMetric {
        PollDuration { worklet: &'static str, duration: Duration } => {
            name: "ringeth_poll_duration_seconds",
            description: "Duration of a single bottom-half poll pass",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    #[must_use]
    pub(crate) fn rx_dropped(reason: &'static str) -> Self {
        CounterMetric::RxDropped { reason }
    }

    #[must_use]
    pub(crate) fn tx_dropped(reason: &'static str, frames: u64) -> Self {
        CounterMetric::TxDropped { reason, frames }
    }

    #[must_use]
    pub(crate) fn tx_backpressure(ring: usize) -> Self {
        CounterMetric::TxBackpressure { ring }
    }

    #[must_use]
    pub(crate) fn poll_reschedule(worklet: &'static str) -> Self {
        CounterMetric::PollReschedules { worklet }
    }

    #[must_use]
    pub(crate) fn device_wedged(ring: usize) -> Self {
        CounterMetric::DeviceWedged { ring }
    }

    #[must_use]
    pub(crate) fn device_reset() -> Self {
        CounterMetric::DeviceResets
    }
}

impl HistogramMetric {
    /// Runs `f` and records how long it took as a poll pass of `worklet`.
    pub(crate) fn time_poll<T, F: FnOnce() -> T>(worklet: &'static str, f: F) -> T {
        let start = Instant::now();
        let result = f();
        HistogramMetric::PollDuration {
            worklet,
            duration: start.elapsed(),
        }
        .emit();
        result
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    fn emit(self) {
        self.describe();
        let name = self.name();

        match self {
            CounterMetric::RxDropped { reason } => {
                metrics::counter!(name, LABEL_REASON => reason).increment(1);
            }
            CounterMetric::TxDropped { reason, frames } => {
                metrics::counter!(name, LABEL_REASON => reason).increment(frames);
            }
            CounterMetric::TxBackpressure { ring } => {
                metrics::counter!(name, LABEL_RING => ring.to_string()).increment(1);
            }
            CounterMetric::PollReschedules { worklet } => {
                metrics::counter!(name, LABEL_WORKLET => worklet).increment(1);
            }
            CounterMetric::DeviceWedged { ring } => {
                metrics::counter!(name, LABEL_RING => ring.to_string()).increment(1);
            }
            CounterMetric::DeviceResets => {
                metrics::counter!(name).increment(1);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        self.describe();
        let metric_name = self.name();

        match self {
            HistogramMetric::PollDuration { worklet, duration } => {
                metrics::histogram!(metric_name, LABEL_WORKLET => worklet).record(duration);
            }
        }
    }
}
