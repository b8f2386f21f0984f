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

/// A ringeth metric: its exported name plus a one-time registration of its
/// unit and help text with the installed recorder.
pub(crate) trait NamedMetric {
    /// The exported metric name.
    fn name(&self) -> &'static str;
    /// Register unit and description. Runs once per variant per process.
    fn describe(&self);
}

/// Declares the metric enums of the crate.
///
/// Each block starts with the metric kind, `counter` or `histogram`, followed
/// by the enum name. Variants carry their label values (and, for histograms,
/// the sample) as fields. Every variant gets its own `Once`, so `describe`
/// costs an atomic load after the first emit.
#[macro_export]
macro_rules! define_metrics {
    (@describe counter, $name:expr, $unit:expr, $description:expr) => {
        metrics::describe_counter!($name, $unit, $description)
    };
    (@describe histogram, $name:expr, $unit:expr, $description:expr) => {
        metrics::describe_histogram!($name, $unit, $description)
    };
    (
        $(
            $kind:ident $metric_type:ident {
                $(
                    $variant:ident $( { $($field_name:ident : $field_ty:ty),* $(,)? } )? => {
                        name: $name:expr,
                        description: $description:expr,
                        unit: $unit:expr $(,)?
                    }
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
            pub(crate) enum $metric_type {
                $(
                    $variant $( { $($field_name : $field_ty),* } )?
                ),*
            }

            impl $crate::metrics::metrics_macro::NamedMetric for $metric_type {
                fn name(&self) -> &'static str {
                    match self {
                        $(
                            Self::$variant { .. } => $name,
                        )*
                    }
                }

                fn describe(&self) {
                    match self {
                        $(
                            Self::$variant { .. } => {
                                static DESCRIBED: std::sync::Once = std::sync::Once::new();
                                DESCRIBED.call_once(|| {
                                    $crate::define_metrics!(@describe $kind, $name, $unit, $description);
                                });
                            }
                        )*
                    }
                }
            }
        )*
    };
}
