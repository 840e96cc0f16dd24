// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Supportability metrics for harvests.
//!
//! A [`ReservoirManager`](crate::ReservoirManager) can report, per application and event type, how
//! many events each harvest saw, sent and discarded, how many sends failed and how long the
//! transmission took. The metrics are reported through the [`MetricRecorder`] trait, which is
//! bridged to metrics.rs when the `metrics-rs-024` feature is enabled.

/// Labels attached to every harvest metric.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HarvestDimensions<'a> {
    /// Application the harvest was for
    pub app: &'a str,
    /// Event type of the harvested reservoir
    pub event_type: &'a str,
}

/// Defines callbacks for recording harvest metrics
pub trait MetricRecorder: Send + Sync {
    /// Records a histogram entry. `metric` names the metric, `dimensions` label it
    fn record_histogram(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64);
    /// Increments a counter. `metric` names the metric, `dimensions` label it
    fn increment_counter(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64);
}

/// Number of `add` calls observed by harvested reservoirs
pub const EVENTS_SEEN: &str = "reservoir_events_seen";
/// Number of events delivered to a sender that reported success
pub const EVENTS_SENT: &str = "reservoir_events_sent";
/// Number of observed events that were not delivered
pub const EVENTS_DISCARDED: &str = "reservoir_events_discarded";
/// Number of failed (or panicked) sends
pub const SEND_FAILURES: &str = "reservoir_send_failures";
/// Time spent in the sender, in milliseconds
pub const HARVEST_TRANSMIT_MS: &str = "reservoir_harvest_transmit_ms";

/// Contains metadata for the harvest metrics emitted by this crate, for implementing your custom
/// describe function.
pub const HARVEST_METRICS: &[DescribedMetric] = &[
    DescribedMetric {
        name: EVENTS_SEEN,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of events offered to harvested reservoirs",
    },
    DescribedMetric {
        name: EVENTS_SENT,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of sampled events delivered to the collector",
    },
    DescribedMetric {
        name: EVENTS_DISCARDED,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of observed events not delivered by a harvest",
    },
    DescribedMetric {
        name: SEND_FAILURES,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of harvests whose send failed and was merged into the next cycle",
    },
    DescribedMetric {
        name: HARVEST_TRANSMIT_MS,
        unit: MetricsRsUnit::Millisecond,
        r#type: MetricsRsType::Histogram,
        description: "Time spent transmitting a harvested batch",
    },
];

/// Implements MetricRecorder for a global metrics-rs 0.24 recorder
#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
pub(crate) struct GlobalMetricsRs024Bridge;

#[cfg(feature = "metrics-rs-024")]
impl MetricRecorder for GlobalMetricsRs024Bridge {
    fn record_histogram(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        metrics_024::histogram!(
            metric,
            "app" => dimensions.app.to_owned(),
            "event_type" => dimensions.event_type.to_owned()
        )
        .record(value as f64);
    }

    fn increment_counter(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        metrics_024::counter!(
            metric,
            "app" => dimensions.app.to_owned(),
            "event_type" => dimensions.event_type.to_owned()
        )
        .increment(value);
    }
}

/// Implements MetricRecorder for a local metrics-rs 0.24 recorder
#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
pub(crate) struct LocalMetricsRs024Bridge<R>(pub(crate) R);

#[cfg(feature = "metrics-rs-024")]
fn metrics_rs_024_key(metric: &'static str, dimensions: HarvestDimensions<'_>) -> metrics_024::Key {
    metrics_024::Key::from_parts(
        metric,
        vec![
            metrics_024::Label::new("app", dimensions.app.to_owned()),
            metrics_024::Label::new("event_type", dimensions.event_type.to_owned()),
        ],
    )
}

#[cfg(feature = "metrics-rs-024")]
fn metrics_rs_024_metadata() -> metrics_024::Metadata<'static> {
    metrics_024::Metadata::new(
        module_path!(),
        metrics_024::Level::INFO,
        Some(module_path!()),
    )
}

#[cfg(feature = "metrics-rs-024")]
impl<R: metrics_024::Recorder + Send + Sync> MetricRecorder for LocalMetricsRs024Bridge<R> {
    fn record_histogram(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        self.0
            .register_histogram(
                &metrics_rs_024_key(metric, dimensions),
                &metrics_rs_024_metadata(),
            )
            .record(value as f64);
    }

    fn increment_counter(&self, metric: &'static str, dimensions: HarvestDimensions<'_>, value: u64) {
        self.0
            .register_counter(
                &metrics_rs_024_key(metric, dimensions),
                &metrics_rs_024_metadata(),
            )
            .increment(value);
    }
}

pub(crate) trait GlobalRecorderVersion {
    fn recorder() -> impl MetricRecorder + 'static;
    fn describe(metrics: &[DescribedMetric]);
}

#[cfg(feature = "metrics-rs-024")]
impl GlobalRecorderVersion for dyn metrics_024::Recorder {
    fn describe(metrics: &[DescribedMetric]) {
        for metric in metrics {
            let unit = match metric.unit {
                MetricsRsUnit::Count => metrics_024::Unit::Count,
                MetricsRsUnit::Millisecond => metrics_024::Unit::Milliseconds,
            };
            match metric.r#type {
                MetricsRsType::Counter => {
                    metrics_024::describe_counter!(metric.name, unit, metric.description)
                }
                MetricsRsType::Histogram => {
                    metrics_024::describe_histogram!(metric.name, unit, metric.description)
                }
            }
        }
    }

    fn recorder() -> impl MetricRecorder {
        GlobalMetricsRs024Bridge
    }
}

pub(crate) trait LocalRecorderVersion<R> {
    fn recorder(recorder: R) -> impl MetricRecorder + 'static;
}

#[cfg(feature = "metrics-rs-024")]
impl<R> LocalRecorderVersion<R> for dyn metrics_024::Recorder
where
    R: metrics_024::Recorder + Send + Sync + 'static,
{
    fn recorder(recorder: R) -> impl MetricRecorder + 'static {
        LocalMetricsRs024Bridge(recorder)
    }
}

/// Describes a metrics.rs unit in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsUnit {
    /// A plain count
    Count,
    /// Milliseconds
    Millisecond,
}

/// Describes a metrics.rs metric type in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsType {
    /// A monotonic counter
    Counter,
    /// A histogram
    Histogram,
}

/// A metric name together with its unit, type and description
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct DescribedMetric {
    /// Metric name
    pub name: &'static str,
    /// Metric unit
    pub unit: MetricsRsUnit,
    /// Metric type
    pub r#type: MetricsRsType,
    /// Human-readable description
    pub description: &'static str,
}

/// Registers units and descriptions of the [`HARVEST_METRICS`] with the global recorder. Call it
/// with a recorder type, to allow it to autodetect your metrics.rs version.
///
/// This function should be called once per metric recorder, since some metric recorders are not
/// idempotent in describe.
///
/// ```no_run
/// reservoir::metrics::describe_harvest_metrics::<dyn metrics_024::Recorder>();
/// ```
#[allow(private_bounds)]
pub fn describe_harvest_metrics<V: GlobalRecorderVersion + ?Sized>() {
    V::describe(HARVEST_METRICS);
}
