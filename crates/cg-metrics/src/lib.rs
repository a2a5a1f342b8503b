#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-metrics** – the metrics seam.
//!
//! Prometheus-style registries are process-global by convention, which
//! makes code that reaches for one directly hard to unit test. Every
//! component that reports a metric instead takes an `Arc<dyn
//! MetricsSink>`: [`NoopMetricsSink`] for tests and dry runs,
//! [`PrometheusMetricsSink`] wrapping a real `prometheus::Registry` in
//! production.

use std::sync::Arc;

use dashmap::DashMap;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Errors registering or rendering metrics.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The underlying Prometheus registry rejected a registration or
    /// gather call.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
    /// Rendered metric text was not valid UTF-8.
    #[error("metrics output was not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Narrow counter/gauge/histogram interface components report through,
/// independent of any concrete registry.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter identified by `name` and `labels` by 1.
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Set a gauge identified by `name` and `labels` to `value`.
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64);

    /// Record one observation of `value` for a histogram identified by
    /// `name` and `labels`.
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards every observation. The default for tests and for components
/// run without metrics configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: i64) {}
    fn observe_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// A [`MetricsSink`] backed by a real `prometheus::Registry`.
///
/// Metric families are registered lazily, the first time a given `name`
/// is observed with a given label set's key names; every `labels` call
/// for the same `name` afterward MUST use the same label *keys* (values
/// may vary), matching `prometheus`'s own `*Vec` contract.
pub struct PrometheusMetricsSink {
    registry: Registry,
    counters: DashMap<String, IntCounterVec>,
    gauges: DashMap<String, IntGaugeVec>,
    histograms: DashMap<String, HistogramVec>,
}

impl PrometheusMetricsSink {
    /// A fresh sink over a new, empty registry.
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// The underlying registry, for wiring into an external exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in Prometheus text exposition
    /// format, for the `/metrics` HTTP endpoint.
    pub fn render(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn label_names<'a>(labels: &[(&'a str, &str)]) -> Vec<&'a str> {
        labels.iter().map(|(k, _)| *k).collect()
    }

    fn label_values<'a>(labels: &'a [(&str, &str)]) -> Vec<&'a str> {
        labels.iter().map(|(_, v)| *v).collect()
    }
}

impl Default for PrometheusMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let counter = self.counters.entry(name.to_string()).or_insert_with(|| {
            let vec = IntCounterVec::new(Opts::new(name, name), &Self::label_names(labels))
                .expect("counter metric name/labels must be valid");
            self.registry
                .register(Box::new(vec.clone()))
                .expect("counter metric must register exactly once per name");
            vec
        });
        counter
            .with_label_values(&Self::label_values(labels))
            .inc();
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let gauge = self.gauges.entry(name.to_string()).or_insert_with(|| {
            let vec = IntGaugeVec::new(Opts::new(name, name), &Self::label_names(labels))
                .expect("gauge metric name/labels must be valid");
            self.registry
                .register(Box::new(vec.clone()))
                .expect("gauge metric must register exactly once per name");
            vec
        });
        gauge
            .with_label_values(&Self::label_values(labels))
            .set(value);
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let histogram = self.histograms.entry(name.to_string()).or_insert_with(|| {
            let vec = HistogramVec::new(
                prometheus::HistogramOpts::new(name, name),
                &Self::label_names(labels),
            )
            .expect("histogram metric name/labels must be valid");
            self.registry
                .register(Box::new(vec.clone()))
                .expect("histogram metric must register exactly once per name");
            vec
        });
        histogram
            .with_label_values(&Self::label_values(labels))
            .observe(value);
    }
}

/// Shared-ownership handle to any [`MetricsSink`], the shape components
/// actually take as a constructor argument.
pub type SharedMetricsSink = Arc<dyn MetricsSink>;
