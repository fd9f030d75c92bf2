// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Prometheus Metrics Service
//!
//! Prometheus-backed implementation of the abstract telemetry sink. Metric
//! families are created on demand from `(name, label set)` and cached, so
//! the hot path only touches pre-resolved handles. Names are sanitized to
//! Prometheus conventions (`buffer.queued` → `buffer_queued`) and namespaced
//! under `stepflow`. Exporter wiring (HTTP endpoint, push gateway) is
//! external; this service only owns the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use stepflow_domain::{Counter, Gauge, PipelineError, TelemetrySink, Timer};

use crate::infrastructure::metrics::observer::TracingSpanHandle;

const NAMESPACE: &str = "stepflow";

// Maps arbitrary metric names onto the Prometheus charset; creation of a
// family from a sanitized name cannot fail.
fn sanitize(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ':' { c } else { '_' })
        .collect();
    if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

struct CounterHandle(prometheus::IntCounter);

impl Counter for CounterHandle {
    fn inc(&self, n: u64) {
        self.0.inc_by(n);
    }
}

struct GaugeHandle(prometheus::Gauge);

impl Gauge for GaugeHandle {
    fn set(&self, value: f64) {
        self.0.set(value);
    }

    fn add(&self, delta: f64) {
        self.0.add(delta);
    }
}

struct TimerHandle(prometheus::Histogram);

impl Timer for TimerHandle {
    fn record(&self, duration: Duration) {
        self.0.observe(duration.as_secs_f64());
    }
}

/// Registry-backed metrics service implementing the telemetry SPI.
pub struct MetricsService {
    registry: Arc<Registry>,
    counters: RwLock<HashMap<String, IntCounterVec>>,
    gauges: RwLock<HashMap<String, GaugeVec>>,
    histograms: RwLock<HashMap<String, HistogramVec>>,
}

impl MetricsService {
    pub fn new() -> Result<Self, PipelineError> {
        Ok(Self {
            registry: Arc::new(Registry::new()),
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        })
    }

    /// The underlying registry, for exporter wiring.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Prometheus text exposition of every registered family, for scraping.
    pub fn get_metrics(&self) -> Result<String, PipelineError> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| PipelineError::metrics_error(format!("Failed to encode metrics: {}", e)))
    }

    fn family_key(name: &str, labels: &[&str]) -> String {
        format!("{name}|{}", labels.join(","))
    }

    fn counter_family(&self, name: &str, labels: &[&str]) -> IntCounterVec {
        let key = Self::family_key(name, labels);
        if let Some(vec) = self.counters.read().get(&key) {
            return vec.clone();
        }
        let mut families = self.counters.write();
        families
            .entry(key)
            .or_insert_with(|| {
                let opts = Opts::new(sanitize(name), format!("stepflow counter {name}")).namespace(NAMESPACE);
                let vec = IntCounterVec::new(opts, labels).expect("valid counter opts");
                // A name/label clash with an existing family is a programming
                // error surfaced at first use, not silently ignored.
                self.registry.register(Box::new(vec.clone())).ok();
                vec
            })
            .clone()
    }

    fn gauge_family(&self, name: &str, labels: &[&str]) -> GaugeVec {
        let key = Self::family_key(name, labels);
        if let Some(vec) = self.gauges.read().get(&key) {
            return vec.clone();
        }
        let mut families = self.gauges.write();
        families
            .entry(key)
            .or_insert_with(|| {
                let opts = Opts::new(sanitize(name), format!("stepflow gauge {name}")).namespace(NAMESPACE);
                let vec = GaugeVec::new(opts, labels).expect("valid gauge opts");
                self.registry.register(Box::new(vec.clone())).ok();
                vec
            })
            .clone()
    }

    fn histogram_family(&self, name: &str, labels: &[&str]) -> HistogramVec {
        let key = Self::family_key(name, labels);
        if let Some(vec) = self.histograms.read().get(&key) {
            return vec.clone();
        }
        let mut families = self.histograms.write();
        families
            .entry(key)
            .or_insert_with(|| {
                let opts = HistogramOpts::new(format!("{}_seconds", sanitize(name)), format!("stepflow timer {name}"))
                    .namespace(NAMESPACE)
                    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]);
                let vec = HistogramVec::new(opts, labels).expect("valid histogram opts");
                self.registry.register(Box::new(vec.clone())).ok();
                vec
            })
            .clone()
    }
}

impl TelemetrySink for MetricsService {
    fn counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = tags.iter().map(|(_, v)| *v).collect();
        Arc::new(CounterHandle(
            self.counter_family(name, &labels).with_label_values(&values),
        ))
    }

    fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = tags.iter().map(|(_, v)| *v).collect();
        Arc::new(GaugeHandle(self.gauge_family(name, &labels).with_label_values(&values)))
    }

    fn timer(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Timer> {
        let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
        let values: Vec<&str> = tags.iter().map(|(_, v)| *v).collect();
        Arc::new(TimerHandle(
            self.histogram_family(name, &labels).with_label_values(&values),
        ))
    }

    fn span(&self, name: &str) -> Box<dyn stepflow_domain::SpanHandle> {
        Box::new(TracingSpanHandle::start(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_domain::metric;

    #[test]
    fn test_counter_accumulates() {
        let service = MetricsService::new().unwrap();
        let counter = service.counter(metric::RETRY_COUNT, &[("step", "a")]);
        counter.inc(2);
        counter.inc(3);

        let exported = service.get_metrics().unwrap();
        assert!(exported.contains("stepflow_retry_count{step=\"a\"} 5"));
    }

    #[test]
    fn test_gauge_set_and_add() {
        let service = MetricsService::new().unwrap();
        let gauge = service.gauge(metric::INFLIGHT, &[("step", "a")]);
        gauge.set(3.0);
        gauge.add(-1.0);

        let exported = service.get_metrics().unwrap();
        assert!(exported.contains("stepflow_inflight{step=\"a\"} 2"));
    }

    #[test]
    fn test_same_name_distinct_labels_do_not_collide() {
        let service = MetricsService::new().unwrap();
        service.counter(metric::RETRY_COUNT, &[("step", "a")]).inc(1);
        service.counter(metric::RETRY_COUNT, &[("step", "b")]).inc(1);

        let exported = service.get_metrics().unwrap();
        assert!(exported.contains("stepflow_retry_count{step=\"a\"} 1"));
        assert!(exported.contains("stepflow_retry_count{step=\"b\"} 1"));
    }

    #[test]
    fn test_timer_records_observations() {
        let service = MetricsService::new().unwrap();
        let timer = service.timer(metric::STEP_LATENCY, &[("step", "a")]);
        timer.record(Duration::from_millis(12));

        let exported = service.get_metrics().unwrap();
        assert!(exported.contains("stepflow_step_latency_seconds_count{step=\"a\"} 1"));
    }

    #[test]
    fn test_metric_names_are_sanitized() {
        let service = MetricsService::new().unwrap();
        service.gauge(metric::BUFFER_QUEUED, &[("step", "a")]).set(1.0);

        let exported = service.get_metrics().unwrap();
        assert!(exported.contains("stepflow_buffer_queued"));
    }
}
