// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Telemetry Sink SPI
//!
//! Abstract counters, gauges, timers, and span emitters consumed by every
//! component. Sinks receive fire-and-forget events; the core never blocks on
//! telemetry and never sees the backend (Prometheus wiring lives in the
//! runtime crate, exporters are external).

use std::sync::Arc;
use std::time::Duration;

/// Metric names emitted by the framework.
pub mod metric {
    /// Per-step gauge of user-level invocations currently in flight.
    pub const INFLIGHT: &str = "inflight";
    /// Per-step gauge of items currently held by the backpressure buffer.
    pub const BUFFER_QUEUED: &str = "buffer.queued";
    /// Per-step gauge of the configured buffer capacity.
    pub const BUFFER_CAPACITY: &str = "buffer.capacity";
    /// Per-step counter of retry attempts.
    pub const RETRY_COUNT: &str = "retry.count";
    /// Per-step counter of items discarded by the drop strategy.
    pub const BUFFER_DROPPED: &str = "buffer.dropped";
    /// Per-step counter of dead-lettered items.
    pub const DEAD_LETTERED: &str = "dead_letter.count";
    /// Per-run gauge of the configured concurrency cap.
    pub const MAX_CONCURRENCY: &str = "max_concurrency";
    /// Counter incremented when a run is aborted by the kill switch.
    pub const KILL_SWITCH_TRIGGERED: &str = "pipeline.kill_switch.triggered";
    /// Per-step latency timer.
    pub const STEP_LATENCY: &str = "step.latency";
    /// Name of the run span.
    pub const RUN_SPAN: &str = "pipeline.run";
}

/// Monotonic counter handle.
pub trait Counter: Send + Sync {
    fn inc(&self, n: u64);
}

/// Instant-value gauge handle.
pub trait Gauge: Send + Sync {
    fn set(&self, value: f64);
    fn add(&self, delta: f64);
}

/// Latency/duration recorder.
pub trait Timer: Send + Sync {
    fn record(&self, duration: Duration);
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Handle to an in-flight span. Dropping without `end` is allowed; sinks
/// treat it as an unclean end.
pub trait SpanHandle: Send + Sync {
    fn set_attr(&self, key: &str, value: String);
    fn set_status(&self, status: SpanStatus);
    fn end(&self);
}

/// Backend-agnostic telemetry sink.
///
/// Tags are borrowed key/value pairs; implementations that need owned label
/// sets copy them at handle creation time, keeping the hot path allocation
/// free once handles are cached.
pub trait TelemetrySink: Send + Sync {
    fn counter(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Counter>;
    fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Gauge>;
    fn timer(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn Timer>;
    fn span(&self, name: &str) -> Box<dyn SpanHandle>;
}

/// Sink that discards everything; the default for tests and unwired setups.
#[derive(Debug, Default, Clone)]
pub struct NoopTelemetry;

struct NoopHandle;

impl Counter for NoopHandle {
    fn inc(&self, _n: u64) {}
}

impl Gauge for NoopHandle {
    fn set(&self, _value: f64) {}
    fn add(&self, _delta: f64) {}
}

impl Timer for NoopHandle {
    fn record(&self, _duration: Duration) {}
}

impl SpanHandle for NoopHandle {
    fn set_attr(&self, _key: &str, _value: String) {}
    fn set_status(&self, _status: SpanStatus) {}
    fn end(&self) {}
}

impl TelemetrySink for NoopTelemetry {
    fn counter(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Counter> {
        Arc::new(NoopHandle)
    }

    fn gauge(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Gauge> {
        Arc::new(NoopHandle)
    }

    fn timer(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn Timer> {
        Arc::new(NoopHandle)
    }

    fn span(&self, _name: &str) -> Box<dyn SpanHandle> {
        Box::new(NoopHandle)
    }
}
