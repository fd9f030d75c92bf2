// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Span Observer
//!
//! Bridges the abstract span SPI onto `tracing` spans. Attributes are
//! recorded as structured events inside the span; the terminal status is
//! emitted at `end`. Collector wiring (OTLP etc.) is external; anything
//! subscribed to `tracing` sees these spans.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{error, info, info_span, Span};

use stepflow_domain::{SpanHandle, SpanStatus};

/// A span handle backed by a `tracing` span.
pub struct TracingSpanHandle {
    name: String,
    span: Span,
    started: Instant,
    status: Mutex<SpanStatus>,
    ended: AtomicBool,
}

impl TracingSpanHandle {
    pub fn start(name: &str) -> Self {
        let span = info_span!("pipeline_span", span_name = name);
        Self {
            name: name.to_string(),
            span,
            started: Instant::now(),
            status: Mutex::new(SpanStatus::Ok),
            ended: AtomicBool::new(false),
        }
    }
}

impl SpanHandle for TracingSpanHandle {
    fn set_attr(&self, key: &str, value: String) {
        let _entered = self.span.enter();
        info!(span = %self.name, attr = key, value = %value, "span attribute");
    }

    fn set_status(&self, status: SpanStatus) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = status;
        }
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let status = self.status.lock().map(|s| *s).unwrap_or(SpanStatus::Ok);
        let elapsed = self.started.elapsed();
        let _entered = self.span.enter();
        match status {
            SpanStatus::Ok => info!(span = %self.name, elapsed_ms = elapsed.as_millis() as u64, "span ended"),
            SpanStatus::Error => {
                error!(span = %self.name, elapsed_ms = elapsed.as_millis() as u64, "span ended with error")
            }
        }
    }
}

impl Drop for TracingSpanHandle {
    fn drop(&mut self) {
        // Unclean end still closes the span.
        self.end();
    }
}
