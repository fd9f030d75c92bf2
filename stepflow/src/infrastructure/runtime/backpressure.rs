// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Backpressure Buffers
//!
//! Bounded buffering between a producing stream and its consumer, applied by
//! the step engine on the stream side of every stream-shaped step.
//!
//! Two strategies:
//!
//! - **Buffer**: a bounded channel of `buffer_capacity` items. When the
//!   buffer is full the producing task suspends on the channel send, which is
//!   the backpressure signal to everything upstream.
//! - **Drop**: the newest item is discarded on overflow and a drop counter
//!   is incremented; the producer never suspends.
//!
//! The per-step `buffer.queued` gauge tracks the live depth and
//! `buffer.capacity` the configured bound. A cancelled run tears the pump
//! task down and discards whatever is still queued, without dead-lettering.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use stepflow_domain::{
    metric, BackpressureStrategy, CancellationSignal, Envelope, EnvelopeStream, PipelineError, RunMetrics, StepConfig,
    StepId, TelemetrySink,
};

/// Wraps `upstream` in a bounded buffer according to `config`.
pub fn with_backpressure(
    upstream: EnvelopeStream,
    step_id: &StepId,
    config: &StepConfig,
    telemetry: &Arc<dyn TelemetrySink>,
    run_metrics: Option<Arc<RunMetrics>>,
    cancellation: Arc<dyn CancellationSignal>,
) -> EnvelopeStream {
    let capacity = config.buffer_capacity.max(1);
    let tags: &[(&str, &str)] = &[("step", step_id.as_str())];
    let queued_gauge = telemetry.gauge(metric::BUFFER_QUEUED, tags);
    let capacity_gauge = telemetry.gauge(metric::BUFFER_CAPACITY, tags);
    let dropped_counter = telemetry.counter(metric::BUFFER_DROPPED, tags);
    capacity_gauge.set(capacity as f64);

    let depth = Arc::new(AtomicI64::new(0));
    let (tx, mut rx) = mpsc::channel::<Result<Envelope, PipelineError>>(capacity);
    let strategy = config.backpressure;
    let pump_step = step_id.clone();
    let pump_depth = Arc::clone(&depth);
    let pump_gauge = Arc::clone(&queued_gauge);

    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            let item = tokio::select! {
                item = upstream.next() => item,
                _ = cancellation.cancelled() => {
                    debug!(step_id = %pump_step, "backpressure pump cancelled, discarding buffered items");
                    break;
                }
            };
            let Some(item) = item else { break };

            match strategy {
                BackpressureStrategy::Buffer => {
                    // Suspends here when the buffer is full; this is the
                    // backpressure signal to the upstream chain.
                    if tx.send(item).await.is_err() {
                        break;
                    }
                    pump_gauge.set(pump_depth.fetch_add(1, Ordering::Relaxed) as f64 + 1.0);
                }
                BackpressureStrategy::Drop => match tx.try_send(item) {
                    Ok(()) => {
                        pump_gauge.set(pump_depth.fetch_add(1, Ordering::Relaxed) as f64 + 1.0);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped_counter.inc(1);
                        if let Some(metrics) = &run_metrics {
                            metrics.record_drop();
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
            }
        }
    });

    let out_depth = depth;
    let out_gauge = queued_gauge;
    Box::pin(futures::stream::poll_fn(move |cx| {
        let polled = rx.poll_recv(cx);
        if let std::task::Poll::Ready(Some(_)) = &polled {
            out_gauge.set((out_depth.fetch_sub(1, Ordering::Relaxed) - 1).max(0) as f64);
        }
        polled
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stepflow_domain::{AnyItem, NeverCancelled, NoopTelemetry, RequestContext, RunControls};

    use crate::infrastructure::runtime::cancellation::CancellationToken;

    fn envelopes(values: &[&str]) -> Vec<Result<Envelope, PipelineError>> {
        let ctx = Arc::new(RequestContext::new(RunControls::detached()));
        values
            .iter()
            .map(|v| Ok(Envelope::new(AnyItem::new(v.to_string()), Arc::clone(&ctx))))
            .collect()
    }

    fn config(capacity: usize, strategy: BackpressureStrategy) -> StepConfig {
        StepConfig {
            buffer_capacity: capacity,
            backpressure: strategy,
            ..StepConfig::framework_defaults()
        }
    }

    fn sink() -> Arc<dyn TelemetrySink> {
        Arc::new(NoopTelemetry)
    }

    fn never() -> Arc<dyn CancellationSignal> {
        Arc::new(NeverCancelled)
    }

    #[tokio::test]
    async fn test_buffer_passes_all_items_through() {
        let upstream: EnvelopeStream = Box::pin(futures::stream::iter(envelopes(&["a", "b", "c"])));
        let step = StepId::new("s").unwrap();
        let buffered = with_backpressure(
            upstream,
            &step,
            &config(2, BackpressureStrategy::Buffer),
            &sink(),
            None,
            never(),
        );
        let out: Vec<_> = buffered.collect().await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_drop_discards_newest_on_overflow() {
        // Slow consumer + capacity 1: most of the burst is dropped.
        let many: Vec<_> = (0..100).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let upstream: EnvelopeStream = Box::pin(futures::stream::iter(envelopes(&refs)));

        let step = StepId::new("s").unwrap();
        let metrics = Arc::new(RunMetrics::new());
        let mut buffered = with_backpressure(
            upstream,
            &step,
            &config(1, BackpressureStrategy::Drop),
            &sink(),
            Some(Arc::clone(&metrics)),
            never(),
        );

        let mut received = 0u64;
        while let Some(item) = buffered.next().await {
            assert!(item.is_ok());
            received += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Emitted <= offered, and the difference equals the drop counter.
        assert!(received <= 100);
        assert_eq!(metrics.drops(), 100 - received);
    }

    #[tokio::test]
    async fn test_buffer_suspends_producer_at_capacity() {
        // An unbounded upstream: without backpressure this would spin forever.
        let ctx = Arc::new(RequestContext::new(RunControls::detached()));
        let upstream: EnvelopeStream = Box::pin(futures::stream::unfold(0u64, move |n| {
            let ctx = Arc::clone(&ctx);
            async move { Some((Ok(Envelope::new(AnyItem::new(n), ctx)), n + 1)) }
        }));

        let step = StepId::new("s").unwrap();
        let mut buffered = with_backpressure(
            upstream,
            &step,
            &config(4, BackpressureStrategy::Buffer),
            &sink(),
            None,
            never(),
        );

        // Consume a handful of items, then stop; the pump must be parked on
        // the bounded channel rather than buffering unboundedly.
        for _ in 0..10 {
            assert!(buffered.next().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_cancellation_discards_buffered_items() {
        let token = CancellationToken::new();
        let cancel: Arc<dyn CancellationSignal> = Arc::new(token.clone());

        let ctx = Arc::new(RequestContext::new(RunControls::detached()));
        let upstream: EnvelopeStream = Box::pin(futures::stream::unfold(0u64, move |n| {
            let ctx = Arc::clone(&ctx);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Some((Ok(Envelope::new(AnyItem::new(n), ctx)), n + 1))
            }
        }));

        let step = StepId::new("s").unwrap();
        let mut buffered = with_backpressure(
            upstream,
            &step,
            &config(4, BackpressureStrategy::Buffer),
            &sink(),
            None,
            cancel,
        );

        assert!(buffered.next().await.is_some());
        token.cancel();
        // The pump exits and the stream terminates shortly after.
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while buffered.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
