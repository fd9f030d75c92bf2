// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Run Metrics
//!
//! Mutable per-run counters shared by the step wrappers, the kill-switch
//! monitor, and the run span emitted at the end of a run. Everything is
//! atomic; wrappers update on the hot path without locking.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::value_objects::StepId;

/// Counters for a single pipeline run.
#[derive(Debug)]
pub struct RunMetrics {
    started_at: Instant,
    items_processed: AtomicU64,
    inflight: AtomicI64,
    peak_inflight: AtomicI64,
    inflight_sample_sum: AtomicU64,
    inflight_sample_count: AtomicU64,
    retries: AtomicU64,
    drops: AtomicU64,
    dead_letters: AtomicU64,
    kill_switch_fired: AtomicBool,
    triggering_step: Mutex<Option<StepId>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            items_processed: AtomicU64::new(0),
            inflight: AtomicI64::new(0),
            peak_inflight: AtomicI64::new(0),
            inflight_sample_sum: AtomicU64::new(0),
            inflight_sample_count: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            kill_switch_fired: AtomicBool::new(false),
            triggering_step: Mutex::new(None),
        }
    }

    /// Marks one user-level invocation in flight. Returns the new depth.
    pub fn invocation_started(&self) -> i64 {
        let now = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_inflight.load(Ordering::Relaxed);
        while now > peak {
            match self
                .peak_inflight
                .compare_exchange_weak(peak, now, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
        now
    }

    pub fn invocation_finished(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_item_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the step that caused the run failure; first writer wins.
    pub fn record_step_failure(&self, step: &StepId) {
        if let Ok(mut slot) = self.triggering_step.lock() {
            if slot.is_none() {
                *slot = Some(step.clone());
            }
        }
    }

    pub fn mark_kill_switch(&self) {
        self.kill_switch_fired.store(true, Ordering::Relaxed);
    }

    pub fn kill_switch_fired(&self) -> bool {
        self.kill_switch_fired.load(Ordering::Relaxed)
    }

    /// Periodic sample taken by the run monitor to compute average in-flight.
    pub fn sample_inflight(&self) {
        let current = self.inflight.load(Ordering::Relaxed).max(0) as u64;
        self.inflight_sample_sum.fetch_add(current, Ordering::Relaxed);
        self.inflight_sample_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed.load(Ordering::Relaxed)
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn peak_inflight(&self) -> i64 {
        self.peak_inflight.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn dead_letters(&self) -> u64 {
        self.dead_letters.load(Ordering::Relaxed)
    }

    pub fn triggering_step(&self) -> Option<StepId> {
        self.triggering_step.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn average_inflight(&self) -> f64 {
        let count = self.inflight_sample_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        (self.inflight_sample_sum.load(Ordering::Relaxed) as f64) / (count as f64)
    }

    pub fn items_per_minute(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.items_processed() as f64) * 60.0 / elapsed
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracks_maximum_depth() {
        let metrics = RunMetrics::new();
        metrics.invocation_started();
        metrics.invocation_started();
        metrics.invocation_finished();
        metrics.invocation_started();
        assert_eq!(metrics.peak_inflight(), 2);
        assert_eq!(metrics.inflight(), 2);
    }

    #[test]
    fn test_first_step_failure_wins() {
        let metrics = RunMetrics::new();
        metrics.record_step_failure(&StepId::new("a").unwrap());
        metrics.record_step_failure(&StepId::new("b").unwrap());
        assert_eq!(metrics.triggering_step().unwrap().as_str(), "a");
    }

    #[test]
    fn test_average_inflight_from_samples() {
        let metrics = RunMetrics::new();
        metrics.invocation_started();
        metrics.sample_inflight();
        metrics.invocation_started();
        metrics.sample_inflight();
        assert!((metrics.average_inflight() - 1.5).abs() < f64::EPSILON);
    }
}
