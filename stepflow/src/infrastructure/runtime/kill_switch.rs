// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Retry-Amplification Kill Switch
//!
//! Detects the feedback pattern where retries pile work onto an already
//! degrading run: the in-flight gauge keeps growing while the retry rate
//! exceeds its threshold. Both signals are tracked as exponentially weighted
//! moving averages over a rolling sampling window, so short bursts do not
//! trip the switch but sustained amplification does.
//!
//! The orchestrator samples the detector from a monitor task; a trigger
//! cancels the run, which then surfaces as a classified `KillSwitch` failure
//! with `reason=retry_amplification`.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use stepflow_domain::RunMetrics;

/// Kill-switch thresholds, part of the framework settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    /// Sustained retry rate (retries/second) above which amplification is
    /// suspected.
    pub retry_rate_threshold: f64,
    /// Sustained in-flight growth (invocations/second) that must accompany
    /// the retry rate for the switch to trip.
    pub inflight_growth_threshold: f64,
    /// Samples required before the switch may trip; guards cold EWMAs.
    pub min_samples: u32,
    /// EWMA smoothing factor in (0, 1]; higher reacts faster.
    pub smoothing: f64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_rate_threshold: 10.0,
            inflight_growth_threshold: 0.5,
            min_samples: 3,
            smoothing: 0.3,
        }
    }
}

/// Evidence attached to a tripped kill switch.
#[derive(Debug, Clone, PartialEq)]
pub struct KillSwitchTrigger {
    pub reason: &'static str,
    pub retry_rate: f64,
    pub inflight_growth: f64,
}

/// Rolling-window detector over one run's metrics.
#[derive(Debug)]
pub struct RetryAmplificationDetector {
    config: KillSwitchConfig,
    ewma_retry_rate: f64,
    ewma_inflight_growth: f64,
    last_retries: u64,
    last_inflight: i64,
    last_sample: Instant,
    samples: u32,
}

impl RetryAmplificationDetector {
    pub fn new(config: KillSwitchConfig) -> Self {
        Self {
            config,
            ewma_retry_rate: 0.0,
            ewma_inflight_growth: 0.0,
            last_retries: 0,
            last_inflight: 0,
            last_sample: Instant::now(),
            samples: 0,
        }
    }

    /// Feeds one sample of the run metrics; returns a trigger when the
    /// amplification condition is met.
    pub fn observe(&mut self, metrics: &RunMetrics) -> Option<KillSwitchTrigger> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_sample).as_secs_f64();
        if dt <= 0.0 {
            return None;
        }

        let retries = metrics.retries();
        let inflight = metrics.inflight();
        let retry_rate = (retries.saturating_sub(self.last_retries)) as f64 / dt;
        let inflight_growth = (inflight - self.last_inflight) as f64 / dt;

        let alpha = self.config.smoothing.clamp(f64::EPSILON, 1.0);
        self.ewma_retry_rate = alpha * retry_rate + (1.0 - alpha) * self.ewma_retry_rate;
        self.ewma_inflight_growth = alpha * inflight_growth + (1.0 - alpha) * self.ewma_inflight_growth;

        self.last_retries = retries;
        self.last_inflight = inflight;
        self.last_sample = now;
        self.samples += 1;

        if !self.config.enabled || self.samples < self.config.min_samples {
            return None;
        }
        if self.ewma_retry_rate > self.config.retry_rate_threshold
            && self.ewma_inflight_growth > self.config.inflight_growth_threshold
        {
            return Some(KillSwitchTrigger {
                reason: "retry_amplification",
                retry_rate: self.ewma_retry_rate,
                inflight_growth: self.ewma_inflight_growth,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector(retry_threshold: f64, growth_threshold: f64) -> RetryAmplificationDetector {
        RetryAmplificationDetector::new(KillSwitchConfig {
            enabled: true,
            retry_rate_threshold: retry_threshold,
            inflight_growth_threshold: growth_threshold,
            min_samples: 2,
            smoothing: 1.0,
        })
    }

    #[tokio::test]
    async fn test_quiet_run_never_trips() {
        let metrics = RunMetrics::new();
        let mut detector = detector(1.0, 0.0);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(detector.observe(&metrics).is_none());
        }
    }

    #[tokio::test]
    async fn test_retry_storm_with_growing_inflight_trips() {
        let metrics = RunMetrics::new();
        let mut detector = detector(1.0, 0.0);

        let mut trigger = None;
        for _ in 0..5 {
            // Inflight grows while retries accumulate rapidly.
            for _ in 0..50 {
                metrics.record_retry();
            }
            metrics.invocation_started();
            metrics.invocation_started();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(t) = detector.observe(&metrics) {
                trigger = Some(t);
                break;
            }
        }
        let trigger = trigger.expect("kill switch should have tripped");
        assert_eq!(trigger.reason, "retry_amplification");
        assert!(trigger.retry_rate > 1.0);
    }

    #[tokio::test]
    async fn test_retries_without_inflight_growth_do_not_trip() {
        let metrics = RunMetrics::new();
        let mut detector = detector(1.0, 0.5);

        for _ in 0..5 {
            for _ in 0..50 {
                metrics.record_retry();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(detector.observe(&metrics).is_none());
        }
    }

    #[tokio::test]
    async fn test_disabled_switch_never_trips() {
        let metrics = RunMetrics::new();
        let mut detector = RetryAmplificationDetector::new(KillSwitchConfig {
            enabled: false,
            retry_rate_threshold: 0.0,
            inflight_growth_threshold: -1.0,
            min_samples: 0,
            smoothing: 1.0,
        });
        for _ in 0..50 {
            metrics.record_retry();
        }
        metrics.invocation_started();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(detector.observe(&metrics).is_none());
    }
}
