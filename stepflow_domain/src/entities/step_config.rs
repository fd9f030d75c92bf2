// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Configuration
//!
//! `StepConfig` is the fully resolved knob set the engine wraps a step with:
//! retry budget and backoff, recovery behavior, backpressure strategy, and
//! parallelism eligibility. `StepConfigOverlay` is the sparse form used by
//! every layering source (global defaults, per-step overrides, per-request
//! overrides): each overlay sets exactly the fields it specifies and unset
//! fields inherit from the layer below.
//!
//! Validation happens once when a resolved config is constructed. Invalid
//! strategies, non-positive durations, and `max_backoff < retry_wait` are
//! configuration failures and surface at startup, never mid-run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// Behavior when a step's backpressure buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressureStrategy {
    /// Hold up to `buffer_capacity` items; a full buffer suspends the producer.
    Buffer,
    /// Discard the newest item on overflow and count the drop.
    Drop,
}

impl std::fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressureStrategy::Buffer => write!(f, "buffer"),
            BackpressureStrategy::Drop => write!(f, "drop"),
        }
    }
}

impl std::str::FromStr for BackpressureStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buffer" => Ok(BackpressureStrategy::Buffer),
            "drop" => Ok(BackpressureStrategy::Drop),
            _ => Err(PipelineError::invalid_config(format!(
                "Unknown backpressure strategy: {}",
                s
            ))),
        }
    }
}

/// Fully resolved per-step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Additional attempts after the first failure. Zero disables retry.
    pub retry_limit: u32,
    /// Base delay before the first retry; doubles each attempt.
    pub retry_wait: Duration,
    /// Upper bound on the exponential backoff delay.
    pub max_backoff: Duration,
    /// Multiply each delay by a uniform factor in [0.5, 1.5].
    pub jitter: bool,
    /// Exhausted failures go to the dead-letter sink instead of propagating.
    pub recover_on_failure: bool,
    /// Backpressure buffer capacity in items.
    pub buffer_capacity: usize,
    /// Overflow behavior of the backpressure buffer.
    pub backpressure: BackpressureStrategy,
    /// Whether this step may process items concurrently under the AUTO policy.
    pub parallel: bool,
}

impl StepConfig {
    /// Framework defaults: 3 retries, 2s base wait, 30s backoff cap, no
    /// jitter, propagate failures, buffer 128 items, sequential.
    pub fn framework_defaults() -> Self {
        Self {
            retry_limit: 3,
            retry_wait: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            jitter: false,
            recover_on_failure: false,
            buffer_capacity: 128,
            backpressure: BackpressureStrategy::Buffer,
            parallel: false,
        }
    }

    /// Validates the invariants on a resolved configuration.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retry_wait.is_zero() {
            return Err(PipelineError::invalid_config("retry_wait must be positive"));
        }
        if self.max_backoff.is_zero() {
            return Err(PipelineError::invalid_config("max_backoff must be positive"));
        }
        if self.max_backoff < self.retry_wait {
            return Err(PipelineError::invalid_config(format!(
                "max_backoff ({:?}) must be >= retry_wait ({:?})",
                self.max_backoff, self.retry_wait
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(PipelineError::invalid_config("buffer_capacity must be >= 1"));
        }
        Ok(())
    }

    /// Applies a sparse overlay on top of this configuration.
    pub fn overlaid(&self, overlay: &StepConfigOverlay) -> Self {
        Self {
            retry_limit: overlay.retry_limit.unwrap_or(self.retry_limit),
            retry_wait: overlay.retry_wait.unwrap_or(self.retry_wait),
            max_backoff: overlay.max_backoff.unwrap_or(self.max_backoff),
            jitter: overlay.jitter.unwrap_or(self.jitter),
            recover_on_failure: overlay.recover_on_failure.unwrap_or(self.recover_on_failure),
            buffer_capacity: overlay.buffer_capacity.unwrap_or(self.buffer_capacity),
            backpressure: overlay.backpressure.unwrap_or(self.backpressure),
            parallel: overlay.parallel.unwrap_or(self.parallel),
        }
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self::framework_defaults()
    }
}

/// Sparse configuration layer: only the fields a source specifies.
///
/// Durations deserialize from either integer milliseconds or humane structs
/// via serde's default `Duration` representation; settings files use
/// millisecond integers (`retry_wait_ms`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfigOverlay {
    pub retry_limit: Option<u32>,
    #[serde(with = "option_duration_ms", rename = "retry_wait_ms")]
    pub retry_wait: Option<Duration>,
    #[serde(with = "option_duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Option<Duration>,
    pub jitter: Option<bool>,
    pub recover_on_failure: Option<bool>,
    pub buffer_capacity: Option<usize>,
    pub backpressure: Option<BackpressureStrategy>,
    pub parallel: Option<bool>,
}

impl StepConfigOverlay {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merges another overlay on top of this one, field by field.
    pub fn merged(&self, above: &StepConfigOverlay) -> Self {
        Self {
            retry_limit: above.retry_limit.or(self.retry_limit),
            retry_wait: above.retry_wait.or(self.retry_wait),
            max_backoff: above.max_backoff.or(self.max_backoff),
            jitter: above.jitter.or(self.jitter),
            recover_on_failure: above.recover_on_failure.or(self.recover_on_failure),
            buffer_capacity: above.buffer_capacity.or(self.buffer_capacity),
            backpressure: above.backpressure.or(self.backpressure),
            parallel: above.parallel.or(self.parallel),
        }
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.map(Duration::from_millis))
    }
}
