// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Retry with Exponential Backoff
//!
//! The retry combinator wrapped around every user invocation. Delays follow
//! `min(retry_wait * 2^n, max_backoff)`, optionally multiplied by a uniform
//! jitter factor in `[0.5, 1.5]`. Non-retryable failures bypass the budget
//! entirely, and a pending backoff sleep aborts as soon as the run is
//! cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use stepflow_domain::{CancellationSignal, PipelineError, StepConfig};

/// Backoff parameters extracted from a resolved step configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub limit: u32,
    pub wait: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &StepConfig) -> Self {
        Self {
            limit: config.retry_limit,
            wait: config.retry_wait,
            max_backoff: config.max_backoff,
            jitter: config.jitter,
        }
    }

    /// Base delay before retry `attempt` (zero-based), capped at
    /// `max_backoff` and before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.wait.saturating_mul(factor).min(self.max_backoff)
    }

    /// Actual delay before retry `attempt`, with jitter applied when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        base.mul_f64(factor)
    }
}

/// Runs `operation` with up to `policy.limit` retries.
///
/// `on_retry(attempt)` fires before each backoff sleep (zero-based attempt
/// index) so callers can bump counters. Cancellation during a backoff sleep
/// aborts immediately with `PipelineError::Cancelled`; no further attempts
/// are made.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancellation: &Arc<dyn CancellationSignal>,
    mut on_retry: impl FnMut(u32),
    mut operation: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancellation.is_cancelled() {
            return Err(PipelineError::cancelled("run cancelled before attempt"));
        }

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() || attempt >= policy.limit => return Err(error),
            Err(_) => {
                on_retry(attempt);
                let delay = policy.delay(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        return Err(PipelineError::cancelled("run cancelled during backoff"));
                    }
                }
                attempt += 1;
            }
        }
    }
}
