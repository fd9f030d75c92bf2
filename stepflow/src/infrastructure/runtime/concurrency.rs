// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Ordering Policy & Concurrency Resolution
//!
//! Decides how many items a step wrapper may process concurrently. The
//! run-wide ordering policy combines with each step's ordering hint and
//! configuration:
//!
//! - `Sequential`: strict arrival order everywhere.
//! - `Auto` (default): expanding steps and steps that advertise `Relaxed`
//!   ordering (or set `parallel = true`) run concurrently up to the cap.
//! - `Parallel`: every per-item step runs concurrently up to the cap.
//!   `StrictAdvised` hints are overridden with a warning; `StrictRequired`
//!   is never overridden and rejects the pipeline at build time.
//!
//! Concurrent execution uses an unordered merge: downstream steps observe a
//! non-deterministic interleaving while each single item's chain stays
//! linearized.

use serde::{Deserialize, Serialize};
use tracing::warn;

use stepflow_domain::{Cardinality, OrderingHint, PipelineError, StepDescriptor};

/// Run-wide item ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingPolicy {
    Sequential,
    #[default]
    Auto,
    Parallel,
}

impl std::str::FromStr for OrderingPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(OrderingPolicy::Sequential),
            "auto" => Ok(OrderingPolicy::Auto),
            "parallel" => Ok(OrderingPolicy::Parallel),
            _ => Err(PipelineError::invalid_config(format!("Unknown ordering policy: {}", s))),
        }
    }
}

/// Resolves the per-item merge width for one step wrapper.
///
/// Returns an error when a `Parallel` run meets a `StrictRequired` step;
/// this is checked at build time so the conflict never reaches a run.
pub fn effective_concurrency(
    policy: OrderingPolicy,
    descriptor: &StepDescriptor,
    ordering: OrderingHint,
    parallel_config: bool,
    max_concurrency: usize,
) -> Result<usize, PipelineError> {
    let cap = max_concurrency.max(1);
    match policy {
        OrderingPolicy::Sequential => Ok(1),
        OrderingPolicy::Auto => {
            let eligible = descriptor.cardinality() == Cardinality::OneToMany
                || ordering == OrderingHint::Relaxed
                || parallel_config;
            Ok(if eligible { cap } else { 1 })
        }
        OrderingPolicy::Parallel => match ordering {
            OrderingHint::StrictRequired => Err(PipelineError::invalid_config(format!(
                "step '{}' requires strict ordering; parallel runs are not allowed against it",
                descriptor.id()
            ))),
            OrderingHint::StrictAdvised => {
                warn!(
                    step_id = %descriptor.id(),
                    "parallel policy overrides strict-advised ordering hint"
                );
                Ok(cap)
            }
            OrderingHint::Relaxed => Ok(cap),
        },
    }
}
