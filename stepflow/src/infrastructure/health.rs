// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Startup Dependency Health
//!
//! Before the orchestrator accepts traffic, every required downstream
//! (providers, remote step workers) must report healthy within the
//! configured startup timeout. Checks are probed repeatedly until they pass
//! or the deadline expires; a single check that never passes fails startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use stepflow_domain::PipelineError;

/// A required downstream dependency.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), PipelineError>;
}

/// Probes every check until all pass or `timeout` expires.
pub async fn await_healthy(
    checks: &[Arc<dyn HealthCheck>],
    timeout: Duration,
    probe_interval: Duration,
) -> Result<(), PipelineError> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<Arc<dyn HealthCheck>> = checks.to_vec();

    while !pending.is_empty() {
        let mut still_pending = Vec::new();
        for check in pending {
            match check.check().await {
                Ok(()) => debug!(dependency = check.name(), "dependency healthy"),
                Err(error) => {
                    warn!(dependency = check.name(), %error, "dependency not yet healthy");
                    still_pending.push(check);
                }
            }
        }
        pending = still_pending;
        if pending.is_empty() {
            break;
        }
        if Instant::now() + probe_interval > deadline {
            let names: Vec<&str> = pending.iter().map(|c| c.name()).collect();
            return Err(PipelineError::HealthCheck(format!(
                "dependencies not healthy within {:?}: {}",
                timeout,
                names.join(", ")
            )));
        }
        tokio::time::sleep(probe_interval).await;
    }
    Ok(())
}
