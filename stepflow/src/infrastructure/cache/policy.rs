// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Policy Enforcement
//!
//! The cache aspect materializes as a pair of synthetic side-effect steps
//! around each target step:
//!
//! - **read** (BEFORE): derives the key from the incoming item, performs the
//!   policy's read path, and on a hit arms a short-circuit so the target
//!   step's output is replaced by the cached value without invoking the user
//!   logic.
//! - **write** (AFTER): the policy enforcer. Reads (and clears) the item's
//!   `CacheStatus`, validates the policy against it, and writes
//!   `(key, output)` when the policy implies a write and the read pass did
//!   not suppress it.
//!
//! The effective policy is the per-request `cache-policy` header when
//! present, otherwise the aspect's configured policy, otherwise
//! `return-cached`. Cache I/O failures on the read path degrade to a miss
//! with a warning, except under `require-cache`, where a miss is a
//! non-retryable policy violation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use stepflow_domain::{AspectSpec, CachePolicy, CacheStatus, Envelope, PipelineError, ThreadContext};

use crate::infrastructure::cache::CacheSubsystem;
use crate::infrastructure::runtime::step_executor::EnvelopeEffect;

/// Aspect config key holding the default cache policy.
pub const CONFIG_POLICY: &str = "policy";
/// Aspect config key holding the write TTL in milliseconds.
pub const CONFIG_TTL_MS: &str = "ttl-ms";

fn configured_policy(aspect: &AspectSpec) -> CachePolicy {
    match aspect.config_value(CONFIG_POLICY) {
        None => CachePolicy::ReturnCached,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(aspect = %aspect.name, policy = raw, "invalid cache policy in aspect config, using return-cached");
            CachePolicy::ReturnCached
        }),
    }
}

fn configured_ttl(aspect: &AspectSpec, subsystem: &CacheSubsystem) -> Option<Duration> {
    match aspect.config_value(CONFIG_TTL_MS) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => {
                warn!(aspect = %aspect.name, ttl = raw, "invalid ttl-ms in aspect config, ignoring");
                subsystem.default_ttl()
            }
        },
        None => subsystem.default_ttl(),
    }
}

/// BEFORE side-effect: lookup / short-circuit path.
pub struct CacheReadEffect {
    subsystem: Arc<CacheSubsystem>,
    default_policy: CachePolicy,
    thread_context: ThreadContext,
}

impl CacheReadEffect {
    pub fn new(subsystem: Arc<CacheSubsystem>, aspect: &AspectSpec, thread_context: ThreadContext) -> Self {
        Self {
            default_policy: configured_policy(aspect),
            subsystem,
            thread_context,
        }
    }

    fn effective_policy(&self, envelope: &Envelope) -> CachePolicy {
        envelope.context().cache_policy().unwrap_or(self.default_policy)
    }
}

#[async_trait]
impl EnvelopeEffect for CacheReadEffect {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let policy = self.effective_policy(envelope);
        let state = envelope.state();

        if policy == CachePolicy::BypassCache {
            state.set_cache_status(CacheStatus::Bypass);
            return Ok(());
        }

        let Some(key) = self.subsystem.keys().derive(envelope.item(), envelope.context()) else {
            warn!(
                item_type = envelope.item().tag().name(),
                "no cache key could be derived, skipping cache read"
            );
            return Ok(());
        };
        state.set_cache_key(key.clone());

        let provider = self.subsystem.providers().select(envelope.item(), self.thread_context)?;

        match policy {
            CachePolicy::BypassCache => unreachable!("handled above"),
            // Write path only: nothing to do on the read side.
            CachePolicy::CacheOnly => {}
            CachePolicy::ReturnCached | CachePolicy::RequireCache => match provider.get(&key).await {
                Ok(Some(cached)) => {
                    debug!(key = %key, "cache hit");
                    state.set_cache_status(CacheStatus::Hit);
                    state.suppress_write();
                    state.set_short_circuit(cached);
                }
                Ok(None) => {
                    if policy == CachePolicy::RequireCache {
                        return Err(PipelineError::cache_policy_violation(format!(
                            "require-cache: no cached value for key {key}"
                        )));
                    }
                    state.set_cache_status(CacheStatus::Miss);
                }
                Err(error) => {
                    if policy == CachePolicy::RequireCache {
                        return Err(PipelineError::cache_policy_violation(format!(
                            "require-cache: lookup failed for key {key}: {error}"
                        )));
                    }
                    warn!(key = %key, %error, "cache lookup failed, treating as miss");
                    state.set_cache_status(CacheStatus::Miss);
                }
            },
            CachePolicy::SkipIfPresent => match provider.exists(&key).await {
                Ok(true) => {
                    state.set_cache_status(CacheStatus::Hit);
                    state.mark_key_present();
                    state.suppress_write();
                }
                Ok(false) => {
                    state.set_cache_status(CacheStatus::Miss);
                }
                Err(error) => {
                    warn!(key = %key, %error, "cache existence check failed, treating as absent");
                    state.set_cache_status(CacheStatus::Miss);
                }
            },
        }
        Ok(())
    }
}

/// AFTER side-effect: policy enforcement + write path.
pub struct CacheWriteEffect {
    subsystem: Arc<CacheSubsystem>,
    default_policy: CachePolicy,
    ttl: Option<Duration>,
    thread_context: ThreadContext,
}

impl CacheWriteEffect {
    pub fn new(subsystem: Arc<CacheSubsystem>, aspect: &AspectSpec, thread_context: ThreadContext) -> Self {
        Self {
            default_policy: configured_policy(aspect),
            ttl: configured_ttl(aspect, &subsystem),
            subsystem,
            thread_context,
        }
    }

    fn effective_policy(&self, envelope: &Envelope) -> CachePolicy {
        envelope.context().cache_policy().unwrap_or(self.default_policy)
    }

    fn write_implied(policy: CachePolicy) -> bool {
        matches!(
            policy,
            CachePolicy::CacheOnly | CachePolicy::ReturnCached | CachePolicy::SkipIfPresent
        )
    }
}

#[async_trait]
impl EnvelopeEffect for CacheWriteEffect {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let policy = self.effective_policy(envelope);
        let state = envelope.state();

        // Enforcer contract: the status is read-and-cleared here.
        let status = state.take_cache_status();
        if policy == CachePolicy::RequireCache && status != Some(CacheStatus::Hit) {
            return Err(PipelineError::cache_policy_violation(format!(
                "require-cache: target step completed with cache status {status:?}"
            )));
        }

        if policy == CachePolicy::BypassCache {
            let _ = state.take_cache_key();
            state.set_cache_status(CacheStatus::Bypass);
            return Ok(());
        }

        let suppressed = state.take_write_suppressed();
        let _ = state.take_key_present();
        if suppressed {
            // Hit or skip-if-present: the read outcome stands, no overwrite.
            let _ = state.take_cache_key();
            if let Some(status) = status {
                state.set_cache_status(status);
            }
            return Ok(());
        }

        if !Self::write_implied(policy) {
            let _ = state.take_cache_key();
            if let Some(status) = status {
                state.set_cache_status(status);
            }
            return Ok(());
        }

        // A read pass records the key; a write-only aspect derives it from
        // the output item.
        let key = match state.take_cache_key() {
            Some(key) => key,
            None => match self.subsystem.keys().derive(envelope.item(), envelope.context()) {
                Some(key) => key,
                None => {
                    warn!(
                        item_type = envelope.item().tag().name(),
                        "no cache key could be derived, skipping cache write"
                    );
                    return Ok(());
                }
            },
        };

        let provider = self.subsystem.providers().select(envelope.item(), self.thread_context)?;
        match provider.cache(&key, envelope.item().clone(), self.ttl).await {
            Ok(()) => {
                debug!(key = %key, "cache write");
                state.set_cache_status(CacheStatus::Write);
            }
            Err(error) => {
                // The cache is best effort on the write path.
                warn!(key = %key, %error, "cache write failed");
                state.set_cache_status(CacheStatus::Bypass);
            }
        }
        Ok(())
    }
}
