// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Replay-Gated Cache Invalidation
//!
//! Two synthesized aspects serve replay traffic, both inserted BEFORE their
//! target step and both strictly gated on `replay=true` in the request
//! context; a normal run never mutates the cache through them:
//!
//! - **per-item** (`cache-invalidate`): derives the item's key and
//!   invalidates exactly that entry, so the replayed item recomputes and the
//!   AFTER write refreshes it.
//! - **bulk by input type** (`cache-invalidate-bulk`): drops every key under
//!   the item type's namespace prefix; requires a provider that advertises
//!   prefix enumeration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use stepflow_domain::{CacheKey, Envelope, PipelineError, ThreadContext};

use crate::infrastructure::cache::CacheSubsystem;
use crate::infrastructure::runtime::step_executor::EnvelopeEffect;

/// Per-item invalidation, `replay=true` only.
pub struct PerItemInvalidationEffect {
    subsystem: Arc<CacheSubsystem>,
    thread_context: ThreadContext,
}

impl PerItemInvalidationEffect {
    pub fn new(subsystem: Arc<CacheSubsystem>, thread_context: ThreadContext) -> Self {
        Self {
            subsystem,
            thread_context,
        }
    }
}

#[async_trait]
impl EnvelopeEffect for PerItemInvalidationEffect {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        if !envelope.context().replay() {
            return Ok(());
        }
        let Some(key) = self.subsystem.keys().derive(envelope.item(), envelope.context()) else {
            warn!(
                item_type = envelope.item().tag().name(),
                "no cache key could be derived, skipping replay invalidation"
            );
            return Ok(());
        };
        let provider = self.subsystem.providers().select(envelope.item(), self.thread_context)?;
        provider.invalidate(&key).await?;
        debug!(key = %key, "replay invalidated cache entry");
        Ok(())
    }
}

/// Bulk invalidation of the item type's whole namespace, `replay=true` only.
pub struct BulkInvalidationEffect {
    subsystem: Arc<CacheSubsystem>,
    thread_context: ThreadContext,
}

impl BulkInvalidationEffect {
    pub fn new(subsystem: Arc<CacheSubsystem>, thread_context: ThreadContext) -> Self {
        Self {
            subsystem,
            thread_context,
        }
    }
}

#[async_trait]
impl EnvelopeEffect for BulkInvalidationEffect {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        if !envelope.context().replay() {
            return Ok(());
        }
        let context = envelope.context();
        let prefix = CacheKey::type_prefix(context.version_tag(), envelope.item().tag().name());
        let provider = self.subsystem.providers().select(envelope.item(), self.thread_context)?;
        if !provider.supports_prefix_enumeration() {
            return Err(PipelineError::provider_selection(format!(
                "cache provider '{}' does not support prefix enumeration required for bulk invalidation",
                provider.backend()
            )));
        }
        let removed = provider.invalidate_by_prefix(&prefix).await?;
        debug!(prefix = %prefix, removed, "replay bulk-invalidated cache namespace");
        Ok(())
    }
}
