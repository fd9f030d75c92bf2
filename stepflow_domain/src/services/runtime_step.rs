// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Runtime Step Contract
//!
//! The uniform, type-erased interface the orchestrator drives. Each user step
//! is wrapped by the engine into a `RuntimeStep`; each cardinality variant
//! owns its own backpressure and retry pipeline behind the single
//! `run(input) -> output` dispatch.
//!
//! Items travel inside an [`Envelope`]: the erased value plus the request
//! context and a small per-item state cell used by the cache side-effects
//! (last cache status, pending short-circuit value, derived key). The
//! envelope is what lets a BEFORE side-effect hand a cached value across the
//! target step without the step contracts knowing anything about caching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::context::{CacheStatus, RequestContext};
use crate::entities::StepDescriptor;
use crate::value_objects::{AnyItem, CacheKey};
use crate::PipelineError;

/// Per-item scratch state shared by the side-effect steps surrounding one
/// target step.
///
/// Fields are consumed (`take`-style) by their readers so state never leaks
/// from one aspect group into the next.
#[derive(Debug, Default)]
pub struct ItemState {
    cache_status: Mutex<Option<CacheStatus>>,
    short_circuit: Mutex<Option<AnyItem>>,
    cache_key: Mutex<Option<CacheKey>>,
    key_present_at_lookup: AtomicBool,
    suppress_cache_write: AtomicBool,
}

impl ItemState {
    pub fn set_cache_status(&self, status: CacheStatus) {
        if let Ok(mut slot) = self.cache_status.lock() {
            *slot = Some(status);
        }
    }

    /// Reads and clears the last cache status (enforcer contract).
    pub fn take_cache_status(&self) -> Option<CacheStatus> {
        self.cache_status.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Arms a short-circuit: the next target step outputs `value` without
    /// invoking its user logic.
    pub fn set_short_circuit(&self, value: AnyItem) {
        if let Ok(mut slot) = self.short_circuit.lock() {
            *slot = Some(value);
        }
    }

    pub fn take_short_circuit(&self) -> Option<AnyItem> {
        self.short_circuit.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Records the key derived by the BEFORE cache pass for the AFTER pass.
    pub fn set_cache_key(&self, key: CacheKey) {
        if let Ok(mut slot) = self.cache_key.lock() {
            *slot = Some(key);
        }
    }

    pub fn take_cache_key(&self) -> Option<CacheKey> {
        self.cache_key.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Marks that the key already existed at BEFORE-lookup time.
    pub fn mark_key_present(&self) {
        self.key_present_at_lookup.store(true, Ordering::Relaxed);
    }

    pub fn take_key_present(&self) -> bool {
        self.key_present_at_lookup.swap(false, Ordering::Relaxed)
    }

    /// Suppresses the AFTER-side cache write (skip-if-present semantics).
    pub fn suppress_write(&self) {
        self.suppress_cache_write.store(true, Ordering::Relaxed);
    }

    pub fn take_write_suppressed(&self) -> bool {
        self.suppress_cache_write.swap(false, Ordering::Relaxed)
    }
}

/// An item in flight: erased value + request context + per-item state.
#[derive(Debug, Clone)]
pub struct Envelope {
    item: AnyItem,
    context: Arc<RequestContext>,
    state: Arc<ItemState>,
}

impl Envelope {
    pub fn new(item: AnyItem, context: Arc<RequestContext>) -> Self {
        Self {
            item,
            context,
            state: Arc::new(ItemState::default()),
        }
    }

    /// Same context and state, new payload. Used by per-item steps whose
    /// output continues the same item's side-effect chain.
    pub fn with_item(&self, item: AnyItem) -> Self {
        Self {
            item,
            context: Arc::clone(&self.context),
            state: Arc::clone(&self.state),
        }
    }

    /// Same context, fresh state. Used for items created by expanding or
    /// folding steps, which start their own side-effect chains.
    pub fn fork(&self, item: AnyItem) -> Self {
        Self {
            item,
            context: Arc::clone(&self.context),
            state: Arc::new(ItemState::default()),
        }
    }

    pub fn item(&self) -> &AnyItem {
        &self.item
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    pub fn state(&self) -> &Arc<ItemState> {
        &self.state
    }
}

/// Lazy sequence of envelopes between runtime steps.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, PipelineError>>;

/// Input handed to a runtime step.
pub enum StepInput {
    Single(Envelope),
    /// An upstream step recovered a failed item away; nothing to process.
    Empty,
    Stream(EnvelopeStream),
}

/// Output produced by a runtime step.
pub enum StepOutput {
    Single(Envelope),
    Empty,
    Stream(EnvelopeStream),
}

impl std::fmt::Debug for StepOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutput::Single(envelope) => f.debug_tuple("Single").field(envelope).finish(),
            StepOutput::Empty => write!(f, "Empty"),
            StepOutput::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

impl StepOutput {
    /// Reinterprets this output as the next step's input.
    pub fn into_input(self) -> StepInput {
        match self {
            StepOutput::Single(envelope) => StepInput::Single(envelope),
            StepOutput::Empty => StepInput::Empty,
            StepOutput::Stream(stream) => StepInput::Stream(stream),
        }
    }
}

/// Uniform dispatch over a wrapped step, whatever its cardinality.
#[async_trait]
pub trait RuntimeStep: Send + Sync {
    fn descriptor(&self) -> &StepDescriptor;

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError>;
}
