// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Contracts
//!
//! The cardinality-shaped interfaces user steps implement. The engine sees a
//! step through exactly one of these traits plus its `StepOptions`; everything
//! else (retry, backpressure, dead-lettering, telemetry) is layered on by the
//! step wrapper in the runtime crate.
//!
//! Single-shot results are plain async returns; multi-item inputs and outputs
//! are finite lazy [`ItemStream`]s. Step instances are shared across
//! concurrent items, so implementations must be thread-safe or declare a
//! strict ordering hint to opt out of concurrency.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{ExecutionMode, OrderingHint, StepConfigOverlay, ThreadSafety};
use crate::value_objects::{ItemStream, StepId};
use crate::PipelineError;

/// Marker bound for values flowing between steps.
///
/// Items must be clonable: retry re-submits the same input, and the cache
/// holds shared copies.
pub trait PipelineItem: Any + Send + Sync + Clone {}

impl<T: Any + Send + Sync + Clone> PipelineItem for T {}

/// One input item produces one output item.
#[async_trait]
pub trait OneToOneStep<I: PipelineItem, O: PipelineItem>: Send + Sync {
    async fn apply(&self, input: I) -> Result<O, PipelineError>;
}

/// One input item expands into a finite lazy sequence of outputs.
#[async_trait]
pub trait OneToManyStep<I: PipelineItem, O: PipelineItem>: Send + Sync {
    async fn expand(&self, input: I) -> Result<ItemStream<O>, PipelineError>;
}

/// A lazy input sequence folds into one output (terminal reduction).
#[async_trait]
pub trait ManyToOneStep<I: PipelineItem, O: PipelineItem>: Send + Sync {
    async fn fold(&self, inputs: ItemStream<I>) -> Result<O, PipelineError>;

    /// Result emitted for an empty input stream without invoking `fold`,
    /// unless [`Self::fold_on_empty`] opts in. `None` means an empty terminal.
    fn identity(&self) -> Option<O> {
        None
    }

    /// Opt in to receive empty input streams in `fold`.
    fn fold_on_empty(&self) -> bool {
        false
    }
}

/// A lazy input sequence transforms into a lazy output sequence.
#[async_trait]
pub trait ManyToManyStep<I: PipelineItem, O: PipelineItem>: Send + Sync {
    async fn transform(&self, inputs: ItemStream<I>) -> Result<ItemStream<O>, PipelineError>;
}

/// Observes one input and passes it through unchanged.
#[async_trait]
pub trait SideEffectStep<I: PipelineItem>: Send + Sync {
    async fn observe(&self, input: &I) -> Result<(), PipelineError>;
}

// Shared step instances register as naturally as owned ones.

#[async_trait]
impl<I: PipelineItem, O: PipelineItem, T: OneToOneStep<I, O> + ?Sized> OneToOneStep<I, O> for Arc<T> {
    async fn apply(&self, input: I) -> Result<O, PipelineError> {
        (**self).apply(input).await
    }
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem, T: OneToManyStep<I, O> + ?Sized> OneToManyStep<I, O> for Arc<T> {
    async fn expand(&self, input: I) -> Result<ItemStream<O>, PipelineError> {
        (**self).expand(input).await
    }
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem, T: ManyToOneStep<I, O> + ?Sized> ManyToOneStep<I, O> for Arc<T> {
    async fn fold(&self, inputs: ItemStream<I>) -> Result<O, PipelineError> {
        (**self).fold(inputs).await
    }

    fn identity(&self) -> Option<O> {
        (**self).identity()
    }

    fn fold_on_empty(&self) -> bool {
        (**self).fold_on_empty()
    }
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem, T: ManyToManyStep<I, O> + ?Sized> ManyToManyStep<I, O> for Arc<T> {
    async fn transform(&self, inputs: ItemStream<I>) -> Result<ItemStream<O>, PipelineError> {
        (**self).transform(inputs).await
    }
}

#[async_trait]
impl<I: PipelineItem, T: SideEffectStep<I> + ?Sized> SideEffectStep<I> for Arc<T> {
    async fn observe(&self, input: &I) -> Result<(), PipelineError> {
        (**self).observe(input).await
    }
}

/// Record routed to a dead-letter sink when a step exhausts its retry budget
/// under `recover_on_failure`.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry<I> {
    pub id: Uuid,
    pub step_id: StepId,
    /// The offending item for per-item shapes.
    pub item: Option<I>,
    /// Size-bounded sample of recently seen items for stream shapes.
    pub stream_sample: Vec<I>,
    pub error: PipelineError,
    pub occurred_at: DateTime<Utc>,
}

impl<I> DeadLetterEntry<I> {
    pub fn for_item(step_id: StepId, item: I, error: PipelineError) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            item: Some(item),
            stream_sample: Vec::new(),
            error,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_stream(step_id: StepId, sample: Vec<I>, error: PipelineError) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            item: None,
            stream_sample: sample,
            error,
            occurred_at: Utc::now(),
        }
    }
}

/// Terminal sink for items whose processing exhausted retries under recovery
/// mode.
#[async_trait]
pub trait DeadLetterSink<I>: Send + Sync {
    async fn dead_letter(&self, entry: DeadLetterEntry<I>) -> Result<(), PipelineError>;
}

/// Optional capabilities attached to a step at registration time.
///
/// This is the composition-based rendition of capability mix-ins: the wrapper
/// holds the options and delegates to the typed step value.
pub struct StepOptions<I> {
    pub execution_mode: ExecutionMode,
    pub ordering: OrderingHint,
    pub thread_safety: ThreadSafety,
    /// Programmatic per-step configuration overlay, applied on top of the
    /// settings-file per-step layer.
    pub config: StepConfigOverlay,
    pub dead_letter: Option<Arc<dyn DeadLetterSink<I>>>,
}

impl<I> StepOptions<I> {
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingHint) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_thread_safety(mut self, safety: ThreadSafety) -> Self {
        self.thread_safety = safety;
        self
    }

    pub fn with_config(mut self, config: StepConfigOverlay) -> Self {
        self.config = config;
        self
    }

    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink<I>>) -> Self {
        self.dead_letter = Some(sink);
        self
    }
}

impl<I> Default for StepOptions<I> {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Default,
            ordering: OrderingHint::default(),
            thread_safety: ThreadSafety::default(),
            config: StepConfigOverlay::default(),
            dead_letter: None,
        }
    }
}

impl<I> Clone for StepOptions<I> {
    fn clone(&self) -> Self {
        Self {
            execution_mode: self.execution_mode,
            ordering: self.ordering,
            thread_safety: self.thread_safety,
            config: self.config.clone(),
            dead_letter: self.dead_letter.clone(),
        }
    }
}
