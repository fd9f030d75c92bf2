// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # StepFlow Domain
//!
//! Core business logic of the StepFlow pipeline framework, independent of any
//! transport, storage backend, or async runtime. The domain defines what a
//! pipeline *is*; the `stepflow` crate defines how one *runs*.
//!
//! ## Module Structure
//!
//! - [`entities`]: step descriptors, step configuration, aspects, the
//!   declarative pipeline model, per-run metrics
//! - [`value_objects`]: step ids, type tags, erased items, cache keys, run
//!   ids
//! - [`services`]: cardinality-shaped step contracts, the erased runtime
//!   step dispatch, aspect expansion, the telemetry SPI
//! - [`repositories`]: cache and persistence provider contracts
//! - [`context`]: per-request context, control headers, cancellation port
//! - [`error`]: the domain error taxonomy
//!
//! ## Design Constraints
//!
//! The domain never performs I/O and never logs. Ports that ultimately wrap
//! I/O (providers, dead-letter sinks, the step contracts themselves) are
//! async traits; everything else is synchronous, immutable where possible,
//! and self-validating on construction.

pub mod context;
pub mod entities;
pub mod error;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use context::{
    CachePolicy, CacheStatus, CancellationSignal, HeaderWarning, NeverCancelled, RequestContext, RequestHeaders,
    RunControls, HEADER_CACHE_POLICY, HEADER_REPLAY, HEADER_VERSION,
};
pub use entities::{
    validate_chain, AspectPosition, AspectScope, AspectSpec, BackpressureStrategy, Cardinality, ExecutionMode,
    OrderingHint, PipelineModel, RunMetrics, StepConfig, StepConfigOverlay, StepDescriptor, StepModel, StreamShape,
    ThreadContext, ThreadSafety,
};
pub use error::{PipelineError, RunFailure};
pub use repositories::{CacheProvider, PersistenceFault, PersistenceProvider};
pub use services::{
    expand, metric, Counter, DeadLetterEntry, DeadLetterSink, Envelope, EnvelopeStream, ExpandedStep, Gauge,
    ItemState, ManyToManyStep, ManyToOneStep, NoopTelemetry, OneToManyStep, OneToOneStep, PipelineItem, RuntimeStep,
    SideEffectStep, SpanHandle, SpanStatus, StepInput, StepOptions, StepOutput, SyntheticStep, TelemetrySink, Timer,
};
pub use value_objects::{AnyItem, CacheKey, ItemStream, RunId, StepId, TypeTag};
