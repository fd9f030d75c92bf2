// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain entities: step descriptors, step configuration, aspects, the
//! declarative pipeline model, and per-run metrics.

pub mod aspect;
pub mod pipeline;
pub mod run_metrics;
pub mod step;
pub mod step_config;

pub use aspect::{AspectPosition, AspectScope, AspectSpec};
pub use pipeline::{validate_chain, PipelineModel, StepModel};
pub use run_metrics::RunMetrics;
pub use step::{Cardinality, ExecutionMode, OrderingHint, StepDescriptor, StreamShape, ThreadContext, ThreadSafety};
pub use step_config::{BackpressureStrategy, StepConfig, StepConfigOverlay};
