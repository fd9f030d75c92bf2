// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain services: step contracts, the erased runtime-step dispatch, aspect
//! expansion, and the telemetry SPI.

pub mod aspect_expansion;
pub mod runtime_step;
pub mod step;
pub mod telemetry;

pub use aspect_expansion::{expand, synthetic_step_id, ExpandedStep, SyntheticStep};
pub use runtime_step::{Envelope, EnvelopeStream, ItemState, RuntimeStep, StepInput, StepOutput};
pub use step::{
    DeadLetterEntry, DeadLetterSink, ManyToManyStep, ManyToOneStep, OneToManyStep, OneToOneStep, PipelineItem,
    SideEffectStep, StepOptions,
};
pub use telemetry::{metric, Counter, Gauge, NoopTelemetry, SpanHandle, SpanStatus, TelemetrySink, Timer};
