// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Application services: registries and the orchestrator.

pub mod aspect_binder;
pub mod orchestrator;
pub mod step_registry;

pub use aspect_binder::{normalize_aspects, register_builtin_aspects, AspectFactory, AspectRegistry};
pub use orchestrator::{
    ExecutablePipeline, Orchestrator, OrchestratorBuilder, RunInput, RunOutcome, RunOutput, RunReport,
};
pub use step_registry::{BuildContext, StepBuilder, StepRegistry};
