// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Descriptors
//!
//! Immutable description of a pipeline step: its identity, cardinality shape,
//! item types, and execution mode. Descriptors are what the orchestrator and
//! the aspect expander reason about; the executable behavior behind a
//! descriptor lives in the runtime layer.

use serde::{Deserialize, Serialize};

use crate::value_objects::{StepId, TypeTag};
use crate::PipelineError;

/// Input→output multiplicity shape of a step.
///
/// The cardinality decides which reactive pipeline the engine builds around
/// the user logic and how the streaming shape of the overall pipeline evolves
/// across the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    /// One input item produces one output item.
    OneToOne,
    /// One input item expands into a finite lazy sequence of outputs.
    OneToMany,
    /// A lazy sequence of inputs folds into a single output (terminal reduction).
    ManyToOne,
    /// A lazy sequence of inputs transforms into a lazy sequence of outputs.
    ManyToMany,
    /// Observes one input and passes it through unchanged.
    SideEffect,
}

impl Cardinality {
    /// Whether the step consumes a stream rather than individual items.
    pub fn consumes_stream(&self) -> bool {
        matches!(self, Cardinality::ManyToOne | Cardinality::ManyToMany)
    }

    /// Whether the step produces a stream rather than individual items.
    pub fn produces_stream(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }
}

impl std::fmt::Display for Cardinality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cardinality::OneToOne => write!(f, "one-to-one"),
            Cardinality::OneToMany => write!(f, "one-to-many"),
            Cardinality::ManyToOne => write!(f, "many-to-one"),
            Cardinality::ManyToMany => write!(f, "many-to-many"),
            Cardinality::SideEffect => write!(f, "side-effect"),
        }
    }
}

impl std::str::FromStr for Cardinality {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one-to-one" | "one_one" => Ok(Cardinality::OneToOne),
            "one-to-many" | "one_many" => Ok(Cardinality::OneToMany),
            "many-to-one" | "many_one" => Ok(Cardinality::ManyToOne),
            "many-to-many" | "many_many" => Ok(Cardinality::ManyToMany),
            "side-effect" | "side_effect" => Ok(Cardinality::SideEffect),
            _ => Err(PipelineError::invalid_config(format!("Unknown cardinality: {}", s))),
        }
    }
}

/// How the engine dispatches the user logic of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Await inline on the current worker.
    #[default]
    Default,
    /// Spawn the invocation as its own task.
    Async,
    /// Dispatch through the blocking pool for logic that occupies the thread.
    Blocking,
}

impl ExecutionMode {
    /// The thread context providers must support to serve calls from a step
    /// running in this mode.
    pub fn thread_context(&self) -> ThreadContext {
        match self {
            ExecutionMode::Blocking => ThreadContext::Blocking,
            _ => ThreadContext::Async,
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(ExecutionMode::Default),
            "async" | "virtual" => Ok(ExecutionMode::Async),
            "blocking" => Ok(ExecutionMode::Blocking),
            _ => Err(PipelineError::invalid_config(format!("Unknown execution mode: {}", s))),
        }
    }
}

/// Execution context a provider call happens on. Providers advertise which
/// contexts they support; selection filters out incompatible ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadContext {
    Async,
    Blocking,
}

/// Whether concurrent calls into a step or provider are permitted.
///
/// `Unsafe` providers are serialized behind a per-provider mutex by the
/// selection layer; `Unsafe` steps should pair with a strict ordering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadSafety {
    #[default]
    Safe,
    Unsafe,
}

/// Per-step ordering requirement consulted by the concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingHint {
    /// Items must be processed strictly in arrival order; never overridden.
    StrictRequired,
    /// Prefer arrival order; a parallel run policy overrides with a warning.
    #[default]
    StrictAdvised,
    /// Order does not matter; eligible for concurrent execution under AUTO.
    Relaxed,
}

/// Immutable descriptor of a pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    id: StepId,
    input: TypeTag,
    output: TypeTag,
    cardinality: Cardinality,
    execution_mode: ExecutionMode,
    synthetic: bool,
}

impl StepDescriptor {
    /// Creates a descriptor for a user-declared step.
    ///
    /// Enforces the side-effect identity invariant: a side-effect step must
    /// declare the same input and output type.
    pub fn new(
        id: StepId,
        input: TypeTag,
        output: TypeTag,
        cardinality: Cardinality,
        execution_mode: ExecutionMode,
    ) -> Result<Self, PipelineError> {
        if cardinality == Cardinality::SideEffect && input != output {
            return Err(PipelineError::invalid_config(format!(
                "side-effect step '{}' must preserve its item type ({} != {})",
                id,
                input.name(),
                output.name()
            )));
        }
        Ok(Self {
            id,
            input,
            output,
            cardinality,
            execution_mode,
            synthetic: false,
        })
    }

    /// Creates a descriptor for a synthesized side-effect step. Synthetic
    /// steps always preserve the item type of the position they are inserted
    /// at.
    pub fn synthetic(id: StepId, item_type: TypeTag, execution_mode: ExecutionMode) -> Self {
        Self {
            id,
            input: item_type,
            output: item_type,
            cardinality: Cardinality::SideEffect,
            execution_mode,
            synthetic: true,
        }
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn input(&self) -> &TypeTag {
        &self.input
    }

    pub fn output(&self) -> &TypeTag {
        &self.output
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

/// Streaming shape of the pipeline at a point in the chain.
///
/// The orchestrator folds this over the step cardinalities to decide whether
/// the run boundary accepts/produces a single item or a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShape {
    Single,
    Stream,
}

impl StreamShape {
    /// Applies one step's cardinality to the current shape.
    pub fn apply(self, cardinality: Cardinality) -> StreamShape {
        match cardinality {
            Cardinality::OneToOne | Cardinality::SideEffect => self,
            Cardinality::OneToMany | Cardinality::ManyToMany => StreamShape::Stream,
            Cardinality::ManyToOne => StreamShape::Single,
        }
    }
}
