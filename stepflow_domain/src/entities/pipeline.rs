// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Model
//!
//! The declarative description a client hands to the orchestrator: an ordered
//! list of step references plus the aspect table. The model carries no
//! behavior; implementations are looked up in the step registry at build time
//! and the model's optional type annotations are validated against what the
//! registered steps actually declare.

use serde::{Deserialize, Serialize};

use crate::entities::aspect::AspectSpec;
use crate::entities::step::{Cardinality, ExecutionMode, StepDescriptor};
use crate::value_objects::StepId;
use crate::PipelineError;

/// One entry in the declared step chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepModel {
    pub id: StepId,
    /// Optional fully qualified input type name, validated against the
    /// registered implementation when present.
    #[serde(default)]
    pub input_type: Option<String>,
    /// Optional fully qualified output type name.
    #[serde(default)]
    pub output_type: Option<String>,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl StepModel {
    pub fn new(id: StepId, cardinality: Cardinality) -> Self {
        Self {
            id,
            input_type: None,
            output_type: None,
            cardinality,
            execution_mode: ExecutionMode::Default,
        }
    }

    /// Checks the model entry against the descriptor of the registered step.
    pub fn check_against(&self, descriptor: &StepDescriptor) -> Result<(), PipelineError> {
        if self.cardinality != descriptor.cardinality() {
            return Err(PipelineError::invalid_config(format!(
                "step '{}' is declared {} but registered as {}",
                self.id,
                self.cardinality,
                descriptor.cardinality()
            )));
        }
        if let Some(expected) = &self.input_type {
            if expected != descriptor.input().name() {
                return Err(PipelineError::invalid_config(format!(
                    "step '{}' declares input type {} but the implementation takes {}",
                    self.id,
                    expected,
                    descriptor.input().name()
                )));
            }
        }
        if let Some(expected) = &self.output_type {
            if expected != descriptor.output().name() {
                return Err(PipelineError::invalid_config(format!(
                    "step '{}' declares output type {} but the implementation produces {}",
                    self.id,
                    expected,
                    descriptor.output().name()
                )));
            }
        }
        Ok(())
    }
}

/// Declarative pipeline: ordered steps plus the aspect table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineModel {
    pub name: String,
    pub steps: Vec<StepModel>,
    #[serde(default)]
    pub aspects: Vec<AspectSpec>,
}

impl PipelineModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            aspects: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepModel) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_aspect(mut self, aspect: AspectSpec) -> Self {
        self.aspects.push(aspect);
        self
    }

    /// Structural validation independent of the step registry: a non-empty
    /// chain, unique ids, well-formed aspects whose targets exist.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.is_empty() {
            return Err(PipelineError::invalid_config("pipeline name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(PipelineError::invalid_config(format!(
                "pipeline '{}' must declare at least one step",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(PipelineError::invalid_config(format!(
                    "duplicate step id '{}' in pipeline '{}'",
                    step.id, self.name
                )));
            }
        }
        for aspect in &self.aspects {
            aspect.validate()?;
            for target in &aspect.target_steps {
                if !self.steps.iter().any(|s| &s.id == target) {
                    return Err(PipelineError::invalid_config(format!(
                        "aspect '{}' targets unknown step '{}'",
                        aspect.name, target
                    )));
                }
            }
        }
        Ok(())
    }

    /// Identity used to cache the built pipeline. Two models with the same
    /// identity resolve to the same executable chain.
    pub fn identity(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        for step in &self.steps {
            step.id.as_str().hash(&mut hasher);
            step.cardinality.to_string().hash(&mut hasher);
        }
        for aspect in &self.aspects {
            aspect.name.hash(&mut hasher);
            aspect.enabled.hash(&mut hasher);
            aspect.order.hash(&mut hasher);
        }
        format!("{}#{:016x}", self.name, hasher.finish())
    }
}

/// Checks producer/consumer type compatibility across adjacent descriptors.
///
/// Side-effect steps preserve their item type, so synthetic insertions can
/// never break a chain that was valid before expansion.
pub fn validate_chain(descriptors: &[StepDescriptor]) -> Result<(), PipelineError> {
    for pair in descriptors.windows(2) {
        let (producer, consumer) = (&pair[0], &pair[1]);
        if producer.output() != consumer.input() {
            return Err(PipelineError::IncompatibleChain(format!(
                "step '{}' produces {} but step '{}' consumes {}",
                producer.id(),
                producer.output().name(),
                consumer.id(),
                consumer.input().name()
            )));
        }
    }
    Ok(())
}
