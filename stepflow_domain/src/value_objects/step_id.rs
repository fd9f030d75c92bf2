// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Identifier
//!
//! Type-safe identifier for pipeline steps. Step ids are stable strings chosen
//! by the pipeline author (or synthesized by aspect expansion) and are the key
//! for per-step configuration overrides and telemetry labels.

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// Stable unique identifier of a pipeline step.
///
/// Ids must be non-empty and free of whitespace so they can be used verbatim
/// as configuration keys and metric label values. Synthetic side-effect steps
/// receive generated ids of the form `observe-<aspect>-<type>-side-effect`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new step id, validating the invariants.
    pub fn new(id: impl Into<String>) -> Result<Self, PipelineError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PipelineError::invalid_config("step id must not be empty"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(PipelineError::invalid_config(format!(
                "step id must not contain whitespace: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for StepId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
