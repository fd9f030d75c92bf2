// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Aspects
//!
//! Aspects are declarative cross-cutting concerns (caching, persistence,
//! invalidation) expanded into synthetic side-effect steps inserted before or
//! after target steps. An aspect never changes the item type at its insertion
//! point, so expansion cannot break chain compatibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value_objects::StepId;
use crate::PipelineError;

/// Which steps an aspect applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectScope {
    /// Every non-synthetic step in the pipeline.
    Global,
    /// Only the steps listed in `target_steps`.
    Steps,
}

/// Where the synthetic step is inserted relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AspectPosition {
    BeforeStep,
    AfterStep,
}

/// Declarative specification of one aspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectSpec {
    /// Lower-kebab name matching a registered aspect implementation.
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub scope: AspectScope,
    pub position: AspectPosition,
    /// Ascending order = earlier within the same position.
    #[serde(default)]
    pub order: i32,
    /// Targets consulted when `scope` is `Steps`.
    #[serde(default)]
    pub target_steps: Vec<StepId>,
    /// Implementation-specific settings (cache policy, TTL, duplicate-key
    /// policy, ...).
    #[serde(default)]
    pub config: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl AspectSpec {
    pub fn new(name: impl Into<String>, scope: AspectScope, position: AspectPosition) -> Result<Self, PipelineError> {
        let spec = Self {
            name: name.into(),
            enabled: true,
            scope,
            position,
            order: 0,
            target_steps: Vec::new(),
            config: HashMap::new(),
        };
        spec.validate_name()?;
        Ok(spec)
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_targets(mut self, targets: Vec<StepId>) -> Self {
        self.target_steps = targets;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate_name(&self) -> Result<(), PipelineError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(PipelineError::invalid_config(format!(
                "aspect name must be lower-kebab: {:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// Validates the aspect name (lower-kebab) and scope consistency.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.validate_name()?;
        if self.scope == AspectScope::Steps && self.target_steps.is_empty() {
            return Err(PipelineError::invalid_config(format!(
                "aspect '{}' has scope=steps but no target steps",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether this aspect applies to the given step id.
    pub fn applies_to(&self, step: &StepId) -> bool {
        match self.scope {
            AspectScope::Global => true,
            AspectScope::Steps => self.target_steps.contains(step),
        }
    }

    /// Reads a config entry.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}
