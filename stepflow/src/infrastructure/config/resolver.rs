// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Configuration Resolver
//!
//! Produces the effective `StepConfig` for each step by overlaying, bottom to
//! top: framework defaults ← global defaults from settings ← per-step
//! overrides keyed by step id ← programmatic per-step overlay from the step's
//! registration. The per-request layer from the context is applied later by
//! the engine, per envelope.
//!
//! Every layer sets exactly the fields it specifies; unset fields inherit.
//! The resolver validates each step's resolved base configuration once at
//! construction, so invalid strategies and inverted backoff bounds fail at
//! startup rather than mid-run.

use std::collections::HashMap;

use stepflow_domain::{PipelineError, StepConfig, StepConfigOverlay, StepId};

use crate::infrastructure::config::settings::FrameworkSettings;

/// Resolves per-step base configurations from layered settings.
#[derive(Debug, Clone)]
pub struct StepConfigResolver {
    global_base: StepConfig,
    per_step: HashMap<String, StepConfigOverlay>,
}

impl StepConfigResolver {
    /// Builds a resolver from the loaded settings, validating the global
    /// layer eagerly.
    pub fn from_settings(settings: &FrameworkSettings) -> Result<Self, PipelineError> {
        let global_base = StepConfig::framework_defaults().overlaid(&settings.step_defaults);
        global_base.validate()?;
        // Per-step layers are validated here too: a broken override should
        // fail startup even if its step never receives an item.
        for (step_id, overlay) in &settings.steps {
            global_base.overlaid(overlay).validate().map_err(|e| {
                PipelineError::invalid_config(format!("invalid configuration for step '{step_id}': {e}"))
            })?;
        }
        Ok(Self {
            global_base,
            per_step: settings.steps.clone(),
        })
    }

    /// Effective base config for `step_id`, with `registration` applied as
    /// the topmost build-time layer.
    pub fn resolve(&self, step_id: &StepId, registration: &StepConfigOverlay) -> Result<StepConfig, PipelineError> {
        let mut config = self.global_base.clone();
        if let Some(overlay) = self.per_step.get(step_id.as_str()) {
            config = config.overlaid(overlay);
        }
        config = config.overlaid(registration);
        config.validate().map_err(|e| {
            PipelineError::invalid_config(format!("invalid configuration for step '{step_id}': {e}"))
        })?;
        Ok(config)
    }
}
