// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Aspect Expansion
//!
//! Pure expansion of a declared step chain plus an aspect table into the
//! executable step sequence. For each non-synthetic step, matching BEFORE
//! aspects insert a synthetic side-effect step immediately before it (typed
//! as the step's input) and AFTER aspects immediately after it (typed as the
//! step's output). Aspects within the same position apply in ascending
//! `order`, ties broken by name.
//!
//! Expansion is deterministic: the same steps and aspects always yield the
//! same sequence, and synthetic ids are stable so telemetry series survive
//! restarts.

use crate::entities::{AspectPosition, AspectSpec, ExecutionMode, StepDescriptor};
use crate::value_objects::{StepId, TypeTag};
use crate::PipelineError;

/// One entry of the expanded pipeline.
#[derive(Debug, Clone)]
pub enum ExpandedStep {
    /// A step declared in the pipeline model.
    User(StepDescriptor),
    /// A side-effect step synthesized from an aspect.
    Synthetic(SyntheticStep),
}

impl ExpandedStep {
    pub fn descriptor(&self) -> &StepDescriptor {
        match self {
            ExpandedStep::User(descriptor) => descriptor,
            ExpandedStep::Synthetic(synthetic) => &synthetic.descriptor,
        }
    }
}

/// A synthesized side-effect step bound to its originating aspect and target.
#[derive(Debug, Clone)]
pub struct SyntheticStep {
    pub aspect: AspectSpec,
    pub target: StepId,
    pub descriptor: StepDescriptor,
}

/// Stable id of a synthesized step: `observe-<aspect>-<type>-side-effect`.
/// Whitespace in generic type names is stripped so the id stays a valid
/// step id.
pub fn synthetic_step_id(aspect_name: &str, item_type: &TypeTag) -> Result<StepId, PipelineError> {
    let type_part: String = item_type
        .short_name()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    StepId::new(format!("observe-{}-{}-side-effect", aspect_name, type_part))
}

/// Expands `steps` against `aspects`.
///
/// Disabled aspects are skipped entirely. The result preserves the declared
/// step order; side-effect steps never change the item type at their
/// insertion point, so a chain that was type-consistent before expansion
/// stays consistent after it.
pub fn expand(steps: &[StepDescriptor], aspects: &[AspectSpec]) -> Result<Vec<ExpandedStep>, PipelineError> {
    let mut before: Vec<&AspectSpec> = aspects
        .iter()
        .filter(|a| a.enabled && a.position == AspectPosition::BeforeStep)
        .collect();
    let mut after: Vec<&AspectSpec> = aspects
        .iter()
        .filter(|a| a.enabled && a.position == AspectPosition::AfterStep)
        .collect();
    before.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
    after.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    let mut expanded = Vec::with_capacity(steps.len() * (1 + aspects.len()));
    for step in steps {
        if step.is_synthetic() {
            expanded.push(ExpandedStep::User(step.clone()));
            continue;
        }
        for aspect in &before {
            if aspect.applies_to(step.id()) {
                expanded.push(ExpandedStep::Synthetic(synthesize(aspect, step, *step.input())?));
            }
        }
        expanded.push(ExpandedStep::User(step.clone()));
        for aspect in &after {
            if aspect.applies_to(step.id()) {
                expanded.push(ExpandedStep::Synthetic(synthesize(aspect, step, *step.output())?));
            }
        }
    }
    Ok(expanded)
}

fn synthesize(aspect: &AspectSpec, target: &StepDescriptor, item_type: TypeTag) -> Result<SyntheticStep, PipelineError> {
    let id = synthetic_step_id(&aspect.name, &item_type)?;
    Ok(SyntheticStep {
        aspect: (*aspect).clone(),
        target: target.id().clone(),
        descriptor: StepDescriptor::synthetic(id, item_type, ExecutionMode::Default),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AspectScope, Cardinality};

    fn step(id: &str, cardinality: Cardinality) -> StepDescriptor {
        StepDescriptor::new(
            StepId::new(id).unwrap(),
            TypeTag::of::<String>(),
            TypeTag::of::<String>(),
            cardinality,
            ExecutionMode::Default,
        )
        .unwrap()
    }

    fn aspect(name: &str, position: AspectPosition, order: i32) -> AspectSpec {
        AspectSpec::new(name, AspectScope::Global, position)
            .unwrap()
            .with_order(order)
    }

    #[test]
    fn test_global_aspect_covers_every_step() {
        let steps = vec![step("a", Cardinality::OneToOne), step("b", Cardinality::OneToOne)];
        let aspects = vec![aspect("persist", AspectPosition::AfterStep, 0)];
        let expanded = expand(&steps, &aspects).unwrap();

        let synthetic: Vec<_> = expanded
            .iter()
            .filter(|e| matches!(e, ExpandedStep::Synthetic(_)))
            .collect();
        assert_eq!(synthetic.len(), steps.len());
        assert_eq!(expanded.len(), 4);
    }

    #[test]
    fn test_steps_scope_counts_targets_only() {
        let steps = vec![step("a", Cardinality::OneToOne), step("b", Cardinality::OneToOne)];
        let scoped = AspectSpec::new("persist", AspectScope::Steps, AspectPosition::AfterStep)
            .unwrap()
            .with_targets(vec![StepId::new("b").unwrap()]);
        let expanded = expand(&steps, &[scoped]).unwrap();

        let synthetic: Vec<_> = expanded
            .iter()
            .filter_map(|e| match e {
                ExpandedStep::Synthetic(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(synthetic.len(), 1);
        assert_eq!(synthetic[0].target.as_str(), "b");
    }

    #[test]
    fn test_before_and_after_positions() {
        let steps = vec![step("a", Cardinality::OneToOne)];
        let aspects = vec![
            aspect("audit", AspectPosition::BeforeStep, 0),
            aspect("persist", AspectPosition::AfterStep, 0),
        ];
        let expanded = expand(&steps, &aspects).unwrap();
        assert!(matches!(&expanded[0], ExpandedStep::Synthetic(s) if s.aspect.name == "audit"));
        assert!(matches!(&expanded[1], ExpandedStep::User(_)));
        assert!(matches!(&expanded[2], ExpandedStep::Synthetic(s) if s.aspect.name == "persist"));
    }

    #[test]
    fn test_order_then_name_tie_break() {
        let steps = vec![step("a", Cardinality::OneToOne)];
        let aspects = vec![
            aspect("zeta", AspectPosition::BeforeStep, 1),
            aspect("beta", AspectPosition::BeforeStep, 1),
            aspect("omega", AspectPosition::BeforeStep, 0),
        ];
        let expanded = expand(&steps, &aspects).unwrap();
        let names: Vec<_> = expanded
            .iter()
            .filter_map(|e| match e {
                ExpandedStep::Synthetic(s) => Some(s.aspect.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["omega", "beta", "zeta"]);
    }

    #[test]
    fn test_disabled_aspects_skipped() {
        let steps = vec![step("a", Cardinality::OneToOne)];
        let aspects = vec![aspect("persist", AspectPosition::AfterStep, 0).disabled()];
        let expanded = expand(&steps, &aspects).unwrap();
        assert_eq!(expanded.len(), 1);
    }

    #[test]
    fn test_synthetic_id_format() {
        let id = synthetic_step_id("cache", &TypeTag::of::<String>()).unwrap();
        assert_eq!(id.as_str(), "observe-cache-string-side-effect");
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let steps = vec![step("a", Cardinality::OneToOne), step("b", Cardinality::OneToMany)];
        let aspects = vec![
            aspect("cache", AspectPosition::BeforeStep, 0),
            aspect("persist", AspectPosition::AfterStep, 1),
        ];
        let first: Vec<String> = expand(&steps, &aspects)
            .unwrap()
            .iter()
            .map(|e| e.descriptor().id().to_string())
            .collect();
        let second: Vec<String> = expand(&steps, &aspects)
            .unwrap()
            .iter()
            .map(|e| e.descriptor().id().to_string())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_side_effect_steps_preserve_chain_types() {
        let steps = vec![step("a", Cardinality::OneToOne), step("b", Cardinality::OneToOne)];
        let aspects = vec![
            aspect("cache", AspectPosition::BeforeStep, 0),
            aspect("persist", AspectPosition::AfterStep, 0),
        ];
        let expanded = expand(&steps, &aspects).unwrap();
        let descriptors: Vec<_> = expanded.iter().map(|e| e.descriptor().clone()).collect();
        assert!(crate::entities::validate_chain(&descriptors).is_ok());
    }
}
