// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Registry
//!
//! Binds step ids from the declarative pipeline model to typed step
//! implementations. Registration captures the item types and options at
//! compile time; the registry erases them behind a builder interface the
//! orchestrator drives when materializing a pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use stepflow_domain::{
    Cardinality, ExecutionMode, ManyToManyStep, ManyToOneStep, OneToManyStep, OneToOneStep, PipelineError,
    PipelineItem, RuntimeStep, SideEffectStep, StepDescriptor, StepId, StepModel, StepOptions, TypeTag,
};

use crate::infrastructure::config::resolver::StepConfigResolver;
use crate::infrastructure::runtime::step_executor::StepEngine;

/// Everything a builder needs to materialize its step.
pub struct BuildContext<'a> {
    pub engine: &'a StepEngine,
    pub resolver: &'a StepConfigResolver,
}

/// Erased registered step.
pub trait StepBuilder: Send + Sync {
    /// Descriptor from the registered types plus the model entry; validates
    /// that the model's declared cardinality and type annotations match the
    /// implementation.
    fn descriptor(&self, model: &StepModel) -> Result<StepDescriptor, PipelineError>;

    fn build(&self, descriptor: StepDescriptor, ctx: &BuildContext<'_>) -> Result<Arc<dyn RuntimeStep>, PipelineError>;
}

fn resolve_mode<I>(model: &StepModel, options: &StepOptions<I>) -> ExecutionMode {
    // The model's declarative mode wins unless it is the default.
    match model.execution_mode {
        ExecutionMode::Default => options.execution_mode,
        mode => mode,
    }
}

macro_rules! shaped_builder {
    ($name:ident, $trait:ident, $cardinality:expr, $wrap:ident) => {
        struct $name<I: PipelineItem, O: PipelineItem> {
            id: StepId,
            step: Arc<dyn $trait<I, O>>,
            options: StepOptions<I>,
        }

        impl<I: PipelineItem, O: PipelineItem> StepBuilder for $name<I, O> {
            fn descriptor(&self, model: &StepModel) -> Result<StepDescriptor, PipelineError> {
                let descriptor = StepDescriptor::new(
                    self.id.clone(),
                    TypeTag::of::<I>(),
                    TypeTag::of::<O>(),
                    $cardinality,
                    resolve_mode(model, &self.options),
                )?;
                model.check_against(&descriptor)?;
                Ok(descriptor)
            }

            fn build(
                &self,
                descriptor: StepDescriptor,
                ctx: &BuildContext<'_>,
            ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
                let config = ctx.resolver.resolve(&self.id, &self.options.config)?;
                ctx.engine
                    .$wrap(descriptor, Arc::clone(&self.step), self.options.clone(), config)
            }
        }
    };
}

shaped_builder!(OneToOneBuilder, OneToOneStep, Cardinality::OneToOne, wrap_one_to_one);
shaped_builder!(OneToManyBuilder, OneToManyStep, Cardinality::OneToMany, wrap_one_to_many);
shaped_builder!(ManyToOneBuilder, ManyToOneStep, Cardinality::ManyToOne, wrap_many_to_one);
shaped_builder!(ManyToManyBuilder, ManyToManyStep, Cardinality::ManyToMany, wrap_many_to_many);

struct SideEffectBuilder<I: PipelineItem> {
    id: StepId,
    step: Arc<dyn SideEffectStep<I>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem> StepBuilder for SideEffectBuilder<I> {
    fn descriptor(&self, model: &StepModel) -> Result<StepDescriptor, PipelineError> {
        let descriptor = StepDescriptor::new(
            self.id.clone(),
            TypeTag::of::<I>(),
            TypeTag::of::<I>(),
            Cardinality::SideEffect,
            resolve_mode(model, &self.options),
        )?;
        model.check_against(&descriptor)?;
        Ok(descriptor)
    }

    fn build(&self, descriptor: StepDescriptor, ctx: &BuildContext<'_>) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let config = ctx.resolver.resolve(&self.id, &self.options.config)?;
        ctx.engine
            .wrap_side_effect(descriptor, Arc::clone(&self.step), self.options.clone(), config)
    }
}

/// Registry of step implementations keyed by step id.
#[derive(Default)]
pub struct StepRegistry {
    builders: RwLock<HashMap<StepId, Arc<dyn StepBuilder>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: StepId, builder: Arc<dyn StepBuilder>) -> Result<(), PipelineError> {
        let mut builders = self.builders.write();
        if builders.contains_key(&id) {
            return Err(PipelineError::invalid_config(format!(
                "step '{id}' is already registered"
            )));
        }
        builders.insert(id, builder);
        Ok(())
    }

    pub fn register_one_to_one<I: PipelineItem, O: PipelineItem>(
        &self,
        id: &str,
        step: impl OneToOneStep<I, O> + 'static,
        options: StepOptions<I>,
    ) -> Result<(), PipelineError> {
        let id = StepId::new(id)?;
        self.insert(
            id.clone(),
            Arc::new(OneToOneBuilder {
                id,
                step: Arc::new(step),
                options,
            }),
        )
    }

    pub fn register_one_to_many<I: PipelineItem, O: PipelineItem>(
        &self,
        id: &str,
        step: impl OneToManyStep<I, O> + 'static,
        options: StepOptions<I>,
    ) -> Result<(), PipelineError> {
        let id = StepId::new(id)?;
        self.insert(
            id.clone(),
            Arc::new(OneToManyBuilder {
                id,
                step: Arc::new(step),
                options,
            }),
        )
    }

    pub fn register_many_to_one<I: PipelineItem, O: PipelineItem>(
        &self,
        id: &str,
        step: impl ManyToOneStep<I, O> + 'static,
        options: StepOptions<I>,
    ) -> Result<(), PipelineError> {
        let id = StepId::new(id)?;
        self.insert(
            id.clone(),
            Arc::new(ManyToOneBuilder {
                id,
                step: Arc::new(step),
                options,
            }),
        )
    }

    pub fn register_many_to_many<I: PipelineItem, O: PipelineItem>(
        &self,
        id: &str,
        step: impl ManyToManyStep<I, O> + 'static,
        options: StepOptions<I>,
    ) -> Result<(), PipelineError> {
        let id = StepId::new(id)?;
        self.insert(
            id.clone(),
            Arc::new(ManyToManyBuilder {
                id,
                step: Arc::new(step),
                options,
            }),
        )
    }

    pub fn register_side_effect<I: PipelineItem>(
        &self,
        id: &str,
        step: impl SideEffectStep<I> + 'static,
        options: StepOptions<I>,
    ) -> Result<(), PipelineError> {
        let id = StepId::new(id)?;
        self.insert(
            id.clone(),
            Arc::new(SideEffectBuilder {
                id,
                step: Arc::new(step),
                options,
            }),
        )
    }

    pub fn get(&self, id: &StepId) -> Result<Arc<dyn StepBuilder>, PipelineError> {
        self.builders
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::StepNotFound(format!("no step registered under id '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Identity;

    #[async_trait]
    impl OneToOneStep<String, String> for Identity {
        async fn apply(&self, input: String) -> Result<String, PipelineError> {
            Ok(input)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = StepRegistry::new();
        registry
            .register_one_to_one("identity", Identity, StepOptions::default())
            .unwrap();
        assert!(registry.get(&StepId::new("identity").unwrap()).is_ok());
        assert!(registry.get(&StepId::new("missing").unwrap()).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = StepRegistry::new();
        registry
            .register_one_to_one("identity", Identity, StepOptions::default())
            .unwrap();
        assert!(registry
            .register_one_to_one("identity", Identity, StepOptions::default())
            .is_err());
    }

    #[test]
    fn test_descriptor_checks_model_cardinality() {
        let registry = StepRegistry::new();
        registry
            .register_one_to_one("identity", Identity, StepOptions::default())
            .unwrap();
        let builder = registry.get(&StepId::new("identity").unwrap()).unwrap();

        let ok = StepModel::new(StepId::new("identity").unwrap(), Cardinality::OneToOne);
        assert!(builder.descriptor(&ok).is_ok());

        let wrong = StepModel::new(StepId::new("identity").unwrap(), Cardinality::OneToMany);
        assert!(builder.descriptor(&wrong).is_err());
    }

    #[test]
    fn test_descriptor_checks_type_annotation() {
        let registry = StepRegistry::new();
        registry
            .register_one_to_one("identity", Identity, StepOptions::default())
            .unwrap();
        let builder = registry.get(&StepId::new("identity").unwrap()).unwrap();

        let mut model = StepModel::new(StepId::new("identity").unwrap(), Cardinality::OneToOne);
        model.input_type = Some("alloc::string::String".to_string());
        assert!(builder.descriptor(&model).is_ok());

        model.input_type = Some("u64".to_string());
        assert!(builder.descriptor(&model).is_err());
    }
}
