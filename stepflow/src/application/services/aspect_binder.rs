// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Aspect Binder
//!
//! Maps aspect names from the pipeline model to the side-effect
//! implementations behind them. The built-in family:
//!
//! | Aspect | Position | Effect |
//! |--------|----------|--------|
//! | `cache-read` | before | lookup / short-circuit |
//! | `cache-write` | after | policy enforcement + write |
//! | `cache-invalidate` | before | per-item replay invalidation |
//! | `cache-invalidate-bulk` | before | type-prefix replay invalidation |
//! | `persist` | any | persistence side-effect |
//!
//! Declaring the shorthand aspect `cache` normalizes into the
//! `cache-read`/`cache-write` pair around each target, which is what gives
//! the cache subsystem both its read path (BEFORE) and its write/enforce
//! path (AFTER).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use stepflow_domain::{AspectPosition, AspectSpec, PipelineError, SyntheticStep, ThreadContext};

use crate::infrastructure::cache::{
    BulkInvalidationEffect, CacheReadEffect, CacheSubsystem, CacheWriteEffect, PerItemInvalidationEffect,
};
use crate::infrastructure::persistence::{PersistEffect, PersistenceRegistry};
use crate::infrastructure::runtime::step_executor::EnvelopeEffect;

/// Builds the effect behind one synthesized step. The thread context is the
/// target step's, so providers incompatible with the target's execution mode
/// are filtered out at call time.
pub type AspectFactory =
    Arc<dyn Fn(&SyntheticStep, ThreadContext) -> Result<Arc<dyn EnvelopeEffect>, PipelineError> + Send + Sync>;

/// Registry of aspect implementations by name.
#[derive(Default)]
pub struct AspectRegistry {
    factories: RwLock<HashMap<String, AspectFactory>>,
}

impl AspectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: AspectFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    pub fn build(
        &self,
        synthetic: &SyntheticStep,
        thread_context: ThreadContext,
    ) -> Result<Arc<dyn EnvelopeEffect>, PipelineError> {
        let factories = self.factories.read();
        let factory = factories.get(&synthetic.aspect.name).ok_or_else(|| {
            PipelineError::invalid_config(format!(
                "no aspect implementation registered under name '{}'",
                synthetic.aspect.name
            ))
        })?;
        factory(synthetic, thread_context)
    }
}

/// Registers the built-in cache and persistence aspects.
pub fn register_builtin_aspects(
    registry: &AspectRegistry,
    cache: Arc<CacheSubsystem>,
    persistence: Arc<PersistenceRegistry>,
) {
    let subsystem = Arc::clone(&cache);
    registry.register(
        "cache-read",
        Arc::new(move |synthetic, context| {
            Ok(Arc::new(CacheReadEffect::new(
                Arc::clone(&subsystem),
                &synthetic.aspect,
                context,
            )))
        }),
    );

    let subsystem = Arc::clone(&cache);
    registry.register(
        "cache-write",
        Arc::new(move |synthetic, context| {
            Ok(Arc::new(CacheWriteEffect::new(
                Arc::clone(&subsystem),
                &synthetic.aspect,
                context,
            )))
        }),
    );

    let subsystem = Arc::clone(&cache);
    registry.register(
        "cache-invalidate",
        Arc::new(move |_synthetic, context| {
            Ok(Arc::new(PerItemInvalidationEffect::new(Arc::clone(&subsystem), context)))
        }),
    );

    let subsystem = Arc::clone(&cache);
    registry.register(
        "cache-invalidate-bulk",
        Arc::new(move |_synthetic, context| {
            Ok(Arc::new(BulkInvalidationEffect::new(Arc::clone(&subsystem), context)))
        }),
    );

    registry.register(
        "persist",
        Arc::new(move |synthetic, context| {
            Ok(Arc::new(PersistEffect::new(
                Arc::clone(&persistence),
                &synthetic.aspect,
                context,
            )))
        }),
    );
}

/// Expands the `cache` shorthand into its read/write pair; all other aspects
/// pass through unchanged.
pub fn normalize_aspects(aspects: &[AspectSpec]) -> Vec<AspectSpec> {
    let mut normalized = Vec::with_capacity(aspects.len() + 2);
    for aspect in aspects {
        if aspect.name == "cache" {
            let mut read = aspect.clone();
            read.name = "cache-read".to_string();
            read.position = AspectPosition::BeforeStep;
            let mut write = aspect.clone();
            write.name = "cache-write".to_string();
            write.position = AspectPosition::AfterStep;
            normalized.push(read);
            normalized.push(write);
        } else {
            normalized.push(aspect.clone());
        }
    }
    normalized
}
