// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Subsystem
//!
//! Key derivation, provider selection, policy enforcement, and replay
//! invalidation. The subsystem itself is a passive bundle of registries; the
//! aspect binder turns it into synthetic side-effect steps around the target
//! steps of the `cache` aspect family.

pub mod invalidation;
pub mod key_strategy;
pub mod memory;
pub mod policy;
pub mod provider_registry;

use std::sync::Arc;
use std::time::Duration;

use stepflow_domain::{CacheProvider, PipelineItem};

use crate::infrastructure::config::settings::{CacheSettings, Profile};

pub use invalidation::{BulkInvalidationEffect, PerItemInvalidationEffect};
pub use key_strategy::{CacheKeyRegistry, CacheKeySpec};
pub use memory::InMemoryCacheProvider;
pub use policy::{CacheReadEffect, CacheWriteEffect};
pub use provider_registry::{CacheProviderRegistry, SelectedCache};

/// Process-wide cache registries plus settings.
pub struct CacheSubsystem {
    keys: CacheKeyRegistry,
    providers: CacheProviderRegistry,
    default_ttl: Option<Duration>,
}

impl CacheSubsystem {
    pub fn new(settings: &CacheSettings, profile: Profile) -> Self {
        Self {
            keys: CacheKeyRegistry::new(),
            providers: CacheProviderRegistry::new(settings.provider.clone(), profile),
            default_ttl: settings.default_ttl(),
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn CacheProvider>) {
        self.providers.register(provider);
    }

    pub fn register_key_spec<T: PipelineItem>(&self, spec: CacheKeySpec<T>) {
        self.keys.register(spec);
    }

    pub fn keys(&self) -> &CacheKeyRegistry {
        &self.keys
    }

    pub fn providers(&self) -> &CacheProviderRegistry {
        &self.providers
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }
}
