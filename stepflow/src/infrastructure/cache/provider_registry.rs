// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Provider Selection
//!
//! Providers are process-wide singletons registered once at startup and
//! selected per call. Selection filters by `supports(item)` and by the
//! calling step's thread context, then arbitrates among the survivors:
//!
//! - exactly one → use it;
//! - several → the `cache.provider` setting must pick one (by backend name
//!   or by served item type) in the production profile; the dev profile
//!   takes the first with a warning;
//! - none → fail fast with a provider-selection error.
//!
//! Providers declaring `ThreadSafety::Unsafe` are called under a
//! per-provider async mutex maintained here, so provider implementations
//! never need their own serialization.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::warn;

use stepflow_domain::{AnyItem, CacheKey, CacheProvider, PipelineError, ThreadContext, ThreadSafety};

use crate::infrastructure::config::settings::Profile;

struct RegisteredProvider {
    provider: Arc<dyn CacheProvider>,
    /// Present iff the provider declared `ThreadSafety::Unsafe`.
    serializer: Option<Arc<Mutex<()>>>,
}

/// Registry plus arbitration of cache providers.
pub struct CacheProviderRegistry {
    providers: RwLock<Vec<RegisteredProvider>>,
    selection: Option<String>,
    profile: Profile,
}

impl CacheProviderRegistry {
    pub fn new(selection: Option<String>, profile: Profile) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            selection,
            profile,
        }
    }

    pub fn register(&self, provider: Arc<dyn CacheProvider>) {
        let serializer = match provider.thread_safety() {
            ThreadSafety::Safe => None,
            ThreadSafety::Unsafe => Some(Arc::new(Mutex::new(()))),
        };
        self.providers.write().push(RegisteredProvider { provider, serializer });
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Selects the provider serving `item` from the given thread context.
    pub fn select(&self, item: &AnyItem, context: ThreadContext) -> Result<SelectedCache, PipelineError> {
        let providers = self.providers.read();
        let mut candidates: Vec<&RegisteredProvider> = providers
            .iter()
            .filter(|p| p.provider.supports(item) && p.provider.supports_thread_context(context))
            .collect();

        match candidates.len() {
            0 => Err(PipelineError::provider_selection(format!(
                "no cache provider supports items of type {} in {:?} context",
                item.tag().name(),
                context
            ))),
            1 => Ok(SelectedCache::from(candidates.remove(0))),
            _ => {
                if let Some(wanted) = &self.selection {
                    if let Some(found) = candidates.iter().find(|p| {
                        p.provider.backend() == wanted || p.provider.item_type().name() == wanted.as_str()
                    }) {
                        return Ok(SelectedCache::from(*found));
                    }
                    return Err(PipelineError::provider_selection(format!(
                        "cache.provider = {wanted:?} matches none of the registered providers"
                    )));
                }
                match self.profile {
                    Profile::Prod => Err(PipelineError::provider_selection(
                        "multiple cache providers registered; set cache.provider to pick one",
                    )),
                    Profile::Dev => {
                        let chosen = candidates.remove(0);
                        warn!(
                            backend = chosen.provider.backend(),
                            "multiple cache providers registered, using the first (dev profile)"
                        );
                        Ok(SelectedCache::from(chosen))
                    }
                }
            }
        }
    }
}

/// A provider plus its serialization guard, ready to be called.
pub struct SelectedCache {
    provider: Arc<dyn CacheProvider>,
    serializer: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SelectedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedCache")
            .field("provider", &self.provider.backend())
            .field("serializer", &self.serializer.is_some())
            .finish()
    }
}

impl From<&RegisteredProvider> for SelectedCache {
    fn from(registered: &RegisteredProvider) -> Self {
        Self {
            provider: Arc::clone(&registered.provider),
            serializer: registered.serializer.clone(),
        }
    }
}

impl SelectedCache {
    pub fn backend(&self) -> String {
        self.provider.backend().to_string()
    }

    pub fn supports_prefix_enumeration(&self) -> bool {
        self.provider.supports_prefix_enumeration()
    }

    pub async fn cache(&self, key: &CacheKey, value: AnyItem, ttl: Option<Duration>) -> Result<(), PipelineError> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.cache(key, value, ttl).await
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<AnyItem>, PipelineError> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.get(key).await
    }

    pub async fn exists(&self, key: &CacheKey) -> Result<bool, PipelineError> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.exists(key).await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), PipelineError> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.invalidate(key).await
    }

    pub async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64, PipelineError> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.invalidate_by_prefix(prefix).await
    }
}
