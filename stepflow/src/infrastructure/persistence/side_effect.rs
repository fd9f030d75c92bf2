// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persistence Side-Effect
//!
//! Persists each item through a provider selected by `supports(item)` and
//! thread context, then passes the item through unchanged. Duplicate-key
//! handling is policy driven:
//!
//! - `fail`: the duplicate propagates as a non-retryable failure;
//! - `ignore`: the duplicate counts as success (idempotent re-submission);
//! - `upsert`: retried through `persist_or_update`.
//!
//! Transient backend faults stay retryable and flow into the surrounding
//! step wrapper's retry budget; all other faults are wrapped non-retryable.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use stepflow_domain::{
    AnyItem, AspectSpec, Envelope, PersistenceFault, PersistenceProvider, PipelineError, ThreadContext, ThreadSafety,
};

use crate::infrastructure::config::settings::Profile;
use crate::infrastructure::persistence::classify::{classify, is_duplicate_key};
use crate::infrastructure::runtime::step_executor::EnvelopeEffect;

/// Aspect config key selecting the duplicate-key policy.
pub const CONFIG_DUPLICATE_KEY: &str = "duplicate-key";

/// Behavior when the backend reports a duplicate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKeyPolicy {
    #[default]
    Fail,
    Ignore,
    Upsert,
}

impl std::str::FromStr for DuplicateKeyPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(DuplicateKeyPolicy::Fail),
            "ignore" => Ok(DuplicateKeyPolicy::Ignore),
            "upsert" => Ok(DuplicateKeyPolicy::Upsert),
            _ => Err(PipelineError::invalid_config(format!(
                "Unknown duplicate-key policy: {}",
                s
            ))),
        }
    }
}

struct RegisteredProvider {
    provider: Arc<dyn PersistenceProvider>,
    serializer: Option<Arc<Mutex<()>>>,
}

/// Registry plus arbitration of persistence providers, mirroring the cache
/// provider selection rules.
pub struct PersistenceRegistry {
    providers: RwLock<Vec<RegisteredProvider>>,
    selection: Option<String>,
    profile: Profile,
}

impl PersistenceRegistry {
    pub fn new(selection: Option<String>, profile: Profile) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            selection,
            profile,
        }
    }

    pub fn register(&self, provider: Arc<dyn PersistenceProvider>) {
        let serializer = match provider.thread_safety() {
            ThreadSafety::Safe => None,
            ThreadSafety::Unsafe => Some(Arc::new(Mutex::new(()))),
        };
        self.providers.write().push(RegisteredProvider { provider, serializer });
    }

    fn select(&self, item: &AnyItem, context: ThreadContext) -> Result<SelectedPersistence, PipelineError> {
        let providers = self.providers.read();
        let mut candidates: Vec<&RegisteredProvider> = providers
            .iter()
            .filter(|p| p.provider.supports(item) && p.provider.supports_thread_context(context))
            .collect();

        match candidates.len() {
            0 => Err(PipelineError::provider_selection(format!(
                "no persistence provider supports items of type {} in {:?} context",
                item.tag().name(),
                context
            ))),
            1 => Ok(SelectedPersistence::from(candidates.remove(0))),
            _ => {
                if let Some(wanted) = &self.selection {
                    if let Some(found) = candidates
                        .iter()
                        .find(|p| p.provider.item_type().name() == wanted.as_str())
                    {
                        return Ok(SelectedPersistence::from(*found));
                    }
                    return Err(PipelineError::provider_selection(format!(
                        "persistence.provider = {wanted:?} matches none of the registered providers"
                    )));
                }
                match self.profile {
                    Profile::Prod => Err(PipelineError::provider_selection(
                        "multiple persistence providers registered; set persistence.provider to pick one",
                    )),
                    Profile::Dev => {
                        let chosen = candidates.remove(0);
                        warn!(
                            item_type = chosen.provider.item_type().name(),
                            "multiple persistence providers registered, using the first (dev profile)"
                        );
                        Ok(SelectedPersistence::from(chosen))
                    }
                }
            }
        }
    }
}

struct SelectedPersistence {
    provider: Arc<dyn PersistenceProvider>,
    serializer: Option<Arc<Mutex<()>>>,
}

impl From<&RegisteredProvider> for SelectedPersistence {
    fn from(registered: &RegisteredProvider) -> Self {
        Self {
            provider: Arc::clone(&registered.provider),
            serializer: registered.serializer.clone(),
        }
    }
}

impl SelectedPersistence {
    async fn persist(&self, entity: &AnyItem) -> Result<(), PersistenceFault> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.persist(entity).await
    }

    async fn persist_or_update(&self, entity: &AnyItem) -> Result<(), PersistenceFault> {
        let _guard = match &self.serializer {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        self.provider.persist_or_update(entity).await
    }
}

/// The persistence side-effect behind the `persist` aspect.
pub struct PersistEffect {
    registry: Arc<PersistenceRegistry>,
    policy: DuplicateKeyPolicy,
    thread_context: ThreadContext,
}

impl PersistEffect {
    pub fn new(registry: Arc<PersistenceRegistry>, aspect: &AspectSpec, thread_context: ThreadContext) -> Self {
        let policy = match aspect.config_value(CONFIG_DUPLICATE_KEY) {
            None => DuplicateKeyPolicy::default(),
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(
                    aspect = %aspect.name,
                    policy = raw,
                    "invalid duplicate-key policy in aspect config, using fail"
                );
                DuplicateKeyPolicy::Fail
            }),
        };
        Self {
            registry,
            policy,
            thread_context,
        }
    }
}

#[async_trait]
impl EnvelopeEffect for PersistEffect {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let provider = self.registry.select(envelope.item(), self.thread_context)?;

        match provider.persist(envelope.item()).await {
            Ok(()) => Ok(()),
            Err(fault) if is_duplicate_key(&fault) => match self.policy {
                DuplicateKeyPolicy::Fail => Err(PipelineError::DuplicateKey(fault.to_string())),
                DuplicateKeyPolicy::Ignore => {
                    debug!(item_type = envelope.item().tag().name(), "duplicate key ignored");
                    Ok(())
                }
                DuplicateKeyPolicy::Upsert => provider
                    .persist_or_update(envelope.item())
                    .await
                    .map_err(|fault| classify(&fault)),
            },
            Err(fault) => Err(classify(&fault)),
        }
    }
}
