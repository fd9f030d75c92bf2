// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! In-process cache provider for tests and dev profiles. Entries are held as
//! shared erased items (no serialization); TTL expiry is lazy. Supports
//! prefix enumeration, so bulk invalidation by input type works against it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use stepflow_domain::{AnyItem, CacheKey, CacheProvider, PipelineError, ThreadContext, ThreadSafety, TypeTag};

struct Entry {
    value: AnyItem,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Shared in-memory cache keyed by the namespaced cache key string.
pub struct InMemoryCacheProvider {
    backend: String,
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCacheProvider {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) entries; test helper.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheProvider for InMemoryCacheProvider {
    fn item_type(&self) -> TypeTag {
        // Holds erased items of any type; the tag is informational only.
        TypeTag::of::<AnyItem>()
    }

    fn supports(&self, _item: &AnyItem) -> bool {
        true
    }

    fn supports_thread_context(&self, _context: ThreadContext) -> bool {
        true
    }

    fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::Safe
    }

    fn backend(&self) -> &str {
        &self.backend
    }

    fn supports_prefix_enumeration(&self) -> bool {
        true
    }

    async fn cache(&self, key: &CacheKey, value: AnyItem, ttl: Option<Duration>) -> Result<(), PipelineError> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<AnyItem>, PipelineError> {
        let entries = self.entries.read();
        Ok(entries
            .get(key.as_str())
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, PipelineError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), PipelineError> {
        self.entries.write().remove(key.as_str());
        Ok(())
    }

    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64, PipelineError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
