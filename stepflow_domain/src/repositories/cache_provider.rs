// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Provider SPI
//!
//! Contract for pluggable cache backends. Providers are process-wide
//! singletons selected per call by item support and thread context; the core
//! never assumes a concrete backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::entities::{ThreadContext, ThreadSafety};
use crate::value_objects::{AnyItem, CacheKey, TypeTag};
use crate::PipelineError;

/// Pluggable cache backend.
///
/// Values are stored as erased items; in-process backends may hold them
/// directly, remote backends serialize however they see fit. Providers
/// declaring `ThreadSafety::Unsafe` are serialized behind a per-provider
/// mutex by the selection layer, so implementations may assume exclusive
/// access in that case.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Item type this provider serves, used for diagnostics.
    fn item_type(&self) -> TypeTag;

    /// Whether this provider can cache the given item.
    fn supports(&self, item: &AnyItem) -> bool;

    /// Whether this provider may be called from the given thread context.
    fn supports_thread_context(&self, context: ThreadContext) -> bool;

    fn thread_safety(&self) -> ThreadSafety;

    /// Backend name used by `cache.provider` configuration, e.g. `memory`.
    fn backend(&self) -> &str;

    /// Whether `invalidate_by_prefix` is available. Bulk invalidation by
    /// input type requires prefix enumeration.
    fn supports_prefix_enumeration(&self) -> bool {
        false
    }

    async fn cache(&self, key: &CacheKey, value: AnyItem, ttl: Option<Duration>) -> Result<(), PipelineError>;

    async fn get(&self, key: &CacheKey) -> Result<Option<AnyItem>, PipelineError>;

    async fn exists(&self, key: &CacheKey) -> Result<bool, PipelineError>;

    async fn invalidate(&self, key: &CacheKey) -> Result<(), PipelineError>;

    /// Invalidates every key starting with `prefix`. Backends without prefix
    /// enumeration return a provider-selection error.
    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64, PipelineError>;
}
