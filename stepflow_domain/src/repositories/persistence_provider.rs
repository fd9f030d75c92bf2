// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persistence Provider SPI
//!
//! Contract for pluggable persistence backends used by the persistence
//! side-effect. The framework owns no persisted state; rows belong to the
//! provider. Backend failures are reported through `PersistenceFault`, which
//! carries enough structure (SQL state, message) for the side-effect to
//! classify duplicates and transient conditions.

use async_trait::async_trait;

use crate::entities::{ThreadContext, ThreadSafety};
use crate::value_objects::{AnyItem, TypeTag};

/// Structured failure raised by a persistence backend.
///
/// The optional `sql_state` follows SQLSTATE conventions (`23505` duplicate
/// key, `08xxx` connection family); message-based classification covers
/// backends without SQL states.
#[derive(Debug, Clone)]
pub struct PersistenceFault {
    pub message: String,
    pub sql_state: Option<String>,
}

impl std::fmt::Display for PersistenceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "persistence fault [{}]: {}", state, self.message),
            None => write!(f, "persistence fault: {}", self.message),
        }
    }
}

impl std::error::Error for PersistenceFault {}

impl PersistenceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
        }
    }

    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }
}

/// Pluggable persistence backend.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Entity type this provider persists.
    fn item_type(&self) -> TypeTag;

    /// Whether this provider can persist the given item.
    fn supports(&self, item: &AnyItem) -> bool;

    /// Whether this provider may be called from the given thread context.
    fn supports_thread_context(&self, context: ThreadContext) -> bool;

    fn thread_safety(&self) -> ThreadSafety;

    /// Inserts the entity; duplicate keys surface as a fault with SQL state
    /// `23505` or a recognizable message.
    async fn persist(&self, entity: &AnyItem) -> Result<(), PersistenceFault>;

    /// Inserts or updates the entity (duplicate-key policy `upsert`).
    async fn persist_or_update(&self, entity: &AnyItem) -> Result<(), PersistenceFault>;
}
