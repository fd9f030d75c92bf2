// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! In-process persistence provider for tests and dev profiles. Rows live in
//! a map keyed by a caller-supplied identity accessor; duplicate inserts
//! surface the standard `23505` SQL state so the duplicate-key policies can
//! be exercised without a real database.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use stepflow_domain::{
    AnyItem, PersistenceFault, PersistenceProvider, PipelineItem, ThreadContext, ThreadSafety, TypeTag,
};

/// Typed in-memory row store.
pub struct InMemoryPersistenceProvider<T: PipelineItem> {
    rows: RwLock<HashMap<String, T>>,
    identity: Box<dyn Fn(&T) -> String + Send + Sync>,
}

impl<T: PipelineItem> InMemoryPersistenceProvider<T> {
    pub fn new(identity: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            identity: Box::new(identity),
        }
    }

    /// Number of persisted rows; test helper.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.rows.read().get(id).cloned()
    }
}

#[async_trait]
impl<T: PipelineItem> PersistenceProvider for InMemoryPersistenceProvider<T> {
    fn item_type(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn supports(&self, item: &AnyItem) -> bool {
        item.tag().is::<T>()
    }

    fn supports_thread_context(&self, _context: ThreadContext) -> bool {
        true
    }

    fn thread_safety(&self) -> ThreadSafety {
        ThreadSafety::Safe
    }

    async fn persist(&self, entity: &AnyItem) -> Result<(), PersistenceFault> {
        let row: T = entity
            .downcast_cloned::<T>()
            .ok_or_else(|| PersistenceFault::new(format!("unsupported entity type {}", entity.tag().name())))?;
        let id = (self.identity)(&row);
        let mut rows = self.rows.write();
        if rows.contains_key(&id) {
            return Err(
                PersistenceFault::new(format!("duplicate key value violates unique constraint: {id}"))
                    .with_sql_state("23505"),
            );
        }
        rows.insert(id, row);
        Ok(())
    }

    async fn persist_or_update(&self, entity: &AnyItem) -> Result<(), PersistenceFault> {
        let row: T = entity
            .downcast_cloned::<T>()
            .ok_or_else(|| PersistenceFault::new(format!("unsupported entity type {}", entity.tag().name())))?;
        let id = (self.identity)(&row);
        self.rows.write().insert(id, row);
        Ok(())
    }
}
