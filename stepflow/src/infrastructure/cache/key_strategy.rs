// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Key Derivation
//!
//! Maps `(item, context)` to an optional namespaced cache key. Each cacheable
//! item type registers a [`CacheKeySpec`] carrying up to three accessors, in
//! descending priority:
//!
//! 1. an explicit cache-key accessor,
//! 2. a document/entity id accessor,
//! 3. a set of cacheable properties whose JSON rendering is hashed.
//!
//! The first accessor producing a non-empty string wins. If no accessor
//! yields a key the operation is skipped (the caller logs the warning). Keys
//! are always prefixed with the fully qualified item type name and, when a
//! version tag is in context, with `{tag}:`, making cross-type and
//! cross-version collisions impossible.

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use stepflow_domain::{AnyItem, CacheKey, PipelineItem, RequestContext};

type KeyAccessor = Arc<dyn Fn(&AnyItem) -> Option<String> + Send + Sync>;

/// Key accessors for one item type.
pub struct CacheKeySpec<T> {
    explicit: Option<Arc<dyn Fn(&T) -> Option<String> + Send + Sync>>,
    id: Option<Arc<dyn Fn(&T) -> Option<String> + Send + Sync>>,
    properties: Option<Arc<dyn Fn(&T) -> serde_json::Value + Send + Sync>>,
}

impl<T: PipelineItem> CacheKeySpec<T> {
    pub fn new() -> Self {
        Self {
            explicit: None,
            id: None,
            properties: None,
        }
    }

    /// Highest-priority accessor: the item's own cache key.
    pub fn with_cache_key(mut self, accessor: impl Fn(&T) -> Option<String> + Send + Sync + 'static) -> Self {
        self.explicit = Some(Arc::new(accessor));
        self
    }

    /// Mid-priority accessor: a `doc_id`/`id`-style identity.
    pub fn with_id(mut self, accessor: impl Fn(&T) -> Option<String> + Send + Sync + 'static) -> Self {
        self.id = Some(Arc::new(accessor));
        self
    }

    /// Fallback: the declared cacheable properties, hashed deterministically.
    pub fn with_properties<P: Serialize>(mut self, accessor: impl Fn(&T) -> P + Send + Sync + 'static) -> Self {
        self.properties = Some(Arc::new(move |item| {
            serde_json::to_value(accessor(item)).unwrap_or(serde_json::Value::Null)
        }));
        self
    }
}

impl<T: PipelineItem> Default for CacheKeySpec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Accessors erased over `AnyItem`, ordered by priority.
struct ErasedKeySpec {
    accessors: Vec<KeyAccessor>,
}

/// Registry of key specs by item type.
#[derive(Default)]
pub struct CacheKeyRegistry {
    specs: RwLock<HashMap<TypeId, ErasedKeySpec>>,
}

impl CacheKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the key spec for `T`.
    pub fn register<T: PipelineItem>(&self, spec: CacheKeySpec<T>) {
        let mut accessors: Vec<KeyAccessor> = Vec::new();
        if let Some(explicit) = spec.explicit {
            accessors.push(Arc::new(move |item: &AnyItem| {
                item.downcast_ref::<T>().and_then(|t| explicit(t)).filter(|k| !k.is_empty())
            }));
        }
        if let Some(id) = spec.id {
            accessors.push(Arc::new(move |item: &AnyItem| {
                item.downcast_ref::<T>().and_then(|t| id(t)).filter(|k| !k.is_empty())
            }));
        }
        if let Some(properties) = spec.properties {
            accessors.push(Arc::new(move |item: &AnyItem| {
                item.downcast_ref::<T>().map(|t| {
                    let value = properties(t);
                    let rendered = value.to_string();
                    let mut hasher = DefaultHasher::new();
                    rendered.hash(&mut hasher);
                    format!("{:016x}", hasher.finish())
                })
            }));
        }
        self.specs
            .write()
            .insert(TypeId::of::<T>(), ErasedKeySpec { accessors });
    }

    /// Derives the namespaced key for `item` under `context`, or `None` when
    /// no accessor produces a key.
    pub fn derive(&self, item: &AnyItem, context: &RequestContext) -> Option<CacheKey> {
        let specs = self.specs.read();
        let spec = specs.get(&item.tag().type_id())?;
        let raw = spec.accessors.iter().find_map(|accessor| accessor(item))?;
        Some(CacheKey::derive(context.version_tag(), item.tag().name(), &raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_domain::{RequestHeaders, RunControls};

    #[derive(Clone, serde::Serialize)]
    struct Doc {
        doc_id: String,
        body: String,
    }

    fn context(version: Option<&str>) -> RequestContext {
        let mut headers = RequestHeaders::new();
        if let Some(v) = version {
            headers.insert("version", v);
        }
        RequestContext::from_headers(&headers, RunControls::detached()).0
    }

    #[test]
    fn test_id_accessor_wins_without_explicit_key() {
        let registry = CacheKeyRegistry::new();
        registry.register(CacheKeySpec::<Doc>::new().with_id(|d| Some(d.doc_id.clone())));

        let item = AnyItem::new(Doc {
            doc_id: "d1".into(),
            body: "hello".into(),
        });
        let key = registry.derive(&item, &context(None)).unwrap();
        assert!(key.as_str().ends_with(":d1"));
        assert!(key.as_str().contains("Doc"));
    }

    #[test]
    fn test_explicit_key_beats_id() {
        let registry = CacheKeyRegistry::new();
        registry.register(
            CacheKeySpec::<Doc>::new()
                .with_cache_key(|d| Some(format!("explicit-{}", d.doc_id)))
                .with_id(|d| Some(d.doc_id.clone())),
        );

        let item = AnyItem::new(Doc {
            doc_id: "d1".into(),
            body: "hello".into(),
        });
        let key = registry.derive(&item, &context(None)).unwrap();
        assert!(key.as_str().ends_with("explicit-d1"));
    }

    #[test]
    fn test_empty_accessor_falls_through() {
        let registry = CacheKeyRegistry::new();
        registry.register(
            CacheKeySpec::<Doc>::new()
                .with_cache_key(|_| None)
                .with_id(|d| Some(d.doc_id.clone())),
        );

        let item = AnyItem::new(Doc {
            doc_id: "d1".into(),
            body: "x".into(),
        });
        assert!(registry.derive(&item, &context(None)).unwrap().as_str().ends_with(":d1"));
    }

    #[test]
    fn test_property_hash_is_deterministic() {
        let registry = CacheKeyRegistry::new();
        registry.register(CacheKeySpec::<Doc>::new().with_properties(|d| d.body.clone()));

        let item = AnyItem::new(Doc {
            doc_id: "d1".into(),
            body: "same".into(),
        });
        let ctx = context(None);
        assert_eq!(registry.derive(&item, &ctx), registry.derive(&item, &ctx));
    }

    #[test]
    fn test_version_tag_namespaces() {
        let registry = CacheKeyRegistry::new();
        registry.register(CacheKeySpec::<Doc>::new().with_id(|d| Some(d.doc_id.clone())));

        let item = AnyItem::new(Doc {
            doc_id: "d1".into(),
            body: "x".into(),
        });
        let v1 = registry.derive(&item, &context(Some("v1"))).unwrap();
        let v2 = registry.derive(&item, &context(Some("v2"))).unwrap();
        assert_ne!(v1, v2);
        assert!(v1.as_str().starts_with("v1:"));
    }

    #[test]
    fn test_unregistered_type_yields_no_key() {
        let registry = CacheKeyRegistry::new();
        let item = AnyItem::new("plain".to_string());
        assert!(registry.derive(&item, &context(None)).is_none());
    }
}
