// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Cache Keys
//!
//! A cache key is derived from an item plus the request context. Keys are
//! always prefixed by the fully qualified input type name so that distinct
//! item types can never collide, and additionally by the request's version tag
//! when one is present, so that runs tagged `v1` and `v2` occupy disjoint
//! namespaces for the same `(type, item)` pair.
//!
//! Layout: `[{version_tag}:]{type_name}:{raw_key}`.

use serde::{Deserialize, Serialize};

/// Namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from its parts. The raw key comes from a key strategy;
    /// `type_name` is the fully qualified input type; `version_tag` is the
    /// optional per-request namespace.
    pub fn derive(version_tag: Option<&str>, type_name: &str, raw: &str) -> Self {
        match version_tag {
            Some(tag) => Self(format!("{tag}:{type_name}:{raw}")),
            None => Self(format!("{type_name}:{raw}")),
        }
    }

    /// Prefix shared by every key of `type_name` within the same namespace.
    /// Bulk invalidation by input type enumerates this prefix.
    pub fn type_prefix(version_tag: Option<&str>, type_name: &str) -> String {
        match version_tag {
            Some(tag) => format!("{tag}:{type_name}:"),
            None => format!("{type_name}:"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unversioned_key_has_type_prefix() {
        let key = CacheKey::derive(None, "alloc::string::String", "doc-1");
        assert_eq!(key.as_str(), "alloc::string::String:doc-1");
    }

    #[test]
    fn test_version_tag_namespaces_key() {
        let v1 = CacheKey::derive(Some("v1"), "alloc::string::String", "doc-1");
        let v2 = CacheKey::derive(Some("v2"), "alloc::string::String", "doc-1");
        assert_ne!(v1, v2);
        assert!(v1.as_str().starts_with("v1:"));
    }

    #[test]
    fn test_type_prefix_covers_derived_keys() {
        let prefix = CacheKey::type_prefix(Some("v1"), "my::Doc");
        let key = CacheKey::derive(Some("v1"), "my::Doc", "42");
        assert!(key.as_str().starts_with(&prefix));
    }

    #[test]
    fn test_key_determinism() {
        let a = CacheKey::derive(Some("v1"), "my::Doc", "42");
        let b = CacheKey::derive(Some("v1"), "my::Doc", "42");
        assert_eq!(a, b);
    }
}
