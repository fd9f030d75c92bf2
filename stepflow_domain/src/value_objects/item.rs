// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Items and Type Tags
//!
//! Items flowing between steps are opaque domain values. The pipeline chain is
//! resolved from a declarative model at startup, so steps of different item
//! types must be composable behind one runtime interface. `AnyItem` is the
//! erased representation: a cheaply clonable `Arc<dyn Any>` tagged with the
//! item's `TypeTag`. Typed step implementations never see `AnyItem`; the
//! engine adapters downcast at the boundary and a failed downcast is the
//! framework's rendition of a null input: a non-retryable failure.
//!
//! Chain compatibility (producer output type == consumer input type) is
//! checked once at pipeline build time by comparing type tags, never per item.

use std::any::{Any, TypeId};
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::PipelineError;

/// Lazy, finite sequence of typed items as produced by expanding steps.
pub type ItemStream<T> = BoxStream<'static, Result<T, PipelineError>>;

/// Identity of an item type: `TypeId` for runtime checks plus the fully
/// qualified type name for cache key prefixes, synthetic step ids, and
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Fully qualified type name, e.g. `alloc::string::String`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Short name without module path, used in synthetic step ids.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Type-erased item value passed between runtime steps.
///
/// Cloning is cheap (an `Arc` bump); the cache subsystem relies on this to
/// hold entries without serializing them.
#[derive(Clone)]
pub struct AnyItem {
    value: Arc<dyn Any + Send + Sync>,
    tag: TypeTag,
}

impl AnyItem {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            tag: TypeTag::of::<T>(),
        }
    }

    pub fn tag(&self) -> &TypeTag {
        &self.tag
    }

    /// Borrows the payload as `T`, if the tag matches.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Extracts an owned `T` by cloning the shared payload.
    pub fn downcast_cloned<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Extracts an owned `T` or reports the mismatch as a non-retryable error
    /// naming both the expected and the actual type.
    pub fn expect_cloned<T: Any + Send + Sync + Clone>(&self) -> Result<T, PipelineError> {
        self.downcast_cloned::<T>().ok_or_else(|| {
            PipelineError::TypeMismatch(format!(
                "expected {}, found {}",
                std::any::type_name::<T>(),
                self.tag.name()
            ))
        })
    }
}

impl std::fmt::Debug for AnyItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyItem").field("type", &self.tag.name()).finish()
    }
}
