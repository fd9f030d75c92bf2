// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Provider contracts (infrastructure ports). Concrete backends live with the
//! providers themselves; the domain only defines the selection surface.

pub mod cache_provider;
pub mod persistence_provider;

pub use cache_provider::CacheProvider;
pub use persistence_provider::{PersistenceFault, PersistenceProvider};
