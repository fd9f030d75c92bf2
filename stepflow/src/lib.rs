// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # StepFlow
//!
//! A runtime for composing reactive, stage-oriented data pipelines from
//! independently deployable steps. Clients declare an ordered chain of
//! cardinality-shaped steps (1→1, 1→N, N→1, N→N, side-effect) plus a table
//! of cross-cutting aspects; the framework streams items through the chain
//! with retry, backpressure, caching, persistence, and observability applied
//! uniformly.
//!
//! ## Quick Tour
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepflow::application::services::{Orchestrator, RunInput};
//! use stepflow::infrastructure::cache::InMemoryCacheProvider;
//! use stepflow_domain::{Cardinality, PipelineModel, RequestHeaders, StepId, StepModel, StepOptions};
//!
//! let orchestrator = Orchestrator::builder().build()?;
//! orchestrator.steps().register_one_to_one("normalize", Normalize, StepOptions::default())?;
//! orchestrator.steps().register_one_to_many("split", Split, StepOptions::default())?;
//! orchestrator.steps().register_many_to_one("count", Count, StepOptions::default())?;
//!
//! let model = PipelineModel::new("split-count")
//!     .with_step(StepModel::new(StepId::new("normalize")?, Cardinality::OneToOne))
//!     .with_step(StepModel::new(StepId::new("split")?, Cardinality::OneToMany))
//!     .with_step(StepModel::new(StepId::new("count")?, Cardinality::ManyToOne));
//!
//! let outcome = orchestrator
//!     .run(&model, RunInput::item("a,b,c".to_string()), &RequestHeaders::new())
//!     .await?;
//! assert_eq!(outcome.single::<u64>()?, Some(3));
//! ```
//!
//! ## Layering
//!
//! - [`stepflow_domain`]: entities, value objects, step contracts, provider
//!   SPIs (re-exported here for convenience)
//! - [`infrastructure`]: config, the reactive runtime, cache, persistence,
//!   metrics, logging, health
//! - [`application`]: registries and the orchestrator

pub mod application;
pub mod infrastructure;

pub use stepflow_domain as domain;

pub use application::services::{Orchestrator, OrchestratorBuilder, RunInput, RunOutcome, RunOutput, RunReport};
pub use infrastructure::runtime::context::{current as current_context, try_current as try_current_context};
pub use infrastructure::runtime::CancellationToken;
