// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! Hierarchical error type for the pipeline framework. Every failure that can
//! surface from a step, a provider, or the orchestrator is represented here so
//! that the retry combinator, the dead-letter path, and run classification can
//! reason about failures uniformly.
//!
//! ## Error Taxonomy
//!
//! The framework distinguishes five behavioral kinds:
//!
//! - **Transient** failures (network, timeouts, transient database states) are
//!   retried within the owning step's retry budget.
//! - **Non-retryable** failures (type mismatches, cache policy violations,
//!   wrapped non-transient persistence errors, explicit markers) bypass retry
//!   entirely and go straight to terminal handling.
//! - **Configuration** failures (invalid strategy names, non-positive
//!   durations) are startup-fatal and never reach a running pipeline.
//! - **Cancelled** is terminal: no retry, no dead-letter, returned to the
//!   caller verbatim.
//! - **KillSwitch** terminates the current run with a classified failure.
//!
//! `is_retryable()` is the single source of truth consumed by the retry
//! combinator; `category()` labels metrics and dead-letter records.

use thiserror::Error;

use crate::value_objects::StepId;

/// Domain-specific errors for the pipeline framework.
///
/// Each variant carries a descriptive message. Variants are grouped by the
/// behavior they trigger in the step engine rather than by the component that
/// raised them, which keeps retry and recovery decisions in one place.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Incompatible step chain: {0}")]
    IncompatibleChain(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Non-retryable failure: {0}")]
    NonRetryable(String),

    #[error("Item type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Cache policy violation: {0}")]
    CachePolicyViolation(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Provider selection failed: {0}")]
    ProviderSelection(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Dead letter delivery failed: {0}")]
    DeadLetterError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Kill switch triggered: {0}")]
    KillSwitch(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl PipelineError {
    /// Creates a new configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Creates a new transient (retryable) failure
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Creates a new non-retryable failure
    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    /// Creates a new cache policy violation
    pub fn cache_policy_violation(msg: impl Into<String>) -> Self {
        Self::CachePolicyViolation(msg.into())
    }

    /// Creates a new provider selection error
    pub fn provider_selection(msg: impl Into<String>) -> Self {
        Self::ProviderSelection(msg.into())
    }

    /// Creates a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Creates a new kill switch error
    pub fn kill_switch(msg: impl Into<String>) -> Self {
        Self::KillSwitch(msg.into())
    }

    /// Creates a new internal error
    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Creates a new metrics error
    pub fn metrics_error(msg: impl Into<String>) -> Self {
        Self::MetricsError(msg.into())
    }

    /// Whether the retry combinator may re-attempt after this failure.
    ///
    /// Only transient and timeout failures are retryable. Cache policy
    /// violations, type mismatches, cancellation, and anything explicitly
    /// marked non-retryable bypass the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::Timeout(_))
    }

    /// Whether this failure terminates the whole run rather than one item.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, PipelineError::Cancelled(_) | PipelineError::KillSwitch(_))
    }

    /// Gets the error category used for metrics labels and dead-letter records
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::InvalidConfiguration(_) => "configuration",
            PipelineError::IncompatibleChain(_) => "configuration",
            PipelineError::Transient(_) => "transient",
            PipelineError::NonRetryable(_) => "non_retryable",
            PipelineError::TypeMismatch(_) => "type_mismatch",
            PipelineError::CachePolicyViolation(_) => "cache_policy",
            PipelineError::CacheError(_) => "cache",
            PipelineError::PersistenceError(_) => "persistence",
            PipelineError::DuplicateKey(_) => "duplicate_key",
            PipelineError::ProviderSelection(_) => "provider_selection",
            PipelineError::StepNotFound(_) => "step_not_found",
            PipelineError::DeadLetterError(_) => "dead_letter",
            PipelineError::SerializationError(_) => "serialization",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Cancelled(_) => "cancellation",
            PipelineError::KillSwitch(_) => "kill_switch",
            PipelineError::HealthCheck(_) => "health",
            PipelineError::MetricsError(_) => "metrics",
            PipelineError::InternalError(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

/// Classified failure surfaced for a whole run.
///
/// A run yields either a terminal output or exactly one `RunFailure`. The
/// cause chain is flattened to strings so the report stays `Clone` and can be
/// logged or serialized without holding live error sources.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub kind: &'static str,
    pub message: String,
    pub cause_chain: Vec<String>,
    pub triggering_step_id: Option<StepId>,
}

impl RunFailure {
    pub fn from_error(error: &PipelineError, triggering_step_id: Option<StepId>) -> Self {
        let mut cause_chain = Vec::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
        while let Some(cause) = source {
            cause_chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: error.category(),
            message: error.to_string(),
            cause_chain,
            triggering_step_id,
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.triggering_step_id {
            Some(step) => write!(f, "[{}] {} (step {})", self.kind, self.message, step),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
