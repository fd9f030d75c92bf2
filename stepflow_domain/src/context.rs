// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Request Context & Control Headers
//!
//! Every top-level run carries a `RequestContext` derived from an abstract
//! header map. The context is immutable for the duration of the run and is
//! propagated to every step invocation: the orchestrator installs it in a
//! task-local slot (runtime layer) and the engine threads it through the
//! per-item envelope so it survives worker migration across suspension
//! points.
//!
//! Recognized header keys:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `version` | Opaque version tag; namespaces every cache key of the run. |
//! | `replay` | `true`/`false` (default false); arms the invalidation aspects. |
//! | `cache-policy` | Per-request cache policy override. |
//!
//! Unknown keys are ignored. Invalid `cache-policy` values fall back to
//! `return-cached`; the parse reports warnings for the caller to log (the
//! domain layer does not log).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::entities::{RunMetrics, StepConfigOverlay};
use crate::value_objects::{RunId, StepId};
use crate::PipelineError;

/// Header key for the version tag.
pub const HEADER_VERSION: &str = "version";
/// Header key for the replay flag.
pub const HEADER_REPLAY: &str = "replay";
/// Header key for the cache policy override.
pub const HEADER_CACHE_POLICY: &str = "cache-policy";

/// Cache behavior requested for the steps a cache aspect targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Write path only; the read side does nothing.
    CacheOnly,
    /// Look up before the step; a hit short-circuits the step, a miss falls
    /// through and the result is written afterwards.
    ReturnCached,
    /// Pass the input through unchanged when the key already exists; no
    /// overwrite.
    SkipIfPresent,
    /// A hit short-circuits; a miss is a non-retryable policy violation.
    RequireCache,
    /// No cache I/O at all.
    BypassCache,
}

impl std::fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CachePolicy::CacheOnly => write!(f, "cache-only"),
            CachePolicy::ReturnCached => write!(f, "return-cached"),
            CachePolicy::SkipIfPresent => write!(f, "skip-if-present"),
            CachePolicy::RequireCache => write!(f, "require-cache"),
            CachePolicy::BypassCache => write!(f, "bypass-cache"),
        }
    }
}

impl std::str::FromStr for CachePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cache-only" => Ok(CachePolicy::CacheOnly),
            // `prefer-cache` is the historical alias.
            "return-cached" | "prefer-cache" => Ok(CachePolicy::ReturnCached),
            "skip-if-present" => Ok(CachePolicy::SkipIfPresent),
            "require-cache" => Ok(CachePolicy::RequireCache),
            "bypass-cache" => Ok(CachePolicy::BypassCache),
            _ => Err(PipelineError::invalid_config(format!("Unknown cache policy: {}", s))),
        }
    }
}

/// Outcome of the last cache operation for one item. Cleared when read by the
/// policy enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Write,
}

/// Abstract key/value control headers attached to a run request.
///
/// Keys are matched case-insensitively; the transport that produced them is
/// out of scope.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    entries: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries.insert(key.as_ref().to_lowercase(), value.into());
    }

    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(String::as_str)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Warning produced while mapping headers to a context; the caller logs these
/// (the domain stays free of logging concerns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWarning {
    pub key: String,
    pub message: String,
}

/// Cooperative cancellation port.
///
/// The runtime layer provides the concrete signal (an atomic flag plus an
/// async notifier); the domain only needs the contract so that run controls
/// and retry loops can observe cancellation without depending on a runtime.
pub trait CancellationSignal: Send + Sync {
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
    /// Resolves when the signal fires; never resolves if it never fires.
    fn cancelled(&self) -> BoxFuture<'static, ()>;
}

/// Signal that never fires; used for contexts created outside a managed run.
#[derive(Debug, Default)]
pub struct NeverCancelled;

impl CancellationSignal for NeverCancelled {
    fn cancel(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn cancelled(&self) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::pending())
    }
}

/// Shared per-run control surface: identity, cancellation, and metrics.
#[derive(Clone)]
pub struct RunControls {
    run_id: RunId,
    cancellation: Arc<dyn CancellationSignal>,
    metrics: Arc<RunMetrics>,
}

impl RunControls {
    pub fn new(cancellation: Arc<dyn CancellationSignal>) -> Self {
        Self {
            run_id: RunId::new(),
            cancellation,
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    /// Controls detached from any orchestrated run (unit tests, ad-hoc use).
    pub fn detached() -> Self {
        Self::new(Arc::new(NeverCancelled))
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn cancellation(&self) -> &Arc<dyn CancellationSignal> {
        &self.cancellation
    }

    pub fn metrics(&self) -> &Arc<RunMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for RunControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControls")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// Immutable per-run request context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    version_tag: Option<String>,
    replay: bool,
    cache_policy: Option<CachePolicy>,
    step_overrides: HashMap<StepId, StepConfigOverlay>,
    controls: RunControls,
}

impl RequestContext {
    pub fn new(controls: RunControls) -> Self {
        Self {
            version_tag: None,
            replay: false,
            cache_policy: None,
            step_overrides: HashMap::new(),
            controls,
        }
    }

    /// Maps control headers to a context. Unknown keys are ignored; invalid
    /// values degrade with a warning rather than failing the run.
    pub fn from_headers(headers: &RequestHeaders, controls: RunControls) -> (Self, Vec<HeaderWarning>) {
        let mut warnings = Vec::new();
        let mut context = Self::new(controls);

        if let Some(tag) = headers.get(HEADER_VERSION) {
            if !tag.is_empty() {
                context.version_tag = Some(tag.to_string());
            }
        }

        if let Some(raw) = headers.get(HEADER_REPLAY) {
            match raw.trim().to_lowercase().as_str() {
                "true" => context.replay = true,
                "false" | "" => {}
                other => warnings.push(HeaderWarning {
                    key: HEADER_REPLAY.to_string(),
                    message: format!("invalid replay value {:?}, defaulting to false", other),
                }),
            }
        }

        if let Some(raw) = headers.get(HEADER_CACHE_POLICY) {
            match raw.parse::<CachePolicy>() {
                Ok(policy) => context.cache_policy = Some(policy),
                Err(_) => {
                    warnings.push(HeaderWarning {
                        key: HEADER_CACHE_POLICY.to_string(),
                        message: format!("invalid cache policy {:?}, falling back to return-cached", raw),
                    });
                    context.cache_policy = Some(CachePolicy::ReturnCached);
                }
            }
        }

        (context, warnings)
    }

    pub fn with_step_override(mut self, step: StepId, overlay: StepConfigOverlay) -> Self {
        self.step_overrides.insert(step, overlay);
        self
    }

    pub fn version_tag(&self) -> Option<&str> {
        self.version_tag.as_deref()
    }

    pub fn replay(&self) -> bool {
        self.replay
    }

    pub fn cache_policy(&self) -> Option<CachePolicy> {
        self.cache_policy
    }

    /// Per-request configuration overlay for a step, if any.
    pub fn step_override(&self, step: &StepId) -> Option<&StepConfigOverlay> {
        self.step_overrides.get(step)
    }

    pub fn controls(&self) -> &RunControls {
        &self.controls
    }

    pub fn run_id(&self) -> RunId {
        self.controls.run_id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.controls.cancellation().is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(headers: RequestHeaders) -> (RequestContext, Vec<HeaderWarning>) {
        RequestContext::from_headers(&headers, RunControls::detached())
    }

    #[test]
    fn test_default_context_from_empty_headers() {
        let (ctx, warnings) = parse(RequestHeaders::new());
        assert!(ctx.version_tag().is_none());
        assert!(!ctx.replay());
        assert!(ctx.cache_policy().is_none());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_recognized_headers_map_to_fields() {
        let headers = RequestHeaders::new()
            .with("Version", "v2")
            .with("REPLAY", "true")
            .with("cache-policy", "require-cache");
        let (ctx, warnings) = parse(headers);
        assert_eq!(ctx.version_tag(), Some("v2"));
        assert!(ctx.replay());
        assert_eq!(ctx.cache_policy(), Some(CachePolicy::RequireCache));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_prefer_cache_alias() {
        let (ctx, warnings) = parse(RequestHeaders::new().with("cache-policy", "prefer-cache"));
        assert_eq!(ctx.cache_policy(), Some(CachePolicy::ReturnCached));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_invalid_cache_policy_falls_back_with_warning() {
        let (ctx, warnings) = parse(RequestHeaders::new().with("cache-policy", "write-through"));
        assert_eq!(ctx.cache_policy(), Some(CachePolicy::ReturnCached));
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].key, HEADER_CACHE_POLICY);
    }

    #[test]
    fn test_invalid_replay_defaults_false_with_warning() {
        let (ctx, warnings) = parse(RequestHeaders::new().with("replay", "yes"));
        assert!(!ctx.replay());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_unknown_headers_ignored() {
        let (_, warnings) = parse(RequestHeaders::new().with("x-trace-id", "abc"));
        assert!(warnings.is_empty());
    }
}
