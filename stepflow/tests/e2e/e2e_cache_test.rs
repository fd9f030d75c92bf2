// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Cache aspect scenarios: warm-cache short-circuit, require-cache misses,
//! version-tag namespacing, skip-if-present, and replay invalidation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::*;

use stepflow::application::services::{Orchestrator, RunInput};
use stepflow::infrastructure::cache::{CacheKeySpec, InMemoryCacheProvider};
use stepflow_domain::{
    AspectPosition, AspectScope, AspectSpec, CacheStatus, Cardinality, PipelineModel, RequestHeaders, StepId,
    StepModel, StepOptions,
};

struct CacheFixture {
    orchestrator: Orchestrator,
    provider: Arc<InMemoryCacheProvider>,
    step: Arc<UpperDocStep>,
    model: PipelineModel,
}

fn fixture() -> CacheFixture {
    let orchestrator = orchestrator();
    let provider = Arc::new(InMemoryCacheProvider::new("memory"));
    orchestrator.cache().register_provider(provider.clone());
    orchestrator
        .cache()
        .register_key_spec(CacheKeySpec::<Doc>::new().with_id(|d| Some(d.doc_id.clone())));

    let step = UpperDocStep::new();
    orchestrator
        .steps()
        .register_one_to_one("upper-doc", Arc::clone(&step), StepOptions::default())
        .unwrap();

    let aspect = AspectSpec::new("cache", AspectScope::Steps, AspectPosition::AfterStep)
        .unwrap()
        .with_targets(vec![StepId::new("upper-doc").unwrap()]);
    let model = PipelineModel::new("cached-upper")
        .with_step(StepModel::new(StepId::new("upper-doc").unwrap(), Cardinality::OneToOne))
        .with_aspect(aspect);

    CacheFixture {
        orchestrator,
        provider,
        step,
        model,
    }
}

#[tokio::test]
async fn test_warm_cache_short_circuits_target_step() {
    let fx = fixture();

    // First run warms the cache.
    let first = fx
        .orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "hello")), &RequestHeaders::new())
        .await
        .unwrap();
    assert_eq!(first.single::<Doc>().unwrap().unwrap().body, "HELLO");
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.cache_status, Some(CacheStatus::Write));
    assert_eq!(fx.provider.len(), 1);

    // Second run with the same doc id: the step is not invoked, the observed
    // output equals the first run's output, and the status reports the hit.
    let headers = RequestHeaders::new().with("cache-policy", "return-cached");
    let second = fx
        .orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "hello")), &headers)
        .await
        .unwrap();
    assert_eq!(second.single::<Doc>().unwrap().unwrap().body, "HELLO");
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.cache_status, Some(CacheStatus::Hit));
}

#[tokio::test]
async fn test_require_cache_on_cold_cache_fails_without_invocation() {
    let fx = fixture();

    let headers = RequestHeaders::new().with("cache-policy", "require-cache");
    let failure = fx
        .orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "hello")), &headers)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, "cache_policy");
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_version_tags_fork_the_namespace() {
    let fx = fixture();

    let v1 = RequestHeaders::new().with("version", "v1");
    fx.orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "one")), &v1)
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);

    // Same doc id under a different version tag recomputes; both entries
    // coexist afterwards.
    let v2 = RequestHeaders::new().with("version", "v2");
    fx.orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "one")), &v2)
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 2);
    assert_eq!(fx.provider.len(), 2);

    // Re-running under v1 hits its own namespace.
    fx.orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "one")), &v1)
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_skip_if_present_passes_input_through_without_overwrite() {
    let fx = fixture();

    // Warm under the default policy.
    fx.orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "hello")), &RequestHeaders::new())
        .await
        .unwrap();
    assert_eq!(fx.provider.len(), 1);

    // skip-if-present with an existing key: the input passes through
    // unchanged and the cached value is not overwritten.
    let headers = RequestHeaders::new().with("cache-policy", "skip-if-present");
    let outcome = fx
        .orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "fresh")), &headers)
        .await
        .unwrap();
    // The step itself still ran (skip-if-present does not short-circuit).
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.single::<Doc>().unwrap().unwrap().body, "FRESH");
    assert_eq!(fx.provider.len(), 1);
}

#[tokio::test]
async fn test_bypass_cache_does_no_io() {
    let fx = fixture();

    let headers = RequestHeaders::new().with("cache-policy", "bypass-cache");
    let outcome = fx
        .orchestrator
        .run(&fx.model, RunInput::item(Doc::new("d1", "hello")), &headers)
        .await
        .unwrap();

    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.cache_status, Some(CacheStatus::Bypass));
    assert!(fx.provider.is_empty());
}

#[tokio::test]
async fn test_replay_invalidates_and_recomputes() {
    let fx = fixture();

    // Add the per-item invalidation aspect in front of the cache read.
    let invalidate = AspectSpec::new("cache-invalidate", AspectScope::Steps, AspectPosition::BeforeStep)
        .unwrap()
        .with_order(-1)
        .with_targets(vec![StepId::new("upper-doc").unwrap()]);
    let model = fx.model.clone().with_aspect(invalidate);

    fx.orchestrator
        .run(&model, RunInput::item(Doc::new("d1", "old")), &RequestHeaders::new())
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);

    // A normal run must not invalidate: warm cache still hits.
    fx.orchestrator
        .run(&model, RunInput::item(Doc::new("d1", "old")), &RequestHeaders::new())
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 1);

    // Replay invalidates the key and recomputes.
    let replay = RequestHeaders::new().with("replay", "true");
    let outcome = fx
        .orchestrator
        .run(&model, RunInput::item(Doc::new("d1", "new")), &replay)
        .await
        .unwrap();
    assert_eq!(fx.step.calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.single::<Doc>().unwrap().unwrap().body, "NEW");
}

#[tokio::test]
async fn test_unkeyed_item_skips_cache_with_warning() {
    let orchestrator = orchestrator();
    let provider = Arc::new(InMemoryCacheProvider::new("memory"));
    orchestrator.cache().register_provider(provider.clone());
    // No key spec registered for String items.

    let step = UpperStep;
    orchestrator
        .steps()
        .register_one_to_one("upper", step, StepOptions::default())
        .unwrap();
    let aspect = AspectSpec::new("cache", AspectScope::Global, AspectPosition::AfterStep).unwrap();
    let model = PipelineModel::new("unkeyed")
        .with_step(StepModel::new(StepId::new("upper").unwrap(), Cardinality::OneToOne))
        .with_aspect(aspect);

    let outcome = orchestrator
        .run(&model, RunInput::item("abc".to_string()), &RequestHeaders::new())
        .await
        .unwrap();
    assert_eq!(outcome.single::<String>().unwrap(), Some("ABC".to_string()));
    assert!(provider.is_empty());
}
