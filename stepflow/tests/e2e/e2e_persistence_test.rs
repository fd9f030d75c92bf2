// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Persistence side-effect scenarios: duplicate-key policies and idempotent
//! re-submission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::*;

use stepflow::application::services::{Orchestrator, RunInput};
use stepflow::infrastructure::persistence::InMemoryPersistenceProvider;
use stepflow_domain::{
    AspectPosition, AspectScope, AspectSpec, Cardinality, OneToOneStep, PipelineError, PipelineModel,
    RequestHeaders, StepId, StepModel, StepOptions,
};

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: String,
    total: u32,
}

struct TagOrder {
    calls: AtomicU32,
}

#[async_trait]
impl OneToOneStep<Order, Order> for TagOrder {
    async fn apply(&self, input: Order) -> Result<Order, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input)
    }
}

struct PersistFixture {
    orchestrator: Orchestrator,
    provider: Arc<InMemoryPersistenceProvider<Order>>,
}

fn fixture(duplicate_key: &str) -> (PersistFixture, PipelineModel) {
    let orchestrator = orchestrator();
    let provider = Arc::new(InMemoryPersistenceProvider::<Order>::new(|o| o.id.clone()));
    orchestrator.persistence().register(provider.clone());

    orchestrator
        .steps()
        .register_one_to_one(
            "tag-order",
            TagOrder {
                calls: AtomicU32::new(0),
            },
            StepOptions::default(),
        )
        .unwrap();

    let aspect = AspectSpec::new("persist", AspectScope::Steps, AspectPosition::AfterStep)
        .unwrap()
        .with_targets(vec![StepId::new("tag-order").unwrap()])
        .with_config("duplicate-key", duplicate_key);
    let model = PipelineModel::new(format!("persist-{duplicate_key}"))
        .with_step(StepModel::new(StepId::new("tag-order").unwrap(), Cardinality::OneToOne))
        .with_aspect(aspect);

    (
        PersistFixture {
            orchestrator,
            provider,
        },
        model,
    )
}

fn order(total: u32) -> Order {
    Order {
        id: "o1".into(),
        total,
    }
}

#[tokio::test]
async fn test_persist_writes_row_and_passes_item_through() {
    let (fx, model) = fixture("fail");

    let outcome = fx
        .orchestrator
        .run(&model, RunInput::item(order(10)), &RequestHeaders::new())
        .await
        .unwrap();

    assert_eq!(outcome.single::<Order>().unwrap().unwrap(), order(10));
    assert_eq!(fx.provider.len(), 1);
    assert_eq!(fx.provider.get("o1").unwrap().total, 10);
}

#[tokio::test]
async fn test_duplicate_key_ignore_is_idempotent() {
    let (fx, model) = fixture("ignore");

    // Re-submitting the same entity K times yields one persisted row and K
    // successful completions.
    for _ in 0..3 {
        let outcome = fx
            .orchestrator
            .run(&model, RunInput::item(order(10)), &RequestHeaders::new())
            .await
            .unwrap();
        assert_eq!(outcome.single::<Order>().unwrap().unwrap(), order(10));
    }
    assert_eq!(fx.provider.len(), 1);
    assert_eq!(fx.provider.get("o1").unwrap().total, 10);
}

#[tokio::test]
async fn test_duplicate_key_fail_propagates() {
    let (fx, model) = fixture("fail");

    fx.orchestrator
        .run(&model, RunInput::item(order(10)), &RequestHeaders::new())
        .await
        .unwrap();
    let failure = fx
        .orchestrator
        .run(&model, RunInput::item(order(20)), &RequestHeaders::new())
        .await
        .unwrap_err();

    assert_eq!(failure.kind, "duplicate_key");
    assert_eq!(fx.provider.get("o1").unwrap().total, 10);
}

#[tokio::test]
async fn test_duplicate_key_upsert_updates_row() {
    let (fx, model) = fixture("upsert");

    fx.orchestrator
        .run(&model, RunInput::item(order(10)), &RequestHeaders::new())
        .await
        .unwrap();
    fx.orchestrator
        .run(&model, RunInput::item(order(99)), &RequestHeaders::new())
        .await
        .unwrap();

    assert_eq!(fx.provider.len(), 1);
    assert_eq!(fx.provider.get("o1").unwrap().total, 99);
}

#[tokio::test]
async fn test_missing_provider_fails_fast() {
    let orchestrator = orchestrator();
    orchestrator
        .steps()
        .register_one_to_one(
            "tag-order",
            TagOrder {
                calls: AtomicU32::new(0),
            },
            StepOptions::default(),
        )
        .unwrap();
    let aspect = AspectSpec::new("persist", AspectScope::Global, AspectPosition::AfterStep).unwrap();
    let model = PipelineModel::new("no-provider")
        .with_step(StepModel::new(StepId::new("tag-order").unwrap(), Cardinality::OneToOne))
        .with_aspect(aspect);

    let failure = orchestrator
        .run(&model, RunInput::item(order(1)), &RequestHeaders::new())
        .await
        .unwrap_err();
    assert_eq!(failure.kind, "provider_selection");
}
