// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Core pipeline scenarios: the happy path through all three cardinalities,
//! retry behavior, dead-lettering, empty-stream folding, and cancellation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::*;

use stepflow::application::services::RunInput;
use stepflow::CancellationToken;
use stepflow_domain::{
    Cardinality, PipelineModel, RequestHeaders, StepConfigOverlay, StepId, StepModel, StepOptions,
};

fn split_count_model() -> PipelineModel {
    PipelineModel::new("split-count")
        .with_step(StepModel::new(StepId::new("identity").unwrap(), Cardinality::OneToOne))
        .with_step(StepModel::new(StepId::new("split").unwrap(), Cardinality::OneToMany))
        .with_step(StepModel::new(StepId::new("count").unwrap(), Cardinality::ManyToOne))
}

#[tokio::test]
async fn test_happy_path_counts_split_items() -> anyhow::Result<()> {
    let orchestrator = orchestrator();
    orchestrator
        .steps()
        .register_one_to_one("identity", IdentityStep, StepOptions::default())?;
    orchestrator
        .steps()
        .register_one_to_many("split", SplitStep, StepOptions::default())?;
    orchestrator
        .steps()
        .register_many_to_one("count", CountStep::new(), StepOptions::default())?;

    let outcome = orchestrator
        .run(&split_count_model(), RunInput::item("a,b,c".to_string()), &RequestHeaders::new())
        .await
        .map_err(|failure| anyhow::anyhow!("{failure}"))?;

    assert_eq!(outcome.single::<u64>()?, Some(3));
    assert_eq!(outcome.report.retries, 0);
    assert_eq!(outcome.report.dead_letters, 0);
    Ok(())
}

#[tokio::test]
async fn test_retry_then_success() {
    let orchestrator = orchestrator();
    let step = FlakyStep::new(2);
    let overlay = StepConfigOverlay {
        retry_limit: Some(3),
        retry_wait: Some(Duration::from_millis(10)),
        max_backoff: Some(Duration::from_millis(100)),
        jitter: Some(false),
        ..StepConfigOverlay::default()
    };
    orchestrator
        .steps()
        .register_one_to_one(
            "flaky",
            Arc::clone(&step),
            StepOptions::default().with_config(overlay),
        )
        .unwrap();

    let model = PipelineModel::new("retry")
        .with_step(StepModel::new(StepId::new("flaky").unwrap(), Cardinality::OneToOne));

    let started = Instant::now();
    let outcome = orchestrator
        .run(&model, RunInput::item("x".to_string()), &RequestHeaders::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.single::<String>().unwrap(), Some("x".to_string()));
    // Exactly three invocations, with backoff delays of 10ms then 20ms.
    assert_eq!(step.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.report.retries, 2);
    assert!(elapsed >= Duration::from_millis(30), "backoff delays missing: {elapsed:?}");
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_item() {
    let orchestrator = orchestrator();
    let step = AlwaysFailStep::new();
    let dlq = RecordingDlq::new();
    let overlay = StepConfigOverlay {
        retry_limit: Some(2),
        retry_wait: Some(Duration::from_millis(5)),
        max_backoff: Some(Duration::from_millis(20)),
        recover_on_failure: Some(true),
        ..StepConfigOverlay::default()
    };
    orchestrator
        .steps()
        .register_one_to_one(
            "doomed",
            Arc::clone(&step),
            StepOptions::default()
                .with_config(overlay)
                .with_dead_letter(dlq.clone()),
        )
        .unwrap();

    let model = PipelineModel::new("dlq")
        .with_step(StepModel::new(StepId::new("doomed").unwrap(), Cardinality::OneToOne));

    let outcome = orchestrator
        .run(&model, RunInput::item("x".to_string()), &RequestHeaders::new())
        .await
        .unwrap();

    // Downstream output is absent; exactly one dead-letter entry recorded.
    assert_eq!(outcome.single::<String>().unwrap(), None);
    assert_eq!(step.calls.load(Ordering::SeqCst), 3);
    assert_eq!(dlq.len(), 1);
    let entries = dlq.entries.lock().unwrap();
    assert_eq!(entries[0].item.as_deref(), Some("x"));
    assert!(entries[0].error.to_string().contains("still broken"));
}

#[tokio::test]
async fn test_zero_retry_limit_single_invocation() {
    let orchestrator = orchestrator();
    let step = AlwaysFailStep::new();
    let overlay = StepConfigOverlay {
        retry_limit: Some(0),
        ..StepConfigOverlay::default()
    };
    orchestrator
        .steps()
        .register_one_to_one("doomed", Arc::clone(&step), StepOptions::default().with_config(overlay))
        .unwrap();

    let model = PipelineModel::new("no-retry")
        .with_step(StepModel::new(StepId::new("doomed").unwrap(), Cardinality::OneToOne));

    let started = Instant::now();
    let failure = orchestrator
        .run(&model, RunInput::item("x".to_string()), &RequestHeaders::new())
        .await
        .unwrap_err();

    assert_eq!(step.calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure.kind, "transient");
    assert_eq!(failure.triggering_step_id.as_ref().unwrap().as_str(), "doomed");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_empty_stream_fold_uses_identity() {
    let orchestrator = orchestrator();
    let count = CountStep::new();
    orchestrator
        .steps()
        .register_many_to_one("count", Arc::clone(&count), StepOptions::default())
        .unwrap();

    let model = PipelineModel::new("empty-fold")
        .with_step(StepModel::new(StepId::new("count").unwrap(), Cardinality::ManyToOne));

    let outcome = orchestrator
        .run(&model, RunInput::items(Vec::<String>::new()), &RequestHeaders::new())
        .await
        .unwrap();

    // Identity result without a single user invocation.
    assert_eq!(outcome.single::<u64>().unwrap(), Some(0));
    assert_eq!(count.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_during_backoff() {
    let orchestrator = orchestrator();
    let step = AlwaysFailStep::new();
    let dlq = RecordingDlq::new();
    let overlay = StepConfigOverlay {
        retry_limit: Some(5),
        retry_wait: Some(Duration::from_secs(60)),
        max_backoff: Some(Duration::from_secs(120)),
        ..StepConfigOverlay::default()
    };
    orchestrator
        .steps()
        .register_one_to_one(
            "doomed",
            Arc::clone(&step),
            StepOptions::default()
                .with_config(overlay)
                .with_dead_letter(dlq.clone()),
        )
        .unwrap();

    let model = PipelineModel::new("cancel")
        .with_step(StepModel::new(StepId::new("doomed").unwrap(), Cardinality::OneToOne));

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let failure = orchestrator
        .run_cancellable(&model, RunInput::item("x".to_string()), &RequestHeaders::new(), token)
        .await
        .unwrap_err();

    // Terminal Cancelled: one invocation, no further retries, no dead letter.
    assert_eq!(failure.kind, "cancellation");
    assert_eq!(step.calls.load(Ordering::SeqCst), 1);
    assert_eq!(dlq.len(), 0);
}

#[tokio::test]
async fn test_side_effect_preserves_items() {
    let orchestrator = orchestrator();
    let observer = RecordingSideEffect::new();
    orchestrator
        .steps()
        .register_side_effect("observe", Arc::clone(&observer), StepOptions::default())
        .unwrap();
    orchestrator
        .steps()
        .register_one_to_one("upper", UpperStep, StepOptions::default())
        .unwrap();

    let model = PipelineModel::new("observe-upper")
        .with_step(StepModel::new(StepId::new("observe").unwrap(), Cardinality::SideEffect))
        .with_step(StepModel::new(StepId::new("upper").unwrap(), Cardinality::OneToOne));

    let outcome = orchestrator
        .run(
            &model,
            RunInput::items(vec!["a".to_string(), "b".to_string(), "c".to_string()]),
            &RequestHeaders::new(),
        )
        .await
        .unwrap();

    // Identity law upstream of the transform; order preserved downstream.
    assert_eq!(*observer.seen.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(outcome.items::<String>().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(outcome.report.items_processed, 3);
}

#[tokio::test]
async fn test_streaming_output_aggregates_items() {
    let orchestrator = orchestrator();
    orchestrator
        .steps()
        .register_one_to_many("split", SplitStep, StepOptions::default())
        .unwrap();

    let model = PipelineModel::new("split-only")
        .with_step(StepModel::new(StepId::new("split").unwrap(), Cardinality::OneToMany));

    let outcome = orchestrator
        .run(&model, RunInput::item("x,y".to_string()), &RequestHeaders::new())
        .await
        .unwrap();

    assert_eq!(outcome.items::<String>().unwrap(), vec!["x", "y"]);
}
