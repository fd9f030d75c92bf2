// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Shared test fixtures: small steps over strings and documents, a recording
//! dead-letter sink, and orchestrator construction helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use stepflow::application::services::Orchestrator;
use stepflow_domain::{
    DeadLetterEntry, DeadLetterSink, ItemStream, ManyToOneStep, OneToManyStep, OneToOneStep, PipelineError,
    SideEffectStep,
};

/// 1→1 identity over strings.
pub struct IdentityStep;

#[async_trait]
impl OneToOneStep<String, String> for IdentityStep {
    async fn apply(&self, input: String) -> Result<String, PipelineError> {
        Ok(input)
    }
}

/// 1→1 uppercase over strings.
pub struct UpperStep;

#[async_trait]
impl OneToOneStep<String, String> for UpperStep {
    async fn apply(&self, input: String) -> Result<String, PipelineError> {
        Ok(input.to_uppercase())
    }
}

/// 1→1 step that fails transiently `fail_times` times, then succeeds.
pub struct FlakyStep {
    fail_times: u32,
    pub calls: AtomicU32,
}

impl FlakyStep {
    pub fn new(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_times,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl OneToOneStep<String, String> for FlakyStep {
    async fn apply(&self, input: String) -> Result<String, PipelineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_times {
            Err(PipelineError::transient("temporarily unavailable"))
        } else {
            Ok(input)
        }
    }
}

/// 1→1 step that always fails transiently, counting invocations.
pub struct AlwaysFailStep {
    pub calls: AtomicU32,
}

impl AlwaysFailStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl OneToOneStep<String, String> for AlwaysFailStep {
    async fn apply(&self, _input: String) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::transient("still broken"))
    }
}

/// 1→N comma splitter.
pub struct SplitStep;

#[async_trait]
impl OneToManyStep<String, String> for SplitStep {
    async fn expand(&self, input: String) -> Result<ItemStream<String>, PipelineError> {
        let parts: Vec<Result<String, PipelineError>> = input
            .split(',')
            .filter(|p| !p.is_empty())
            .map(|p| Ok(p.to_string()))
            .collect();
        Ok(futures::stream::iter(parts).boxed())
    }
}

/// N→1 element counter with identity 0.
pub struct CountStep {
    pub calls: AtomicU32,
}

impl CountStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ManyToOneStep<String, u64> for CountStep {
    async fn fold(&self, inputs: ItemStream<String>) -> Result<u64, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut inputs = inputs;
        let mut count = 0u64;
        while let Some(item) = inputs.next().await {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn identity(&self) -> Option<u64> {
        Some(0)
    }
}

/// Side-effect step recording everything it observes.
pub struct RecordingSideEffect {
    pub seen: Mutex<Vec<String>>,
}

impl RecordingSideEffect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SideEffectStep<String> for RecordingSideEffect {
    async fn observe(&self, input: &String) -> Result<(), PipelineError> {
        self.seen.lock().unwrap().push(input.clone());
        Ok(())
    }
}

/// Dead-letter sink collecting entries in memory.
pub struct RecordingDlq {
    pub entries: Mutex<Vec<DeadLetterEntry<String>>>,
}

impl RecordingDlq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl DeadLetterSink<String> for RecordingDlq {
    async fn dead_letter(&self, entry: DeadLetterEntry<String>) -> Result<(), PipelineError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Document item used by the cache scenarios.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Doc {
    pub doc_id: String,
    pub body: String,
}

impl Doc {
    pub fn new(doc_id: &str, body: &str) -> Self {
        Self {
            doc_id: doc_id.into(),
            body: body.into(),
        }
    }
}

/// 1→1 document transform counting invocations.
pub struct UpperDocStep {
    pub calls: AtomicU32,
}

impl UpperDocStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl OneToOneStep<Doc, Doc> for UpperDocStep {
    async fn apply(&self, input: Doc) -> Result<Doc, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Doc {
            doc_id: input.doc_id,
            body: input.body.to_uppercase(),
        })
    }
}

/// Orchestrator with default settings and no telemetry backend.
pub fn orchestrator() -> Orchestrator {
    Orchestrator::builder().build().expect("orchestrator builds")
}
