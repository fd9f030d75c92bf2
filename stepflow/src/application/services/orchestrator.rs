// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Orchestrator
//!
//! The coordinator owning the run boundary. It materializes declarative
//! pipeline models into executable chains (cached by model identity), gates
//! traffic on startup dependency health, installs the request context from
//! control headers, drives the input through the wrapped steps, enforces the
//! retry-amplification kill switch from a monitor task, and emits the
//! `pipeline.run` span with the run's item count, in-flight statistics, and
//! final status.
//!
//! A run yields either a terminal output (a single item or the aggregated
//! per-item results of a streaming output) or exactly one classified
//! [`RunFailure`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stepflow_domain::{
    expand, metric, validate_chain, AnyItem, CacheStatus, Envelope, ExpandedStep, PipelineError, PipelineItem,
    PipelineModel, RequestContext, RequestHeaders, RunControls, RunFailure, RunId, RuntimeStep, SpanStatus,
    StepConfigOverlay, StepDescriptor, StepId, StepInput, StepOutput, StreamShape, TelemetrySink,
};

use crate::application::services::aspect_binder::{normalize_aspects, register_builtin_aspects, AspectRegistry};
use crate::application::services::step_registry::{BuildContext, StepRegistry};
use crate::infrastructure::cache::CacheSubsystem;
use crate::infrastructure::config::resolver::StepConfigResolver;
use crate::infrastructure::config::settings::FrameworkSettings;
use crate::infrastructure::health::{await_healthy, HealthCheck};
use crate::infrastructure::persistence::PersistenceRegistry;
use crate::infrastructure::runtime::cancellation::CancellationToken;
use crate::infrastructure::runtime::context;
use crate::infrastructure::runtime::kill_switch::RetryAmplificationDetector;
use crate::infrastructure::runtime::step_executor::StepEngine;

/// A materialized pipeline: the expanded, wrapped step chain plus its
/// streaming shape.
pub struct ExecutablePipeline {
    name: String,
    identity: String,
    steps: Vec<Arc<dyn RuntimeStep>>,
    input_shape: StreamShape,
    output_shape: StreamShape,
}

impl ExecutablePipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Model identity this materialization was cached under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the run boundary accepts a stream.
    pub fn input_shape(&self) -> StreamShape {
        self.input_shape
    }

    /// Whether the run boundary produces a stream.
    pub fn output_shape(&self) -> StreamShape {
        self.output_shape
    }

    /// Ids of the expanded chain, synthetic steps included; test and
    /// diagnostics helper.
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.descriptor().id().clone()).collect()
    }
}

/// Input handed to a run.
pub enum RunInput {
    Single(AnyItem),
    Stream(BoxStream<'static, Result<AnyItem, PipelineError>>),
}

impl RunInput {
    pub fn item<T: PipelineItem>(value: T) -> Self {
        RunInput::Single(AnyItem::new(value))
    }

    pub fn items<T: PipelineItem>(values: Vec<T>) -> Self {
        RunInput::Stream(Box::pin(futures::stream::iter(
            values.into_iter().map(|v| Ok(AnyItem::new(v))),
        )))
    }
}

/// Terminal output of a run.
#[derive(Debug)]
pub enum RunOutput {
    /// Single-shaped output; `None` when the item was recovered away.
    Single(Option<AnyItem>),
    /// Stream-shaped output aggregated as per-item results.
    Items(Vec<Result<AnyItem, RunFailure>>),
}

/// Summary statistics of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub items_processed: u64,
    pub peak_inflight: i64,
    pub average_inflight: f64,
    pub items_per_minute: f64,
    pub retries: u64,
    pub dead_letters: u64,
}

/// Successful run: output plus statistics.
#[derive(Debug)]
pub struct RunOutcome {
    pub output: RunOutput,
    pub report: RunReport,
    /// Cache status left on the terminal item, for single-shaped outputs.
    pub cache_status: Option<CacheStatus>,
}

impl RunOutcome {
    /// Downcasts a single-shaped output.
    pub fn single<T: PipelineItem>(&self) -> Result<Option<T>, PipelineError> {
        match &self.output {
            RunOutput::Single(None) => Ok(None),
            RunOutput::Single(Some(item)) => item.expect_cloned::<T>().map(Some),
            RunOutput::Items(_) => Err(PipelineError::internal_error(
                "run produced a stream output, not a single item",
            )),
        }
    }

    /// Downcasts a stream-shaped output, failing on the first per-item error.
    pub fn items<T: PipelineItem>(&self) -> Result<Vec<T>, PipelineError> {
        match &self.output {
            RunOutput::Single(_) => Err(PipelineError::internal_error(
                "run produced a single output, not a stream",
            )),
            RunOutput::Items(items) => items
                .iter()
                .map(|item| match item {
                    Ok(any) => any.expect_cloned::<T>(),
                    Err(failure) => Err(PipelineError::internal_error(failure.to_string())),
                })
                .collect(),
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    settings: FrameworkSettings,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            settings: FrameworkSettings::defaults(),
            telemetry: None,
            health_checks: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: FrameworkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(stepflow_domain::NoopTelemetry));
        let resolver = StepConfigResolver::from_settings(&self.settings)?;
        let engine = StepEngine::new(
            Arc::clone(&telemetry),
            self.settings.ordering,
            self.settings.effective_max_concurrency(),
        );
        let cache = Arc::new(CacheSubsystem::new(&self.settings.cache, self.settings.profile));
        let persistence = Arc::new(PersistenceRegistry::new(
            self.settings.persistence.provider.clone(),
            self.settings.profile,
        ));
        let aspects = AspectRegistry::new();
        register_builtin_aspects(&aspects, Arc::clone(&cache), Arc::clone(&persistence));

        Ok(Orchestrator {
            settings: self.settings,
            telemetry,
            engine,
            resolver,
            steps: StepRegistry::new(),
            aspects,
            cache,
            persistence,
            health_checks: self.health_checks,
            started: AtomicBool::new(false),
            built: Mutex::new(HashMap::new()),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The pipeline coordinator.
pub struct Orchestrator {
    settings: FrameworkSettings,
    telemetry: Arc<dyn TelemetrySink>,
    engine: StepEngine,
    resolver: StepConfigResolver,
    steps: StepRegistry,
    aspects: AspectRegistry,
    cache: Arc<CacheSubsystem>,
    persistence: Arc<PersistenceRegistry>,
    health_checks: Vec<Arc<dyn HealthCheck>>,
    started: AtomicBool,
    built: Mutex<HashMap<String, Arc<ExecutablePipeline>>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn aspects(&self) -> &AspectRegistry {
        &self.aspects
    }

    pub fn cache(&self) -> &Arc<CacheSubsystem> {
        &self.cache
    }

    pub fn persistence(&self) -> &Arc<PersistenceRegistry> {
        &self.persistence
    }

    /// Verifies startup dependency health and opens the run boundary.
    /// Required before `run` when health checks are registered.
    pub async fn start(&self) -> Result<(), PipelineError> {
        if !self.health_checks.is_empty() {
            await_healthy(
                &self.health_checks,
                self.settings.health.startup_timeout(),
                self.settings.health.probe_interval(),
            )
            .await?;
        }
        self.started.store(true, Ordering::SeqCst);
        info!("orchestrator started, accepting runs");
        Ok(())
    }

    /// Materializes (or fetches the cached materialization of) a pipeline
    /// model.
    pub fn build_pipeline(&self, model: &PipelineModel) -> Result<Arc<ExecutablePipeline>, PipelineError> {
        let identity = model.identity();
        if let Some(existing) = self.built.lock().get(&identity) {
            return Ok(Arc::clone(existing));
        }

        model.validate()?;

        // Resolve descriptors through the registry and check the type chain
        // before any aspect work.
        let mut descriptors: Vec<StepDescriptor> = Vec::with_capacity(model.steps.len());
        for entry in &model.steps {
            let builder = self.steps.get(&entry.id)?;
            descriptors.push(builder.descriptor(entry)?);
        }
        validate_chain(&descriptors)?;

        let aspects = normalize_aspects(&model.aspects);
        for aspect in &aspects {
            aspect.validate()?;
        }
        let expanded = expand(&descriptors, &aspects)?;

        let target_modes: HashMap<StepId, stepflow_domain::ThreadContext> = descriptors
            .iter()
            .map(|d| (d.id().clone(), d.execution_mode().thread_context()))
            .collect();

        let build_ctx = BuildContext {
            engine: &self.engine,
            resolver: &self.resolver,
        };
        let mut steps: Vec<Arc<dyn RuntimeStep>> = Vec::with_capacity(expanded.len());
        for entry in &expanded {
            match entry {
                ExpandedStep::User(descriptor) => {
                    let builder = self.steps.get(descriptor.id())?;
                    steps.push(builder.build(descriptor.clone(), &build_ctx)?);
                }
                ExpandedStep::Synthetic(synthetic) => {
                    let thread_context = target_modes
                        .get(&synthetic.target)
                        .copied()
                        .unwrap_or(stepflow_domain::ThreadContext::Async);
                    let effect = self.aspects.build(synthetic, thread_context)?;
                    let config = self
                        .resolver
                        .resolve(synthetic.descriptor.id(), &StepConfigOverlay::default())?;
                    steps.push(self.engine.wrap_synthetic(synthetic.descriptor.clone(), effect, config)?);
                }
            }
        }

        // The streaming shape at the boundary follows the user steps; the
        // synthetic side-effect steps are shape preserving.
        let input_shape = if descriptors
            .first()
            .map(|d| d.cardinality().consumes_stream())
            .unwrap_or(false)
        {
            StreamShape::Stream
        } else {
            StreamShape::Single
        };
        let output_shape = descriptors
            .iter()
            .fold(input_shape, |shape, d| shape.apply(d.cardinality()));

        let pipeline = Arc::new(ExecutablePipeline {
            name: model.name.clone(),
            identity: identity.clone(),
            steps,
            input_shape,
            output_shape,
        });
        self.built.lock().insert(identity, Arc::clone(&pipeline));
        debug!(pipeline = %pipeline.name, steps = pipeline.steps.len(), "pipeline materialized");
        Ok(pipeline)
    }

    /// Runs `model` against `input` under the control headers.
    pub async fn run(
        &self,
        model: &PipelineModel,
        input: RunInput,
        headers: &RequestHeaders,
    ) -> Result<RunOutcome, RunFailure> {
        self.run_with_overrides(model, input, headers, HashMap::new(), CancellationToken::new())
            .await
    }

    /// Runs with an externally owned cancellation handle.
    pub async fn run_cancellable(
        &self,
        model: &PipelineModel,
        input: RunInput,
        headers: &RequestHeaders,
        cancellation: CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        self.run_with_overrides(model, input, headers, HashMap::new(), cancellation)
            .await
    }

    /// Full-control run entry point: per-request step config overrides plus
    /// an external cancellation handle.
    pub async fn run_with_overrides(
        &self,
        model: &PipelineModel,
        input: RunInput,
        headers: &RequestHeaders,
        overrides: HashMap<StepId, StepConfigOverlay>,
        cancellation: CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        if !self.health_checks.is_empty() && !self.started.load(Ordering::SeqCst) {
            let error = PipelineError::HealthCheck("orchestrator not started; call start() first".to_string());
            return Err(RunFailure::from_error(&error, None));
        }

        let pipeline = self
            .build_pipeline(model)
            .map_err(|error| RunFailure::from_error(&error, None))?;

        // Context installation: headers → context, warnings logged here.
        let controls = RunControls::new(Arc::new(cancellation.clone()));
        let (mut ctx, warnings) = RequestContext::from_headers(headers, controls);
        for warning in &warnings {
            warn!(header = %warning.key, "{}", warning.message);
        }
        for (step, overlay) in overrides {
            ctx = ctx.with_step_override(step, overlay);
        }
        let ctx = Arc::new(ctx);
        let metrics = Arc::clone(ctx.controls().metrics());
        let run_id = ctx.run_id();

        let span = self.telemetry.span(metric::RUN_SPAN);
        span.set_attr("pipeline", pipeline.name.clone());
        span.set_attr("run_id", run_id.to_string());
        self.telemetry
            .gauge(metric::MAX_CONCURRENCY, &[])
            .set(self.engine.max_concurrency() as f64);

        // Kill-switch monitor: samples run metrics until the run completes.
        let monitor_done = CancellationToken::new();
        let monitor = {
            let done = monitor_done.clone();
            let run_token = cancellation.clone();
            let metrics = Arc::clone(&metrics);
            let interval = self.settings.monitor_interval();
            let mut detector = RetryAmplificationDetector::new(self.settings.kill_switch.clone());
            let kill_counter = self
                .telemetry
                .counter(metric::KILL_SWITCH_TRIGGERED, &[("reason", "retry_amplification")]);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    metrics.sample_inflight();
                    if let Some(trigger) = detector.observe(&metrics) {
                        warn!(
                            retry_rate = trigger.retry_rate,
                            inflight_growth = trigger.inflight_growth,
                            "kill switch triggered, aborting run"
                        );
                        kill_counter.inc(1);
                        metrics.mark_kill_switch();
                        run_token.cancel();
                        break;
                    }
                }
            })
        };

        let drive = self.drive(&pipeline, input, Arc::clone(&ctx));
        let result = context::scope(Arc::clone(&ctx), drive).await;
        monitor_done.cancel();
        monitor.abort();

        let report = RunReport {
            run_id,
            items_processed: metrics.items_processed(),
            peak_inflight: metrics.peak_inflight(),
            average_inflight: metrics.average_inflight(),
            items_per_minute: metrics.items_per_minute(),
            retries: metrics.retries(),
            dead_letters: metrics.dead_letters(),
        };
        span.set_attr("items", report.items_processed.to_string());
        span.set_attr("avg_inflight", format!("{:.2}", report.average_inflight));
        span.set_attr("peak_inflight", report.peak_inflight.to_string());
        span.set_attr("items_per_minute", format!("{:.2}", report.items_per_minute));

        match result {
            Ok((output, cache_status)) => {
                span.set_attr("status", "ok".to_string());
                span.set_status(SpanStatus::Ok);
                span.end();
                Ok(RunOutcome {
                    output,
                    report,
                    cache_status,
                })
            }
            Err(error) => {
                // A cancellation caused by the kill switch is reported as the
                // kill switch, not as a plain cancellation.
                let error = if metrics.kill_switch_fired() && matches!(error, PipelineError::Cancelled(_)) {
                    PipelineError::kill_switch("retry_amplification")
                } else {
                    error
                };
                if matches!(error, PipelineError::KillSwitch(_)) {
                    span.set_attr("kill_switch.triggered", "true".to_string());
                    span.set_attr("reason", "retry_amplification".to_string());
                }
                span.set_attr("status", "error".to_string());
                span.set_status(SpanStatus::Error);
                span.end();
                Err(RunFailure::from_error(&error, metrics.triggering_step()))
            }
        }
    }

    /// Applies each wrapped step in order and consumes the terminal output.
    async fn drive(
        &self,
        pipeline: &ExecutablePipeline,
        input: RunInput,
        ctx: Arc<RequestContext>,
    ) -> Result<(RunOutput, Option<CacheStatus>), PipelineError> {
        let metrics = Arc::clone(ctx.controls().metrics());

        let mut current = match input {
            RunInput::Single(item) => StepInput::Single(Envelope::new(item, Arc::clone(&ctx))),
            RunInput::Stream(stream) => {
                let stream_ctx = Arc::clone(&ctx);
                StepInput::Stream(Box::pin(
                    stream.map(move |item| item.map(|any| Envelope::new(any, Arc::clone(&stream_ctx)))),
                ))
            }
        };

        let mut last: StepOutput = StepOutput::Empty;
        for (index, step) in pipeline.steps.iter().enumerate() {
            let output = step.run(current).await?;
            if index + 1 == pipeline.steps.len() {
                last = output;
                break;
            }
            current = output.into_input();
        }

        match last {
            StepOutput::Empty => Ok((RunOutput::Single(None), None)),
            StepOutput::Single(envelope) => {
                metrics.record_item_processed();
                let cache_status = envelope.state().take_cache_status();
                Ok((RunOutput::Single(Some(envelope.item().clone())), cache_status))
            }
            StepOutput::Stream(mut stream) => {
                let mut items = Vec::new();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(envelope) => {
                            metrics.record_item_processed();
                            items.push(Ok(envelope.item().clone()));
                        }
                        Err(error) if error.is_run_fatal() => return Err(error),
                        Err(error) => {
                            items.push(Err(RunFailure::from_error(&error, metrics.triggering_step())));
                        }
                    }
                }
                if ctx.is_cancelled() {
                    return Err(PipelineError::cancelled("run cancelled"));
                }
                Ok((RunOutput::Items(items), None))
            }
        }
    }
}
