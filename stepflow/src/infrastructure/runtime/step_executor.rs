// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Engine
//!
//! Wraps typed user steps into [`RuntimeStep`]s, one wrapper shape per
//! cardinality. Every wrapper layers the same machinery around the user
//! logic:
//!
//! 1. backpressure on the stream side (input side for stream consumers,
//!    output side for expanders),
//! 2. execution-mode dispatch (inline, spawned task, or blocking pool) with
//!    the request context re-installed around the invocation,
//! 3. retry with exponential backoff and jitter for per-item invocations,
//! 4. terminal handling: dead-letter routing under `recover_on_failure`,
//!    propagation otherwise,
//! 5. telemetry: per-step inflight gauge, retry counter, latency timer.
//!
//! Stream-consuming shapes (many-to-one, many-to-many) cannot replay an
//! already consumed input stream, so their retry budget covers only the user
//! invocation that produces the output; the dead-letter path receives a
//! size-bounded sample of recently seen items instead of the full stream.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use stepflow_domain::{
    metric, AnyItem, DeadLetterEntry, Envelope, EnvelopeStream, ExecutionMode, ManyToManyStep,
    ManyToOneStep, OneToManyStep, OneToOneStep, PipelineError, PipelineItem, RequestContext, RuntimeStep,
    SideEffectStep, StepConfig, StepDescriptor, StepInput, StepOptions, StepOutput, TelemetrySink,
};

use crate::infrastructure::runtime::backpressure::with_backpressure;
use crate::infrastructure::runtime::concurrency::{effective_concurrency, OrderingPolicy};
use crate::infrastructure::runtime::context;
use crate::infrastructure::runtime::retry::{retry, RetryPolicy};

/// Items kept as a dead-letter sample for stream-shaped failures.
const DLQ_STREAM_SAMPLE: usize = 16;

/// Side effect executed against an envelope; the contract behind synthetic
/// steps (cache read/write, invalidation, persistence).
///
/// Effects may mutate the envelope's per-item state (cache status, pending
/// short-circuit) but never replace the item itself: a synthetic step is
/// identity on the data path.
#[async_trait]
pub trait EnvelopeEffect: Send + Sync {
    async fn apply(&self, envelope: &Envelope) -> Result<(), PipelineError>;
}

/// Pre-created telemetry handles for one wrapped step.
struct StepTelemetry {
    inflight: Arc<dyn stepflow_domain::Gauge>,
    retries: Arc<dyn stepflow_domain::Counter>,
    latency: Arc<dyn stepflow_domain::Timer>,
    dead_letters: Arc<dyn stepflow_domain::Counter>,
}

impl StepTelemetry {
    fn new(sink: &Arc<dyn TelemetrySink>, descriptor: &StepDescriptor) -> Self {
        let tags: &[(&str, &str)] = &[("step", descriptor.id().as_str())];
        Self {
            inflight: sink.gauge(metric::INFLIGHT, tags),
            retries: sink.counter(metric::RETRY_COUNT, tags),
            latency: sink.timer(metric::STEP_LATENCY, tags),
            dead_letters: sink.counter(metric::DEAD_LETTERED, tags),
        }
    }
}

/// Shared, cardinality-independent state of a wrapper.
struct Core {
    descriptor: StepDescriptor,
    base_config: StepConfig,
    concurrency: usize,
    sink: Arc<dyn TelemetrySink>,
    tele: StepTelemetry,
}

impl Core {
    /// Base config overlaid with the per-request override, when present and
    /// valid. An invalid per-request combination degrades to the base config
    /// rather than failing the item.
    fn effective_config(&self, ctx: &RequestContext) -> StepConfig {
        match ctx.step_override(self.descriptor.id()) {
            None => self.base_config.clone(),
            Some(overlay) => {
                let resolved = self.base_config.overlaid(overlay);
                if let Err(error) = resolved.validate() {
                    warn!(
                        step_id = %self.descriptor.id(),
                        %error,
                        "ignoring invalid per-request config override"
                    );
                    self.base_config.clone()
                } else {
                    resolved
                }
            }
        }
    }
}

/// Dispatches a user invocation according to the step's execution mode,
/// with the request context installed around it.
async fn dispatch<T, F>(mode: ExecutionMode, ctx: Arc<RequestContext>, operation: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, PipelineError>> + Send + 'static,
{
    match mode {
        ExecutionMode::Default => context::scope(ctx, operation).await,
        ExecutionMode::Async => tokio::spawn(context::scope(ctx, operation))
            .await
            .map_err(|e| PipelineError::internal_error(format!("step task failed: {e}")))?,
        ExecutionMode::Blocking => {
            let handle = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || handle.block_on(context::scope(ctx, operation)))
                .await
                .map_err(|e| PipelineError::internal_error(format!("blocking step task failed: {e}")))?
        }
    }
}

/// Per-item processing behind the shared stream mapper.
#[async_trait]
trait ItemProcessor: Send + Sync {
    /// `Ok(None)` means the item was recovered away (dead-lettered).
    async fn process(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError>;
}

/// Maps a per-item processor over an envelope stream, sequentially or as an
/// unordered merge up to `concurrency`.
fn per_item_stream(processor: Arc<dyn ItemProcessor>, stream: EnvelopeStream, concurrency: usize) -> EnvelopeStream {
    if concurrency <= 1 {
        let mapped = stream
            .then(move |item| {
                let processor = Arc::clone(&processor);
                async move {
                    match item {
                        Ok(envelope) => processor.process(envelope).await.transpose(),
                        Err(error) => Some(Err(error)),
                    }
                }
            })
            .filter_map(|item| async move { item });
        Box::pin(mapped)
    } else {
        let mapped = stream
            .map(move |item| {
                let processor = Arc::clone(&processor);
                async move {
                    match item {
                        Ok(envelope) => processor.process(envelope).await.transpose(),
                        Err(error) => Some(Err(error)),
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter_map(|item| async move { item });
        Box::pin(mapped)
    }
}

/// Builds runtime wrappers for typed steps.
///
/// One engine instance serves the whole process; wrappers share its telemetry
/// sink, ordering policy, and concurrency cap.
pub struct StepEngine {
    sink: Arc<dyn TelemetrySink>,
    ordering_policy: OrderingPolicy,
    max_concurrency: usize,
}

impl StepEngine {
    pub fn new(sink: Arc<dyn TelemetrySink>, ordering_policy: OrderingPolicy, max_concurrency: usize) -> Self {
        Self {
            sink,
            ordering_policy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn ordering_policy(&self) -> OrderingPolicy {
        self.ordering_policy
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn core<I>(
        &self,
        descriptor: StepDescriptor,
        options: &StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Core, PipelineError> {
        base_config.validate()?;
        let concurrency = effective_concurrency(
            self.ordering_policy,
            &descriptor,
            options.ordering,
            base_config.parallel,
            self.max_concurrency,
        )?;
        let tele = StepTelemetry::new(&self.sink, &descriptor);
        Ok(Core {
            descriptor,
            base_config,
            concurrency,
            sink: Arc::clone(&self.sink),
            tele,
        })
    }

    pub fn wrap_one_to_one<I: PipelineItem, O: PipelineItem>(
        &self,
        descriptor: StepDescriptor,
        step: Arc<dyn OneToOneStep<I, O>>,
        options: StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(OneToOneRuntime {
            inner: Arc::new(OneToOneInner { core, step, options }),
        }))
    }

    pub fn wrap_one_to_many<I: PipelineItem, O: PipelineItem>(
        &self,
        descriptor: StepDescriptor,
        step: Arc<dyn OneToManyStep<I, O>>,
        options: StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(OneToManyRuntime {
            inner: Arc::new(OneToManyInner { core, step, options }),
        }))
    }

    pub fn wrap_many_to_one<I: PipelineItem, O: PipelineItem>(
        &self,
        descriptor: StepDescriptor,
        step: Arc<dyn ManyToOneStep<I, O>>,
        options: StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(ManyToOneRuntime {
            inner: Arc::new(ManyToOneInner { core, step, options }),
        }))
    }

    pub fn wrap_many_to_many<I: PipelineItem, O: PipelineItem>(
        &self,
        descriptor: StepDescriptor,
        step: Arc<dyn ManyToManyStep<I, O>>,
        options: StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(ManyToManyRuntime {
            inner: Arc::new(ManyToManyInner { core, step, options }),
        }))
    }

    pub fn wrap_side_effect<I: PipelineItem>(
        &self,
        descriptor: StepDescriptor,
        step: Arc<dyn SideEffectStep<I>>,
        options: StepOptions<I>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(SideEffectRuntime {
            inner: Arc::new(SideEffectInner { core, step, options }),
        }))
    }

    /// Wraps a synthesized side-effect (cache, persistence, invalidation).
    /// Synthetic steps share the per-item machinery but have no typed
    /// dead-letter sink and never consume short-circuits.
    pub fn wrap_synthetic(
        &self,
        descriptor: StepDescriptor,
        effect: Arc<dyn EnvelopeEffect>,
        base_config: StepConfig,
    ) -> Result<Arc<dyn RuntimeStep>, PipelineError> {
        let options: StepOptions<()> = StepOptions::default();
        let core = self.core(descriptor, &options, base_config)?;
        Ok(Arc::new(SyntheticRuntime {
            inner: Arc::new(SyntheticInner { core, effect }),
        }))
    }
}

/// Instruments one user invocation: inflight gauge, run metrics, latency.
struct InvocationGuard<'a> {
    core: &'a Core,
    ctx: &'a RequestContext,
    started: Instant,
}

impl<'a> InvocationGuard<'a> {
    fn enter(core: &'a Core, ctx: &'a RequestContext) -> Self {
        core.tele.inflight.add(1.0);
        ctx.controls().metrics().invocation_started();
        Self {
            core,
            ctx,
            started: Instant::now(),
        }
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.core.tele.inflight.add(-1.0);
        self.ctx.controls().metrics().invocation_finished();
        self.core.tele.latency.record(self.started.elapsed());
    }
}

/// Terminal failure handling shared by the typed wrappers.
async fn handle_terminal_failure<I: PipelineItem>(
    core: &Core,
    options: &StepOptions<I>,
    config: &StepConfig,
    envelope: &Envelope,
    item: Option<I>,
    sample: Vec<I>,
    error: PipelineError,
) -> Result<Option<Envelope>, PipelineError> {
    // Cancellation and kill-switch failures are terminal for the run: no
    // dead-lettering, returned verbatim.
    if error.is_run_fatal() {
        return Err(error);
    }
    let metrics = envelope.context().controls().metrics();
    if !config.recover_on_failure {
        metrics.record_step_failure(core.descriptor.id());
        return Err(error);
    }

    metrics.record_dead_letter();
    core.tele.dead_letters.inc(1);
    warn!(
        step_id = %core.descriptor.id(),
        error = %error,
        "retries exhausted, routing item to dead letter sink"
    );
    if let Some(sink) = &options.dead_letter {
        let entry = match item {
            Some(value) => DeadLetterEntry::for_item(core.descriptor.id().clone(), value, error),
            None => DeadLetterEntry::for_stream(core.descriptor.id().clone(), sample, error),
        };
        if let Err(dlq_error) = sink.dead_letter(entry).await {
            warn!(
                step_id = %core.descriptor.id(),
                error = %dlq_error,
                "dead letter sink failed; item is lost"
            );
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// ONE_ONE
// ---------------------------------------------------------------------------

struct OneToOneInner<I: PipelineItem, O: PipelineItem> {
    core: Core,
    step: Arc<dyn OneToOneStep<I, O>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem, O: PipelineItem> OneToOneInner<I, O> {
    async fn process_one(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        // A BEFORE cache aspect may have armed a short-circuit: the cached
        // value replaces this step's output and the user logic is skipped.
        if let Some(cached) = envelope.state().take_short_circuit() {
            debug!(step_id = %self.core.descriptor.id(), "short-circuiting step with cached value");
            return Ok(Some(envelope.with_item(cached)));
        }

        let ctx = Arc::clone(envelope.context());
        let config = self.core.effective_config(&ctx);
        let input = match envelope.item().expect_cloned::<I>() {
            Ok(value) => value,
            Err(error) => {
                return handle_terminal_failure(&self.core, &self.options, &config, &envelope, None, vec![], error)
                    .await
            }
        };

        let cancellation = Arc::clone(ctx.controls().cancellation());
        let metrics = Arc::clone(ctx.controls().metrics());
        let guard = InvocationGuard::enter(&self.core, &ctx);
        let mode = self.options.execution_mode;
        let result = retry(
            RetryPolicy::from_config(&config),
            &cancellation,
            |_attempt| {
                self.core.tele.retries.inc(1);
                metrics.record_retry();
            },
            || {
                let step = Arc::clone(&self.step);
                let input = input.clone();
                let ctx = Arc::clone(&ctx);
                async move { dispatch(mode, ctx, async move { step.apply(input).await }).await }
            },
        )
        .await;
        drop(guard);

        match result {
            Ok(output) => Ok(Some(envelope.with_item(AnyItem::new(output)))),
            Err(error) => {
                handle_terminal_failure(&self.core, &self.options, &config, &envelope, Some(input), vec![], error)
                    .await
            }
        }
    }
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem> ItemProcessor for OneToOneInner<I, O> {
    async fn process(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        self.process_one(envelope).await
    }
}

struct OneToOneRuntime<I: PipelineItem, O: PipelineItem> {
    inner: Arc<OneToOneInner<I, O>>,
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem> RuntimeStep for OneToOneRuntime<I, O> {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        match input {
            StepInput::Empty => Ok(StepOutput::Empty),
            StepInput::Single(envelope) => match self.inner.process_one(envelope).await? {
                Some(out) => Ok(StepOutput::Single(out)),
                None => Ok(StepOutput::Empty),
            },
            StepInput::Stream(stream) => {
                let processor: Arc<dyn ItemProcessor> = Arc::clone(&self.inner) as Arc<dyn ItemProcessor>;
                Ok(StepOutput::Stream(per_item_stream(
                    processor,
                    stream,
                    self.inner.core.concurrency,
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ONE_MANY
// ---------------------------------------------------------------------------

struct OneToManyInner<I: PipelineItem, O: PipelineItem> {
    core: Core,
    step: Arc<dyn OneToManyStep<I, O>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem, O: PipelineItem> OneToManyInner<I, O> {
    /// Expands one envelope into a stream of forked children. A recovered
    /// failure yields an empty stream.
    async fn expand_one(&self, envelope: Envelope) -> EnvelopeStream {
        if let Some(cached) = envelope.state().take_short_circuit() {
            debug!(step_id = %self.core.descriptor.id(), "short-circuiting expansion with cached value");
            let child = envelope.fork(cached);
            return Box::pin(futures::stream::once(async move { Ok(child) }));
        }

        let ctx = Arc::clone(envelope.context());
        let config = self.core.effective_config(&ctx);
        let input = match envelope.item().expect_cloned::<I>() {
            Ok(value) => value,
            Err(error) => {
                return failure_stream(
                    handle_terminal_failure(&self.core, &self.options, &config, &envelope, None, vec![], error).await,
                )
            }
        };

        let cancellation = Arc::clone(ctx.controls().cancellation());
        let metrics = Arc::clone(ctx.controls().metrics());
        let guard = InvocationGuard::enter(&self.core, &ctx);
        let mode = self.options.execution_mode;
        let result = retry(
            RetryPolicy::from_config(&config),
            &cancellation,
            |_attempt| {
                self.core.tele.retries.inc(1);
                metrics.record_retry();
            },
            || {
                let step = Arc::clone(&self.step);
                let input = input.clone();
                let ctx = Arc::clone(&ctx);
                async move { dispatch(mode, ctx, async move { step.expand(input).await }).await }
            },
        )
        .await;
        drop(guard);

        match result {
            Ok(children) => {
                let parent = envelope;
                Box::pin(children.map(move |item| item.map(|output| parent.fork(AnyItem::new(output)))))
            }
            Err(error) => failure_stream(
                handle_terminal_failure(&self.core, &self.options, &config, &envelope, Some(input), vec![], error)
                    .await,
            ),
        }
    }
}

/// Converts a terminal-handling outcome into a stream: recovered → empty,
/// propagated → single error item.
fn failure_stream(outcome: Result<Option<Envelope>, PipelineError>) -> EnvelopeStream {
    match outcome {
        Ok(_) => Box::pin(futures::stream::empty()),
        Err(error) => Box::pin(futures::stream::once(async move { Err(error) })),
    }
}

struct OneToManyRuntime<I: PipelineItem, O: PipelineItem> {
    inner: Arc<OneToManyInner<I, O>>,
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem> RuntimeStep for OneToManyRuntime<I, O> {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        let ctx = context::current();
        let config = self.inner.core.effective_config(&ctx);
        let cancellation = Arc::clone(ctx.controls().cancellation());
        let run_metrics = Arc::clone(ctx.controls().metrics());

        let expanded: EnvelopeStream = match input {
            StepInput::Empty => return Ok(StepOutput::Empty),
            StepInput::Single(envelope) => self.inner.expand_one(envelope).await,
            StepInput::Stream(stream) => {
                let inner = Arc::clone(&self.inner);
                let mapped = stream.map(move |item| {
                    let inner = Arc::clone(&inner);
                    async move {
                        match item {
                            Ok(envelope) => inner.expand_one(envelope).await,
                            Err(error) => {
                                Box::pin(futures::stream::once(async move { Err(error) })) as EnvelopeStream
                            }
                        }
                    }
                });
                if self.inner.core.concurrency <= 1 {
                    Box::pin(mapped.then(|fut| fut).flatten())
                } else {
                    Box::pin(
                        mapped
                            .buffered(self.inner.core.concurrency)
                            .flatten_unordered(self.inner.core.concurrency),
                    )
                }
            }
        };

        // Backpressure applies on the expansion's output side.
        Ok(StepOutput::Stream(with_backpressure(
            expanded,
            self.inner.core.descriptor.id(),
            &config,
            &self.inner.core.sink,
            Some(run_metrics),
            cancellation,
        )))
    }
}

// ---------------------------------------------------------------------------
// MANY_ONE
// ---------------------------------------------------------------------------

struct ManyToOneInner<I: PipelineItem, O: PipelineItem> {
    core: Core,
    step: Arc<dyn ManyToOneStep<I, O>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem, O: PipelineItem> ManyToOneInner<I, O> {
    async fn fold_stream(&self, stream: EnvelopeStream) -> Result<StepOutput, PipelineError> {
        let ctx = context::current();
        let config = self.core.effective_config(&ctx);
        let cancellation = Arc::clone(ctx.controls().cancellation());
        let run_metrics = Arc::clone(ctx.controls().metrics());

        // Backpressure on the input side of the reduction.
        let mut buffered = with_backpressure(
            stream,
            self.core.descriptor.id(),
            &config,
            &self.core.sink,
            Some(Arc::clone(&run_metrics)),
            Arc::clone(&cancellation),
        );

        // Detect the empty stream without invoking the user fold.
        let first = buffered.next().await;
        if first.is_none() && !self.step.fold_on_empty() {
            return Ok(self.identity_output(&ctx));
        }

        let sample: Arc<Mutex<VecDeque<I>>> = Arc::new(Mutex::new(VecDeque::with_capacity(DLQ_STREAM_SAMPLE)));
        let sample_writer = Arc::clone(&sample);
        let typed: stepflow_domain::ItemStream<I> = Box::pin(
            futures::stream::iter(first)
                .chain(buffered)
                .map(move |item| match item {
                    Ok(envelope) => envelope.item().expect_cloned::<I>().inspect(|value| {
                        if let Ok(mut sample) = sample_writer.lock() {
                            if sample.len() == DLQ_STREAM_SAMPLE {
                                sample.pop_front();
                            }
                            sample.push_back(value.clone());
                        }
                    }),
                    Err(error) => Err(error),
                }),
        );

        let guard = InvocationGuard::enter(&self.core, &ctx);
        let step = Arc::clone(&self.step);
        let mode = self.options.execution_mode;
        // The fold consumes its input stream; a consumed stream cannot be
        // replayed, so the invocation runs once regardless of retry budget.
        let result = dispatch(mode, Arc::clone(&ctx), async move { step.fold(typed).await }).await;
        drop(guard);

        match result {
            Ok(output) => Ok(StepOutput::Single(Envelope::new(AnyItem::new(output), ctx))),
            Err(error) => {
                let sample: Vec<I> = sample.lock().map(|s| s.iter().cloned().collect()).unwrap_or_default();
                let placeholder = Envelope::new(AnyItem::new(()), Arc::clone(&ctx));
                match handle_terminal_failure(&self.core, &self.options, &config, &placeholder, None, sample, error)
                    .await?
                {
                    Some(_) => unreachable!("stream terminal handling never substitutes an item"),
                    None => Ok(StepOutput::Empty),
                }
            }
        }
    }

    fn identity_output(&self, ctx: &Arc<RequestContext>) -> StepOutput {
        match self.step.identity() {
            Some(value) => StepOutput::Single(Envelope::new(AnyItem::new(value), Arc::clone(ctx))),
            None => StepOutput::Empty,
        }
    }
}

struct ManyToOneRuntime<I: PipelineItem, O: PipelineItem> {
    inner: Arc<ManyToOneInner<I, O>>,
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem> RuntimeStep for ManyToOneRuntime<I, O> {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        match input {
            StepInput::Empty => {
                let ctx = context::current();
                if self.inner.step.fold_on_empty() {
                    self.inner.fold_stream(Box::pin(futures::stream::empty())).await
                } else {
                    Ok(self.inner.identity_output(&ctx))
                }
            }
            StepInput::Single(envelope) => {
                self.inner
                    .fold_stream(Box::pin(futures::stream::once(async move { Ok(envelope) })))
                    .await
            }
            StepInput::Stream(stream) => self.inner.fold_stream(stream).await,
        }
    }
}

// ---------------------------------------------------------------------------
// MANY_MANY
// ---------------------------------------------------------------------------

struct ManyToManyInner<I: PipelineItem, O: PipelineItem> {
    core: Core,
    step: Arc<dyn ManyToManyStep<I, O>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem, O: PipelineItem> ManyToManyInner<I, O> {
    async fn transform_stream(&self, stream: EnvelopeStream) -> Result<StepOutput, PipelineError> {
        let ctx = context::current();
        let config = self.core.effective_config(&ctx);
        let cancellation = Arc::clone(ctx.controls().cancellation());
        let run_metrics = Arc::clone(ctx.controls().metrics());

        let buffered = with_backpressure(
            stream,
            self.core.descriptor.id(),
            &config,
            &self.core.sink,
            Some(run_metrics),
            cancellation,
        );

        let sample: Arc<Mutex<VecDeque<I>>> = Arc::new(Mutex::new(VecDeque::with_capacity(DLQ_STREAM_SAMPLE)));
        let sample_writer = Arc::clone(&sample);
        let typed: stepflow_domain::ItemStream<I> = Box::pin(buffered.map(move |item| match item {
            Ok(envelope) => envelope.item().expect_cloned::<I>().inspect(|value| {
                if let Ok(mut sample) = sample_writer.lock() {
                    if sample.len() == DLQ_STREAM_SAMPLE {
                        sample.pop_front();
                    }
                    sample.push_back(value.clone());
                }
            }),
            Err(error) => Err(error),
        }));

        let guard = InvocationGuard::enter(&self.core, &ctx);
        let step = Arc::clone(&self.step);
        let mode = self.options.execution_mode;
        // Like the fold, the transform owns its input stream and runs once.
        let result = dispatch(mode, Arc::clone(&ctx), async move { step.transform(typed).await }).await;
        drop(guard);

        match result {
            Ok(outputs) => {
                let out_ctx = Arc::clone(&ctx);
                let mapped = outputs.map(move |item| {
                    item.map(|output| Envelope::new(AnyItem::new(output), Arc::clone(&out_ctx)))
                });
                Ok(StepOutput::Stream(Box::pin(mapped)))
            }
            Err(error) => {
                let sample: Vec<I> = sample.lock().map(|s| s.iter().cloned().collect()).unwrap_or_default();
                let placeholder = Envelope::new(AnyItem::new(()), Arc::clone(&ctx));
                match handle_terminal_failure(&self.core, &self.options, &config, &placeholder, None, sample, error)
                    .await?
                {
                    Some(_) => unreachable!("stream terminal handling never substitutes an item"),
                    None => Ok(StepOutput::Stream(Box::pin(futures::stream::empty()))),
                }
            }
        }
    }
}

struct ManyToManyRuntime<I: PipelineItem, O: PipelineItem> {
    inner: Arc<ManyToManyInner<I, O>>,
}

#[async_trait]
impl<I: PipelineItem, O: PipelineItem> RuntimeStep for ManyToManyRuntime<I, O> {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        match input {
            StepInput::Empty => self.inner.transform_stream(Box::pin(futures::stream::empty())).await,
            StepInput::Single(envelope) => {
                self.inner
                    .transform_stream(Box::pin(futures::stream::once(async move { Ok(envelope) })))
                    .await
            }
            StepInput::Stream(stream) => self.inner.transform_stream(stream).await,
        }
    }
}

// ---------------------------------------------------------------------------
// SIDE_EFFECT (user-declared)
// ---------------------------------------------------------------------------

struct SideEffectInner<I: PipelineItem> {
    core: Core,
    step: Arc<dyn SideEffectStep<I>>,
    options: StepOptions<I>,
}

impl<I: PipelineItem> SideEffectInner<I> {
    async fn process_one(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        if let Some(cached) = envelope.state().take_short_circuit() {
            return Ok(Some(envelope.with_item(cached)));
        }

        let ctx = Arc::clone(envelope.context());
        let config = self.core.effective_config(&ctx);
        let input = match envelope.item().expect_cloned::<I>() {
            Ok(value) => value,
            Err(error) => {
                return handle_terminal_failure(&self.core, &self.options, &config, &envelope, None, vec![], error)
                    .await
            }
        };

        let cancellation = Arc::clone(ctx.controls().cancellation());
        let metrics = Arc::clone(ctx.controls().metrics());
        let guard = InvocationGuard::enter(&self.core, &ctx);
        let mode = self.options.execution_mode;
        let result = retry(
            RetryPolicy::from_config(&config),
            &cancellation,
            |_attempt| {
                self.core.tele.retries.inc(1);
                metrics.record_retry();
            },
            || {
                let step = Arc::clone(&self.step);
                let input = input.clone();
                let ctx = Arc::clone(&ctx);
                async move { dispatch(mode, ctx, async move { step.observe(&input).await }).await }
            },
        )
        .await;
        drop(guard);

        match result {
            // Identity law: downstream sees exactly the upstream item.
            Ok(()) => Ok(Some(envelope)),
            Err(error) => {
                handle_terminal_failure(&self.core, &self.options, &config, &envelope, Some(input), vec![], error)
                    .await
            }
        }
    }
}

#[async_trait]
impl<I: PipelineItem> ItemProcessor for SideEffectInner<I> {
    async fn process(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        self.process_one(envelope).await
    }
}

struct SideEffectRuntime<I: PipelineItem> {
    inner: Arc<SideEffectInner<I>>,
}

#[async_trait]
impl<I: PipelineItem> RuntimeStep for SideEffectRuntime<I> {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        match input {
            StepInput::Empty => Ok(StepOutput::Empty),
            StepInput::Single(envelope) => match self.inner.process_one(envelope).await? {
                Some(out) => Ok(StepOutput::Single(out)),
                None => Ok(StepOutput::Empty),
            },
            StepInput::Stream(stream) => {
                let processor: Arc<dyn ItemProcessor> = Arc::clone(&self.inner) as Arc<dyn ItemProcessor>;
                Ok(StepOutput::Stream(per_item_stream(
                    processor,
                    stream,
                    self.inner.core.concurrency,
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Synthetic side-effect steps (aspects)
// ---------------------------------------------------------------------------

struct SyntheticInner {
    core: Core,
    effect: Arc<dyn EnvelopeEffect>,
}

impl SyntheticInner {
    async fn process_one(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        let ctx = Arc::clone(envelope.context());
        let config = self.core.effective_config(&ctx);
        let cancellation = Arc::clone(ctx.controls().cancellation());
        let metrics = Arc::clone(ctx.controls().metrics());

        let guard = InvocationGuard::enter(&self.core, &ctx);
        let result = retry(
            RetryPolicy::from_config(&config),
            &cancellation,
            |_attempt| {
                self.core.tele.retries.inc(1);
                metrics.record_retry();
            },
            || {
                let effect = Arc::clone(&self.effect);
                let envelope = envelope.clone();
                let ctx = Arc::clone(&ctx);
                async move { context::scope(ctx, async move { effect.apply(&envelope).await }).await }
            },
        )
        .await;
        drop(guard);

        match result {
            Ok(()) => Ok(Some(envelope)),
            Err(error) if error.is_run_fatal() => Err(error),
            Err(error) => {
                if config.recover_on_failure {
                    metrics.record_dead_letter();
                    self.core.tele.dead_letters.inc(1);
                    warn!(
                        step_id = %self.core.descriptor.id(),
                        error = %error,
                        "synthetic side effect failed terminally, dropping item"
                    );
                    Ok(None)
                } else {
                    metrics.record_step_failure(self.core.descriptor.id());
                    Err(error)
                }
            }
        }
    }
}

#[async_trait]
impl ItemProcessor for SyntheticInner {
    async fn process(&self, envelope: Envelope) -> Result<Option<Envelope>, PipelineError> {
        self.process_one(envelope).await
    }
}

struct SyntheticRuntime {
    inner: Arc<SyntheticInner>,
}

#[async_trait]
impl RuntimeStep for SyntheticRuntime {
    fn descriptor(&self) -> &StepDescriptor {
        &self.inner.core.descriptor
    }

    async fn run(&self, input: StepInput) -> Result<StepOutput, PipelineError> {
        match input {
            StepInput::Empty => Ok(StepOutput::Empty),
            StepInput::Single(envelope) => match self.inner.process_one(envelope).await? {
                Some(out) => Ok(StepOutput::Single(out)),
                None => Ok(StepOutput::Empty),
            },
            StepInput::Stream(stream) => {
                let processor: Arc<dyn ItemProcessor> = Arc::clone(&self.inner) as Arc<dyn ItemProcessor>;
                Ok(StepOutput::Stream(per_item_stream(
                    processor,
                    stream,
                    self.inner.core.concurrency,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stepflow_domain::{Cardinality, NoopTelemetry, RunControls, StepId, TypeTag};

    fn engine() -> StepEngine {
        StepEngine::new(Arc::new(NoopTelemetry), OrderingPolicy::Auto, 4)
    }

    fn descriptor(id: &str, cardinality: Cardinality) -> StepDescriptor {
        StepDescriptor::new(
            StepId::new(id).unwrap(),
            TypeTag::of::<String>(),
            TypeTag::of::<String>(),
            cardinality,
            ExecutionMode::Default,
        )
        .unwrap()
    }

    fn envelope(value: &str) -> Envelope {
        Envelope::new(
            AnyItem::new(value.to_string()),
            Arc::new(RequestContext::new(RunControls::detached())),
        )
    }

    struct Upper;

    #[async_trait]
    impl OneToOneStep<String, String> for Upper {
        async fn apply(&self, input: String) -> Result<String, PipelineError> {
            Ok(input.to_uppercase())
        }
    }

    struct FailTwice {
        calls: AtomicU32,
    }

    #[async_trait]
    impl OneToOneStep<String, String> for FailTwice {
        async fn apply(&self, input: String) -> Result<String, PipelineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PipelineError::transient("not yet"))
            } else {
                Ok(input)
            }
        }
    }

    struct Count;

    #[async_trait]
    impl ManyToOneStep<String, u64> for Count {
        async fn fold(&self, inputs: stepflow_domain::ItemStream<String>) -> Result<u64, PipelineError> {
            let mut count = 0u64;
            let mut inputs = inputs;
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

    #[tokio::test]
    async fn test_one_to_one_single() {
        let wrapped = engine()
            .wrap_one_to_one(
                descriptor("upper", Cardinality::OneToOne),
                Arc::new(Upper),
                StepOptions::default(),
                StepConfig::framework_defaults(),
            )
            .unwrap();

        let out = wrapped.run(StepInput::Single(envelope("abc"))).await.unwrap();
        match out {
            StepOutput::Single(env) => assert_eq!(env.item().downcast_cloned::<String>().unwrap(), "ABC"),
            _ => panic!("expected single output"),
        }
    }

    #[tokio::test]
    async fn test_retry_then_success_invocation_count() {
        let step = Arc::new(FailTwice { calls: AtomicU32::new(0) });
        let config = StepConfig {
            retry_limit: 3,
            retry_wait: std::time::Duration::from_millis(5),
            max_backoff: std::time::Duration::from_millis(50),
            ..StepConfig::framework_defaults()
        };
        let wrapped = engine()
            .wrap_one_to_one(
                descriptor("flaky", Cardinality::OneToOne),
                Arc::clone(&step) as Arc<dyn OneToOneStep<String, String>>,
                StepOptions::default(),
                config,
            )
            .unwrap();

        let out = wrapped.run(StepInput::Single(envelope("x"))).await.unwrap();
        assert!(matches!(out, StepOutput::Single(_)));
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_terminal() {
        let wrapped = engine()
            .wrap_one_to_one(
                descriptor("upper", Cardinality::OneToOne),
                Arc::new(Upper) as Arc<dyn OneToOneStep<String, String>>,
                StepOptions::default(),
                StepConfig::framework_defaults(),
            )
            .unwrap();

        let bad = Envelope::new(
            AnyItem::new(17u64),
            Arc::new(RequestContext::new(RunControls::detached())),
        );
        let err = wrapped.run(StepInput::Single(bad)).await.unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn test_empty_input_to_many_to_one_uses_identity() {
        let wrapped = engine()
            .wrap_many_to_one(
                StepDescriptor::new(
                    StepId::new("count").unwrap(),
                    TypeTag::of::<String>(),
                    TypeTag::of::<u64>(),
                    Cardinality::ManyToOne,
                    ExecutionMode::Default,
                )
                .unwrap(),
                Arc::new(Count),
                StepOptions::default(),
                StepConfig::framework_defaults(),
            )
            .unwrap();

        let out = wrapped
            .run(StepInput::Stream(Box::pin(futures::stream::empty())))
            .await
            .unwrap();
        match out {
            StepOutput::Single(env) => assert_eq!(env.item().downcast_cloned::<u64>().unwrap(), 0),
            _ => panic!("expected identity output"),
        }
    }

    #[tokio::test]
    async fn test_short_circuit_skips_user_logic() {
        let step = Arc::new(FailTwice { calls: AtomicU32::new(0) });
        let wrapped = engine()
            .wrap_one_to_one(
                descriptor("flaky", Cardinality::OneToOne),
                Arc::clone(&step) as Arc<dyn OneToOneStep<String, String>>,
                StepOptions::default(),
                StepConfig::framework_defaults(),
            )
            .unwrap();

        let env = envelope("ignored");
        env.state().set_short_circuit(AnyItem::new("cached".to_string()));
        let out = wrapped.run(StepInput::Single(env)).await.unwrap();
        match out {
            StepOutput::Single(env) => assert_eq!(env.item().downcast_cloned::<String>().unwrap(), "cached"),
            _ => panic!("expected single output"),
        }
        assert_eq!(step.calls.load(Ordering::SeqCst), 0);
    }
}
