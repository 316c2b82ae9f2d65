//! The step engine: wraps an untrusted user step with retry, backpressure,
//! dead-lettering, batching, and telemetry — uniformly across all shapes.
//!
//! Each [`StepRunner`] turns one resolved step into a stream operator. An
//! item's journey is `PENDING → IN_FLIGHT → {EMITTED | RETRY_WAITING →
//! IN_FLIGHT | DLQ | FAILED}`; retries happen at the boundary where the user
//! function is invoked, with the backoff math from [`crate::backoff`].

use crate::backoff::Backoff;
use crate::buffer::bounded;
use crate::cache::{CacheExecutor, CachePolicy, CacheRequest};
use crate::classify::is_retryable;
use crate::config::StepConfig;
use crate::context::ContextHandle;
use crate::error::{BoxError, PipelineError};
use crate::jitter::Jitter;
use crate::pacer::Pacer;
use crate::parallelism::MergeStrategy;
use crate::step::{Item, ItemStream, ShapeInner, Step, StepYield};
use crate::telemetry::{emit, PipelineEvent, SharedSink, StepEvent};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

/// The composed flow between steps: items or per-lineage failures.
pub(crate) type Flow = BoxStream<'static, Result<Item, PipelineError>>;

/// Cache wiring attached to a marked client step.
#[derive(Clone)]
pub(crate) struct CacheWiring {
    pub(crate) policy: CachePolicy,
    pub(crate) executor: CacheExecutor,
}

/// Everything one step needs at run time.
#[derive(Clone)]
pub(crate) struct StepRunner {
    pub(crate) step: Arc<Step>,
    pub(crate) config: StepConfig,
    pub(crate) strategy: MergeStrategy,
    pub(crate) sink: SharedSink,
    pub(crate) pacer: Pacer,
    pub(crate) cache: Option<CacheWiring>,
}

/// Outcome of processing one item through the retry/DLQ boundary.
enum Processed {
    Emit(Item),
    /// Dead-lettered with no replacement; the item leaves the flow.
    Skip,
}

impl StepRunner {
    /// Wrap `input` with this step's operator.
    pub(crate) fn apply(&self, input: Flow, ctx: &ContextHandle) -> Flow {
        let inner = match self.step.shape.inner {
            ShapeInner::OneToOne(_) | ShapeInner::SideEffect(_) => self.apply_unary(input, ctx),
            ShapeInner::OneToMany(_) => self.apply_fanout(input, ctx),
            ShapeInner::ManyToOne(_) => self.apply_batched(input, ctx),
            ShapeInner::ManyToMany(_) => self.apply_stream(input, ctx),
        };
        instrumented(self.step.name.clone(), self.sink.clone(), inner)
    }

    fn apply_unary(&self, input: Flow, ctx: &ContextHandle) -> Flow {
        let runner = self.clone();
        let ctx = ctx.clone();
        let mapped = input.map(move |res| {
            let runner = runner.clone();
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok(item) => match runner.run_one(item, &ctx).await {
                        Ok(Processed::Emit(item)) => Some(Ok(item)),
                        Ok(Processed::Skip) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(e)),
                }
            }
        });
        // `buffered` keeps output order even when invocations overlap, so
        // OneToOne ordering holds under either strategy.
        let flattened = match self.strategy {
            MergeStrategy::Concat => mapped.buffered(1),
            MergeStrategy::Merge { concurrency } => mapped.buffered(concurrency),
        };
        flattened.filter_map(futures::future::ready).boxed()
    }

    fn apply_fanout(&self, input: Flow, ctx: &ContextHandle) -> Flow {
        let runner = self.clone();
        let ctx = ctx.clone();
        let subs = input.map(move |res| {
            let runner = runner.clone();
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok(item) => runner.run_fanout(item, &ctx).await,
                    Err(e) => futures::stream::iter(vec![Err(e)]).boxed(),
                }
            }
        });
        match self.strategy {
            MergeStrategy::Concat => subs.buffered(1).flatten().boxed(),
            MergeStrategy::Merge { concurrency } => {
                subs.buffered(concurrency).flatten_unordered(concurrency).boxed()
            }
        }
    }

    fn apply_batched(&self, input: Flow, ctx: &ContextHandle) -> Flow {
        let runner = self.clone();
        let ctx = ctx.clone();
        let batched = batches(input, self.config.batch_size(), self.config.batch_timeout());
        let mapped = batched.map(move |res| {
            let runner = runner.clone();
            let ctx = ctx.clone();
            async move {
                match res {
                    Ok(batch) => match runner.run_batch(batch, &ctx).await {
                        Ok(Processed::Emit(item)) => Some(Ok(item)),
                        Ok(Processed::Skip) => None,
                        Err(e) => Some(Err(e)),
                    },
                    Err(e) => Some(Err(e)),
                }
            }
        });
        let flattened = match self.strategy {
            MergeStrategy::Concat => mapped.buffered(1),
            MergeStrategy::Merge { concurrency } => mapped.buffered(concurrency),
        };
        flattened.filter_map(futures::future::ready).boxed()
    }

    fn apply_stream(&self, input: Flow, ctx: &ContextHandle) -> Flow {
        let runner = self.clone();
        let ctx = ctx.clone();
        Box::pin(stream! {
            let func = match &runner.step.shape.inner {
                ShapeInner::ManyToMany(func) => func.clone(),
                _ => unreachable!("apply_stream is only called for ManyToMany"),
            };
            let items: ItemStream = input
                .map(|r| r.map_err(|e| Box::new(e) as BoxError))
                .boxed();
            // The input is single-use, so the factory call is retried only
            // while it has not started consuming. Each attempt gets a lease
            // that takes the real stream out of the slot on first poll.
            let source: Arc<Mutex<Option<ItemStream>>> = Arc::new(Mutex::new(Some(items)));
            let mut attempt: u32 = 1;
            let outcome = loop {
                let lease = FactoryLease { source: source.clone(), inner: None };
                match func(lease.boxed(), ctx.clone()).await {
                    Ok(out) => break Ok(out),
                    Err(error) => {
                        let consumed =
                            source.lock().unwrap_or_else(|p| p.into_inner()).is_none();
                        if consumed {
                            emit(
                                &runner.sink,
                                PipelineEvent::Step(StepEvent::Failure {
                                    step: runner.step.name.clone(),
                                    attempts: attempt,
                                }),
                            )
                            .await;
                            break Err(error);
                        }
                        match runner.after_failure(attempt, error).await {
                            RetryDecision::RetryNow => attempt += 1,
                            RetryDecision::GiveUp(error) => break Err(error),
                        }
                    }
                }
            };
            match outcome {
                Ok(out) => {
                    let mut out = bounded(
                        out,
                        runner.config.buffer_capacity(),
                        runner.config.buffer_strategy(),
                        runner.step.name.clone(),
                        runner.sink.clone(),
                    );
                    while let Some(res) = out.next().await {
                        yield res.map_err(|e| runner.step_failure(1, e));
                    }
                }
                Err(error) => {
                    yield Err(runner.step_failure(attempt, error));
                }
            }
        })
    }

    /// Retry/DLQ boundary for the unary shapes (OneToOne, SideEffect).
    async fn run_one(&self, item: Item, ctx: &ContextHandle) -> Result<Processed, PipelineError> {
        emit(&self.sink, PipelineEvent::Step(StepEvent::Item { step: self.step.name.clone() }))
            .await;
        let mut attempt: u32 = 1;
        loop {
            let result: Result<StepYield, BoxError> = match &self.step.shape.inner {
                ShapeInner::OneToOne(func) => match &self.cache {
                    Some(wiring) => {
                        wiring
                            .executor
                            .run(
                                wiring.policy,
                                CacheRequest {
                                    step: &self.step.name,
                                    type_name: self.step.input.name(),
                                    item: &item,
                                    ctx,
                                    request_codec: self.step.request_codec.as_ref(),
                                    response_codec: self.step.response_codec.as_ref(),
                                },
                                Some(func),
                            )
                            .await
                    }
                    None => func(&item, ctx.clone()).await,
                },
                ShapeInner::SideEffect(func) => {
                    func(&item, ctx.clone()).await.map(|()| StepYield::Original)
                }
                _ => unreachable!("run_one only handles unary shapes"),
            };

            match result {
                Ok(StepYield::Item(out)) => return Ok(Processed::Emit(out)),
                Ok(StepYield::Original) => return Ok(Processed::Emit(item)),
                Err(error) => match self.after_failure(attempt, error).await {
                    RetryDecision::RetryNow => attempt += 1,
                    RetryDecision::GiveUp(error) => return self.recover(item, attempt, error).await,
                },
            }
        }
    }

    /// Retry the sub-stream factory call, then bound the sub-stream.
    async fn run_fanout(&self, item: Item, ctx: &ContextHandle) -> Flow {
        emit(&self.sink, PipelineEvent::Step(StepEvent::Item { step: self.step.name.clone() }))
            .await;
        let func = match &self.step.shape.inner {
            ShapeInner::OneToMany(func) => func.clone(),
            _ => unreachable!("run_fanout is only called for OneToMany"),
        };
        let mut attempt: u32 = 1;
        loop {
            match func(&item, ctx.clone()).await {
                Ok(sub) => {
                    let failure = self.clone();
                    let sub = sub.map(move |r| r.map_err(|e| failure.step_failure(1, e)));
                    return bounded(
                        sub.boxed(),
                        self.config.buffer_capacity(),
                        self.config.buffer_strategy(),
                        self.step.name.clone(),
                        self.sink.clone(),
                    );
                }
                Err(error) => match self.after_failure(attempt, error).await {
                    RetryDecision::RetryNow => attempt += 1,
                    RetryDecision::GiveUp(error) => {
                        return match self.recover(item, attempt, error).await {
                            Ok(Processed::Emit(item)) => {
                                futures::stream::iter(vec![Ok(item)]).boxed()
                            }
                            Ok(Processed::Skip) => futures::stream::empty().boxed(),
                            Err(e) => futures::stream::iter(vec![Err(e)]).boxed(),
                        };
                    }
                },
            }
        }
    }

    /// Retry boundary for one accumulated batch.
    async fn run_batch(
        &self,
        batch: Vec<Item>,
        ctx: &ContextHandle,
    ) -> Result<Processed, PipelineError> {
        emit(&self.sink, PipelineEvent::Step(StepEvent::Item { step: self.step.name.clone() }))
            .await;
        let func = match &self.step.shape.inner {
            ShapeInner::ManyToOne(func) => func.clone(),
            _ => unreachable!("run_batch is only called for ManyToOne"),
        };
        let mut attempt: u32 = 1;
        loop {
            match func(&batch, ctx.clone()).await {
                Ok(out) => return Ok(Processed::Emit(out)),
                Err(error) => match self.after_failure(attempt, error).await {
                    RetryDecision::RetryNow => attempt += 1,
                    RetryDecision::GiveUp(error) => {
                        // A batch has no single replacement item; recovery
                        // drops it after recording the dead letter.
                        if self.config.recover_on_failure() {
                            emit(
                                &self.sink,
                                PipelineEvent::Step(StepEvent::DeadLetter {
                                    step: self.step.name.clone(),
                                }),
                            )
                            .await;
                            return Ok(Processed::Skip);
                        }
                        return Err(self.step_failure(attempt, error));
                    }
                },
            }
        }
    }

    /// Classify, wait out the backoff, and decide whether to go again.
    async fn after_failure(&self, attempt: u32, error: BoxError) -> RetryDecision {
        if !is_retryable(&*error) || attempt >= self.config.retry_limit() {
            emit(
                &self.sink,
                PipelineEvent::Step(StepEvent::Failure {
                    step: self.step.name.clone(),
                    attempts: attempt,
                }),
            )
            .await;
            return RetryDecision::GiveUp(error);
        }

        let backoff = Backoff::new(self.config.retry_wait(), self.config.max_backoff());
        let delay =
            self.pacer.plan(&backoff, Jitter::from_flag(self.config.jitter()), attempt);
        emit(
            &self.sink,
            PipelineEvent::Step(StepEvent::Retry {
                step: self.step.name.clone(),
                attempt: attempt + 1,
                delay,
            }),
        )
        .await;
        self.pacer.pause(delay).await;
        RetryDecision::RetryNow
    }

    /// Exhausted: either dead-letter the item or surface the failure.
    async fn recover(
        &self,
        item: Item,
        attempts: u32,
        error: BoxError,
    ) -> Result<Processed, PipelineError> {
        if !self.config.recover_on_failure() {
            return Err(self.step_failure(attempts, error));
        }

        emit(&self.sink, PipelineEvent::Step(StepEvent::DeadLetter { step: self.step.name.clone() }))
            .await;
        if matches!(self.step.shape.inner, ShapeInner::SideEffect(_)) {
            // A side effect never changes the element: continue with the
            // original input.
            return Ok(Processed::Emit(item));
        }
        match &self.step.dead_letter {
            Some(handler) => match handler(&item, &error) {
                Some(replacement) => Ok(Processed::Emit(replacement)),
                None => Ok(Processed::Skip),
            },
            None => {
                tracing::warn!(
                    step = %self.step.name,
                    "recover-on-failure set but no dead-letter handler; dropping item"
                );
                Ok(Processed::Skip)
            }
        }
    }

    fn step_failure(&self, attempts: u32, source: BoxError) -> PipelineError {
        PipelineError::Step { step: self.step.name.clone(), attempts, source }
    }
}

enum RetryDecision {
    RetryNow,
    GiveUp(BoxError),
}

/// Hands the single-use input stream to one factory attempt.
///
/// The real stream leaves the shared slot only when the factory starts
/// polling; a failed attempt that never polled leaves it in place for the
/// next attempt, while a drained slot marks the failure unreplayable.
struct FactoryLease {
    source: Arc<Mutex<Option<ItemStream>>>,
    inner: Option<ItemStream>,
}

impl futures::Stream for FactoryLease {
    type Item = Result<Item, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.inner.is_none() {
            let taken = self.source.lock().unwrap_or_else(|p| p.into_inner()).take();
            match taken {
                Some(stream) => self.inner = Some(stream),
                None => return Poll::Ready(None),
            }
        }
        match self.inner.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Group upstream items into batches of `size`, flushing early when
/// `timeout` elapses after the first item of a batch. Failures pass through
/// immediately without joining a batch.
fn batches(
    input: Flow,
    size: usize,
    timeout: Duration,
) -> BoxStream<'static, Result<Vec<Item>, PipelineError>> {
    Box::pin(stream! {
        let mut input = input;
        let mut batch: Vec<Item> = Vec::new();
        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, input.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if !batch.is_empty() {
                            yield Ok(std::mem::take(&mut batch));
                        }
                        deadline = None;
                        continue;
                    }
                },
                None => input.next().await,
            };
            match next {
                Some(Ok(item)) => {
                    if batch.is_empty() {
                        deadline = Some(tokio::time::Instant::now() + timeout);
                    }
                    batch.push(item);
                    if batch.len() >= size {
                        yield Ok(std::mem::take(&mut batch));
                        deadline = None;
                    }
                }
                Some(Err(e)) => yield Err(e),
                None => {
                    if !batch.is_empty() {
                        yield Ok(std::mem::take(&mut batch));
                    }
                    break;
                }
            }
        }
    })
}

/// Emit step-start on first poll and step-complete with counters at the end.
fn instrumented(step: String, sink: SharedSink, inner: Flow) -> Flow {
    Box::pin(stream! {
        emit(&sink, PipelineEvent::Step(StepEvent::Started { step: step.clone() })).await;
        let mut items: u64 = 0;
        let mut failed: u64 = 0;
        let mut inner = inner;
        while let Some(res) = inner.next().await {
            match &res {
                Ok(_) => items += 1,
                Err(_) => failed += 1,
            }
            yield res;
        }
        emit(&sink, PipelineEvent::Step(StepEvent::Completed { step, items, failed })).await;
    })
}
