//! Pipeline composition and execution.
//!
//! [`PipelineBuilder`] collects steps, aspects, handlers, strategies, and
//! settings, then `build()` runs the aspect expander, resolves every
//! effective step, merges configs, and validates neighbour types. The
//! resulting [`Pipeline`] exposes the four run entries, each returning
//! lazily-evaluated results with the flow context bound for the duration of
//! the call and cleared on every exit path.

use crate::aspect::{expand, Aspect, CacheMark, EffectiveStep, SideEffectHandler, StepCard};
use crate::cache::{CacheBackend, CacheExecutor, KeyRegistry, KeyStrategy};
use crate::config::{StepConfig, StepOverrides};
use crate::context::{ContextHandle, PipelineContext};
use crate::engine::{CacheWiring, Flow, StepRunner};
use crate::error::{ConfigError, PipelineError};
use crate::health::{await_startup, DependencyHealth, ReadinessReport};
use crate::parallelism::merge_strategy;
use crate::settings::PipelineSettings;
use crate::pacer::Pacer;
use crate::step::{EffectFn, ElementType, Item, ShapeKind, Step};
use crate::telemetry::{shared, NullSink, SharedSink, TelemetrySink};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use pin_project::{pin_project, pinned_drop};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Builder collecting everything a pipeline needs before composition.
pub struct PipelineBuilder {
    steps: Vec<Step>,
    aspects: Vec<Aspect>,
    handlers: HashMap<String, SideEffectHandler>,
    strategies: Vec<Arc<dyn KeyStrategy>>,
    backend: Option<Arc<dyn CacheBackend>>,
    settings: PipelineSettings,
    sink: SharedSink,
    pacer: Pacer,
    health: Vec<Arc<dyn DependencyHealth>>,
    transport_suffix: String,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            aspects: Vec::new(),
            handlers: HashMap::new(),
            strategies: Vec::new(),
            backend: None,
            settings: PipelineSettings::default(),
            sink: shared(NullSink),
            pacer: Pacer::timer(),
            health: Vec::new(),
            transport_suffix: String::new(),
        }
    }

    /// Append a step to the declared order.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare an aspect.
    pub fn aspect(mut self, aspect: Aspect) -> Self {
        self.aspects.push(aspect);
        self
    }

    /// Register the side-effect handler backing an aspect name.
    pub fn side_effect_handler(
        mut self,
        aspect: impl Into<String>,
        handler: SideEffectHandler,
    ) -> Self {
        self.handlers.insert(aspect.into(), handler);
        self
    }

    /// Register a cache key strategy.
    pub fn key_strategy(mut self, strategy: Arc<dyn KeyStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Wire the cache backend used by cache-marked steps and invalidators.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Telemetry sink receiving all pipeline events.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.sink = shared(sink);
        self
    }

    /// Replace the pacer used for retry backoff and health polling.
    pub fn pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Register a startup health dependency.
    pub fn health_dependency(mut self, dependency: Arc<dyn DependencyHealth>) -> Self {
        self.health.push(dependency);
        self
    }

    /// Transport suffix used in synthetic step names (e.g. `"Grpc"`).
    pub fn transport_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.transport_suffix = suffix.into();
        self
    }

    /// Expand aspects, resolve steps, merge configs, and validate types.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let PipelineBuilder {
            steps,
            aspects,
            handlers,
            strategies,
            backend,
            settings,
            sink,
            pacer,
            health,
            transport_suffix,
        } = self;

        if steps.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "steps",
                reason: "a pipeline needs at least one step".into(),
            });
        }
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.name().to_string()) {
                return Err(ConfigError::DuplicateStep { name: step.name().to_string() });
            }
        }

        let cards: Vec<StepCard> = steps
            .iter()
            .map(|s| StepCard { name: s.name().to_string(), input: s.input(), output: s.output() })
            .collect();
        let effective = expand(&cards, &aspects, &transport_suffix)?;
        let registry = Arc::new(KeyRegistry::new(strategies));
        let mut steps_by_name: HashMap<String, Step> =
            steps.into_iter().map(|s| (s.name().to_string(), s)).collect();

        let mut runners = Vec::with_capacity(effective.len());
        for entry in effective {
            let runner = match entry {
                EffectiveStep::User { name, cache } => {
                    let step = steps_by_name
                        .remove(&name)
                        .ok_or_else(|| ConfigError::UnknownStep { name: name.clone() })?;
                    let declared = settings.overrides_for(&name).overlay(&step.overrides);
                    let (config, _) = StepConfig::resolve(
                        &settings.defaults,
                        &declared,
                        &StepOverrides::default(),
                    )?;
                    let wiring = cache
                        .map(|mark| {
                            cache_wiring(&step, mark, &backend, &registry, &settings, &sink)
                        })
                        .transpose()?;
                    let strategy = merge_strategy(
                        settings.parallelism,
                        config.ordering(),
                        config.thread_safety(),
                        settings.max_concurrency,
                        &name,
                    );
                    StepRunner {
                        step: Arc::new(step),
                        config,
                        strategy,
                        sink: sink.clone(),
                        pacer: pacer.clone(),
                        cache: wiring,
                    }
                }
                EffectiveStep::Synthetic(synthetic) => {
                    let func = resolve_handler(
                        &synthetic,
                        &handlers,
                        &backend,
                        &registry,
                        &settings,
                        &sink,
                    )?;
                    let step =
                        Step::from_effect(synthetic.name.clone(), synthetic.element, func);
                    let (config, _) = StepConfig::resolve(
                        &settings.defaults,
                        &settings.overrides_for(&synthetic.name),
                        &synthetic.overrides,
                    )?;
                    let strategy = merge_strategy(
                        settings.parallelism,
                        config.ordering(),
                        config.thread_safety(),
                        settings.max_concurrency,
                        &synthetic.name,
                    );
                    StepRunner {
                        step: Arc::new(step),
                        config,
                        strategy,
                        sink: sink.clone(),
                        pacer: pacer.clone(),
                        cache: None,
                    }
                }
            };
            runners.push(runner);
        }

        for pair in runners.windows(2) {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            if upstream.step.output().id != downstream.step.input().id {
                return Err(ConfigError::TypeMismatch {
                    upstream: upstream.step.name().to_string(),
                    produces: upstream.step.output().name(),
                    downstream: downstream.step.name().to_string(),
                    expects: downstream.step.input().name(),
                });
            }
        }

        let (entry, exit) = match (runners.first(), runners.last()) {
            (Some(first), Some(last)) => (first.step.input(), last.step.output()),
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "steps",
                    reason: "a pipeline needs at least one step".into(),
                })
            }
        };
        Ok(Pipeline { runners, entry, exit, settings, pacer, health })
    }
}

fn cache_wiring(
    step: &Step,
    mark: CacheMark,
    backend: &Option<Arc<dyn CacheBackend>>,
    registry: &Arc<KeyRegistry>,
    settings: &PipelineSettings,
    sink: &SharedSink,
) -> Result<CacheWiring, ConfigError> {
    let backend = backend
        .clone()
        .ok_or_else(|| ConfigError::CacheBackendRequired { step: step.name().to_string() })?;
    if step.kind() != ShapeKind::OneToOne {
        return Err(ConfigError::UnsupportedShape {
            step: step.name().to_string(),
            reason: "the cache aspect applies to unary client steps only".into(),
        });
    }
    let policy = mark.policy.unwrap_or(settings.cache.policy);
    let needs_request = matches!(policy, crate::cache::CachePolicy::CacheOnly);
    let needs_response = matches!(
        policy,
        crate::cache::CachePolicy::PreferCache
            | crate::cache::CachePolicy::SkipIfPresent
            | crate::cache::CachePolicy::RequireCache
    );
    if needs_request && step.request_codec.is_none() {
        return Err(ConfigError::MissingCodec { step: step.name().to_string(), which: "request" });
    }
    if needs_response && step.response_codec.is_none() {
        return Err(ConfigError::MissingCodec { step: step.name().to_string(), which: "response" });
    }
    Ok(CacheWiring {
        policy,
        executor: CacheExecutor::new(backend, registry.clone(), settings.cache.ttl(), sink.clone()),
    })
}

fn resolve_handler(
    synthetic: &crate::aspect::SyntheticStep,
    handlers: &HashMap<String, SideEffectHandler>,
    backend: &Option<Arc<dyn CacheBackend>>,
    registry: &Arc<KeyRegistry>,
    settings: &PipelineSettings,
    sink: &SharedSink,
) -> Result<EffectFn, ConfigError> {
    if let Some(handler) = handlers.get(&synthetic.aspect) {
        return Ok(handler.func.clone());
    }
    if let Some(mode) = synthetic.config.get("invalidate") {
        let backend = backend.clone().ok_or_else(|| ConfigError::CacheBackendRequired {
            step: synthetic.name.clone(),
        })?;
        let executor =
            CacheExecutor::new(backend, registry.clone(), settings.cache.ttl(), sink.clone());
        let type_name = synthetic.element.name();
        let handler = match mode.as_str() {
            "key" => SideEffectHandler::from_dyn(move |item, ctx| {
                let executor = executor.clone();
                Box::pin(async move { executor.invalidate_key(type_name, item, &ctx).await })
            }),
            "prefix" => SideEffectHandler::from_dyn(move |_item, ctx| {
                let executor = executor.clone();
                Box::pin(async move { executor.invalidate_prefix(type_name, &ctx).await })
            }),
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "invalidate",
                    reason: format!("unknown mode {other:?} (expected \"key\" or \"prefix\")"),
                })
            }
        };
        return Ok(handler.func);
    }
    Err(ConfigError::MissingHandler { aspect: synthetic.aspect.clone() })
}

/// A composed pipeline ready to run.
pub struct Pipeline {
    runners: Vec<StepRunner>,
    entry: ElementType,
    exit: ElementType,
    settings: PipelineSettings,
    pacer: Pacer,
    health: Vec<Arc<dyn DependencyHealth>>,
}

impl Pipeline {
    /// Names of the effective step order, for diagnostics.
    pub fn effective_order(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.step.name()).collect()
    }

    /// stream-in / stream-out.
    pub fn run_stream_stream<I, O, S>(
        &self,
        ctx: Option<PipelineContext>,
        input: S,
    ) -> Result<BoxStream<'static, Result<O, PipelineError>>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        S: Stream<Item = I> + Send + 'static,
    {
        self.check_entry::<I>()?;
        self.check_exit::<O>()?;
        let handle = ContextHandle::bind(ctx.unwrap_or_default());
        let flow: Flow = input.map(|item| Ok(Box::new(item) as Item)).boxed();
        let out = self.compose(flow, handle);
        let exit = self.exit;
        Ok(out.map(move |res| res.and_then(|item| downcast_exit::<O>(exit, item))).boxed())
    }

    /// unary-in / stream-out.
    pub fn run_unary_stream<I, O>(
        &self,
        ctx: Option<PipelineContext>,
        input: I,
    ) -> Result<BoxStream<'static, Result<O, PipelineError>>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        self.run_stream_stream(ctx, futures::stream::iter(std::iter::once(input)))
    }

    /// stream-in / unary-out: the last emitted item wins.
    pub async fn run_stream_unary<I, O, S>(
        &self,
        ctx: Option<PipelineContext>,
        input: S,
    ) -> Result<O, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        S: Stream<Item = I> + Send + 'static,
    {
        collapse(self.run_stream_stream(ctx, input)?).await
    }

    /// unary-in / unary-out.
    pub async fn run_unary_unary<I, O>(
        &self,
        ctx: Option<PipelineContext>,
        input: I,
    ) -> Result<O, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        collapse(self.run_unary_stream(ctx, input)?).await
    }

    /// Poll startup dependencies per the configured budget.
    pub async fn check_startup_health(&self) -> ReadinessReport {
        await_startup(
            &self.health,
            self.settings.health.startup_timeout(),
            self.settings.health.poll_interval(),
            &self.pacer,
        )
        .await
    }

    fn compose(&self, input: Flow, ctx: ContextHandle) -> Flow {
        let mut flow = input;
        for runner in &self.runners {
            flow = runner.apply(flow, &ctx);
        }
        if self.settings.fail_fast {
            flow = abort_on_first_failure(flow);
        }
        Box::pin(ContextGuard { inner: flow, ctx, done: false })
    }

    fn check_entry<I: 'static>(&self) -> Result<(), PipelineError> {
        if TypeId::of::<I>() != self.entry.id {
            return Err(ConfigError::TypeMismatch {
                upstream: "(caller)".into(),
                produces: std::any::type_name::<I>(),
                downstream: self.runners[0].step.name().to_string(),
                expects: self.entry.name(),
            }
            .into());
        }
        Ok(())
    }

    fn check_exit<O: 'static>(&self) -> Result<(), PipelineError> {
        if TypeId::of::<O>() != self.exit.id {
            return Err(ConfigError::TypeMismatch {
                upstream: self.runners[self.runners.len() - 1].step.name().to_string(),
                produces: self.exit.name(),
                downstream: "(caller)".into(),
                expects: std::any::type_name::<O>(),
            }
            .into());
        }
        Ok(())
    }
}

fn downcast_exit<O: Send + 'static>(exit: ElementType, item: Item) -> Result<O, PipelineError> {
    item.downcast::<O>().map(|boxed| *boxed).map_err(|_| {
        ConfigError::TypeMismatch {
            upstream: "(pipeline exit)".into(),
            produces: exit.name(),
            downstream: "(caller)".into(),
            expects: std::any::type_name::<O>(),
        }
        .into()
    })
}

async fn collapse<O>(
    mut stream: BoxStream<'static, Result<O, PipelineError>>,
) -> Result<O, PipelineError> {
    let mut last = None;
    while let Some(res) = stream.next().await {
        last = Some(res?);
    }
    last.ok_or(PipelineError::EmptyStream)
}

fn abort_on_first_failure(flow: Flow) -> Flow {
    Box::pin(stream! {
        let mut flow = flow;
        while let Some(res) = flow.next().await {
            let failed = res.is_err();
            yield res;
            if failed {
                break;
            }
        }
    })
}

/// Clears the flow context when the stream completes or is dropped.
#[pin_project(PinnedDrop)]
struct ContextGuard<S> {
    #[pin]
    inner: S,
    ctx: ContextHandle,
    done: bool,
}

impl<S: Stream> Stream for ContextGuard<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(None) => {
                if !*this.done {
                    *this.done = true;
                    this.ctx.clear();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[pinned_drop]
impl<S> PinnedDrop for ContextGuard<S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.done {
            this.ctx.clear();
        }
    }
}
