//! Step model: typed user functions behind a uniform type-erased surface.
//!
//! A [`Step`] pairs a name, a cardinality [`StepShape`], declared element
//! types, per-step config overrides, and optional dead-letter and codec
//! attachments. Items travel the composed pipeline as `Box<dyn Any + Send>`;
//! the typed constructors do the downcasting so user code stays fully typed.

use crate::config::StepOverrides;
use crate::context::ContextHandle;
use crate::error::{BoxError, NonRetryable};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A type-erased pipeline element.
pub type Item = Box<dyn Any + Send>;

/// A type-erased sub-stream of elements.
pub type ItemStream = BoxStream<'static, Result<Item, BoxError>>;

/// What a processing call hands back to the engine.
pub(crate) enum StepYield {
    /// Emit this item downstream.
    Item(Item),
    /// Re-emit the engine's original input (cache pass-through paths).
    Original,
}

pub(crate) type ProcessFn = Arc<
    dyn for<'a> Fn(&'a Item, ContextHandle) -> BoxFuture<'a, Result<StepYield, BoxError>>
        + Send
        + Sync,
>;
pub(crate) type SubStreamFn = Arc<
    dyn for<'a> Fn(&'a Item, ContextHandle) -> BoxFuture<'a, Result<ItemStream, BoxError>>
        + Send
        + Sync,
>;
pub(crate) type BatchFn = Arc<
    dyn for<'a> Fn(&'a [Item], ContextHandle) -> BoxFuture<'a, Result<Item, BoxError>>
        + Send
        + Sync,
>;
pub(crate) type StreamFn = Arc<
    dyn Fn(ItemStream, ContextHandle) -> BoxFuture<'static, Result<ItemStream, BoxError>>
        + Send
        + Sync,
>;
pub(crate) type EffectFn = Arc<
    dyn for<'a> Fn(&'a Item, ContextHandle) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
>;
pub(crate) type DeadLetterFn = Arc<dyn Fn(&Item, &BoxError) -> Option<Item> + Send + Sync>;

/// Cardinality of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    /// One input item, exactly one output item.
    OneToOne,
    /// One input item, a finite sub-stream of outputs.
    OneToMany,
    /// A batch of inputs, one output.
    ManyToOne,
    /// Whole-stream transformation.
    ManyToMany,
    /// Observes items; the original input is re-emitted downstream.
    SideEffect,
}

/// The shape of a step plus its erased user function.
pub struct StepShape {
    pub(crate) inner: ShapeInner,
}

pub(crate) enum ShapeInner {
    OneToOne(ProcessFn),
    OneToMany(SubStreamFn),
    ManyToOne(BatchFn),
    ManyToMany(StreamFn),
    SideEffect(EffectFn),
}

impl StepShape {
    pub fn kind(&self) -> ShapeKind {
        match self.inner {
            ShapeInner::OneToOne(_) => ShapeKind::OneToOne,
            ShapeInner::OneToMany(_) => ShapeKind::OneToMany,
            ShapeInner::ManyToOne(_) => ShapeKind::ManyToOne,
            ShapeInner::ManyToMany(_) => ShapeKind::ManyToMany,
            ShapeInner::SideEffect(_) => ShapeKind::SideEffect,
        }
    }
}

impl fmt::Debug for StepShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// A declared element type: runtime id plus human-readable names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementType {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
}

impl ElementType {
    pub fn of<T: Any>() -> Self {
        Self { id: TypeId::of::<T>(), name: std::any::type_name::<T>() }
    }

    /// Fully-qualified type name, used for cache key prefixes.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment, used for synthetic step naming.
    pub fn short_name(&self) -> &str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

/// Byte codec for one element type, used by the cache policy engine.
#[derive(Clone)]
pub struct StepCodec {
    pub(crate) encode: Arc<dyn Fn(&(dyn Any + Send)) -> Result<Vec<u8>, BoxError> + Send + Sync>,
    pub(crate) decode: Arc<dyn Fn(&[u8]) -> Result<Item, BoxError> + Send + Sync>,
}

impl StepCodec {
    /// Codec from explicit encode/decode functions.
    pub fn new<T, Enc, Dec>(encode: Enc, decode: Dec) -> Self
    where
        T: Send + 'static,
        Enc: Fn(&T) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
        Dec: Fn(&[u8]) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self {
            encode: Arc::new(move |item| match item.downcast_ref::<T>() {
                Some(v) => encode(v),
                None => Err(codec_mismatch::<T>()),
            }),
            decode: Arc::new(move |bytes| decode(bytes).map(|v| Box::new(v) as Item)),
        }
    }

    /// JSON codec for any serde-capable type.
    pub fn json<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        Self::new::<T, _, _>(
            |v| serde_json::to_vec(v).map_err(|e| Box::new(e) as BoxError),
            |bytes| serde_json::from_slice(bytes).map_err(|e| Box::new(e) as BoxError),
        )
    }
}

impl fmt::Debug for StepCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StepCodec")
    }
}

fn codec_mismatch<T>() -> BoxError {
    Box::new(NonRetryable::msg(format!(
        "codec expected {}, item has a different type",
        std::any::type_name::<T>()
    )))
}

fn type_mismatch(step: &str, expected: &'static str) -> BoxError {
    Box::new(NonRetryable::msg(format!("step {step:?}: item is not a {expected}")))
}

/// A named, typed transformation participating in a pipeline.
pub struct Step {
    pub(crate) name: String,
    pub(crate) shape: StepShape,
    pub(crate) input: ElementType,
    pub(crate) output: ElementType,
    pub(crate) overrides: StepOverrides,
    pub(crate) dead_letter: Option<DeadLetterFn>,
    pub(crate) request_codec: Option<StepCodec>,
    pub(crate) response_codec: Option<StepCodec>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("shape", &self.shape.kind())
            .field("input", &self.input.name)
            .field("output", &self.output.name)
            .finish()
    }
}

impl Step {
    fn new(name: impl Into<String>, shape: StepShape, input: ElementType, output: ElementType) -> Self {
        Self {
            name: name.into(),
            shape,
            input,
            output,
            overrides: StepOverrides::default(),
            dead_letter: None,
            request_codec: None,
            response_codec: None,
        }
    }

    /// 1→1: each input produces exactly one output.
    pub fn one_to_one<I, O, F, Fut, E>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::one_to_one_ctx(name, move |input: I, _ctx| f(input))
    }

    /// 1→1 with access to the flow context.
    pub fn one_to_one_ctx<I, O, F, Fut, E>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(I, ContextHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        let step_name = name.clone();
        let func: ProcessFn = Arc::new(move |item: &Item, ctx: ContextHandle| {
            let fut = item.downcast_ref::<I>().cloned().map(|input| f(input, ctx));
            let step_name = step_name.clone();
            Box::pin(async move {
                match fut {
                    Some(fut) => fut
                        .await
                        .map(|out| StepYield::Item(Box::new(out) as Item))
                        .map_err(Into::into),
                    None => Err(type_mismatch(&step_name, std::any::type_name::<I>())),
                }
            })
        });
        Self::new(
            name,
            StepShape { inner: ShapeInner::OneToOne(func) },
            ElementType::of::<I>(),
            ElementType::of::<O>(),
        )
    }

    /// 1→N: each input produces a finite sub-stream.
    ///
    /// Retry applies to the factory call only, never to already-emitted
    /// sub-stream items.
    pub fn one_to_many<I, O, S, F, Fut, E, E2>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        S: Stream<Item = Result<O, E2>> + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        E: Into<BoxError>,
        E2: Into<BoxError>,
    {
        let name = name.into();
        let step_name = name.clone();
        let func: SubStreamFn = Arc::new(move |item: &Item, _ctx: ContextHandle| {
            let fut = item.downcast_ref::<I>().cloned().map(|input| f(input));
            let step_name = step_name.clone();
            Box::pin(async move {
                match fut {
                    Some(fut) => {
                        let sub = fut.await.map_err(Into::into)?;
                        Ok(sub
                            .map(|r| r.map(|o| Box::new(o) as Item).map_err(Into::into))
                            .boxed())
                    }
                    None => Err(type_mismatch(&step_name, std::any::type_name::<I>())),
                }
            })
        });
        Self::new(
            name,
            StepShape { inner: ShapeInner::OneToMany(func) },
            ElementType::of::<I>(),
            ElementType::of::<O>(),
        )
    }

    /// 1→N with access to the flow context.
    pub fn one_to_many_ctx<I, O, S, F, Fut, E, E2>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        S: Stream<Item = Result<O, E2>> + Send + 'static,
        F: Fn(I, ContextHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        E: Into<BoxError>,
        E2: Into<BoxError>,
    {
        let name = name.into();
        let step_name = name.clone();
        let func: SubStreamFn = Arc::new(move |item: &Item, ctx: ContextHandle| {
            let fut = item.downcast_ref::<I>().cloned().map(|input| f(input, ctx));
            let step_name = step_name.clone();
            Box::pin(async move {
                match fut {
                    Some(fut) => {
                        let sub = fut.await.map_err(Into::into)?;
                        Ok(sub
                            .map(|r| r.map(|o| Box::new(o) as Item).map_err(Into::into))
                            .boxed())
                    }
                    None => Err(type_mismatch(&step_name, std::any::type_name::<I>())),
                }
            })
        });
        Self::new(
            name,
            StepShape { inner: ShapeInner::OneToMany(func) },
            ElementType::of::<I>(),
            ElementType::of::<O>(),
        )
    }

    /// N→1: inputs are batched by `(batch_size, batch_timeout)` and each
    /// batch produces one output.
    pub fn many_to_one<I, O, F, Fut, E>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        let step_name = name.clone();
        let func: BatchFn = Arc::new(move |batch: &[Item], _ctx: ContextHandle| {
            let typed: Option<Vec<I>> =
                batch.iter().map(|item| item.downcast_ref::<I>().cloned()).collect();
            let fut = typed.map(|batch| f(batch));
            let step_name = step_name.clone();
            Box::pin(async move {
                match fut {
                    Some(fut) => {
                        fut.await.map(|out| Box::new(out) as Item).map_err(Into::into)
                    }
                    None => Err(type_mismatch(&step_name, std::any::type_name::<I>())),
                }
            })
        });
        Self::new(
            name,
            StepShape { inner: ShapeInner::ManyToOne(func) },
            ElementType::of::<I>(),
            ElementType::of::<O>(),
        )
    }

    /// N→N: whole-stream transformation.
    ///
    /// The input stream is single-use, so only the initial invocation is
    /// retry-eligible; failures surfaced mid-stream propagate.
    pub fn many_to_many<I, O, S, F, Fut, E, E2>(name: impl Into<String>, f: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        S: Stream<Item = Result<O, E2>> + Send + 'static,
        F: Fn(BoxStream<'static, Result<I, BoxError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        E: Into<BoxError>,
        E2: Into<BoxError>,
    {
        let name = name.into();
        let step_name = name.clone();
        let func: StreamFn = Arc::new(move |items: ItemStream, _ctx: ContextHandle| {
            let step_name = step_name.clone();
            let typed = items
                .map(move |r| {
                    r.and_then(|item| {
                        item.downcast::<I>()
                            .map(|b| *b)
                            .map_err(|_| type_mismatch(&step_name, std::any::type_name::<I>()))
                    })
                })
                .boxed();
            let fut = f(typed);
            Box::pin(async move {
                let out = fut.await.map_err(Into::into)?;
                Ok(out.map(|r| r.map(|o| Box::new(o) as Item).map_err(Into::into)).boxed())
            })
        });
        Self::new(
            name,
            StepShape { inner: ShapeInner::ManyToMany(func) },
            ElementType::of::<I>(),
            ElementType::of::<O>(),
        )
    }

    /// 1→side-effect: observes each item; the original input is re-emitted.
    pub fn side_effect<I, F, Fut, E>(name: impl Into<String>, f: F) -> Self
    where
        I: Clone + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let name = name.into();
        let func = effect_fn::<I, F, Fut, E>(name.clone(), f);
        Self::new(
            name,
            StepShape { inner: ShapeInner::SideEffect(func) },
            ElementType::of::<I>(),
            ElementType::of::<I>(),
        )
    }

    /// Synthetic side-effect step materialising one aspect invocation.
    pub(crate) fn from_effect(name: String, element: ElementType, func: EffectFn) -> Self {
        Self::new(name, StepShape { inner: ShapeInner::SideEffect(func) }, element, element)
    }

    /// Declare config overrides for this step (the `Step` merge layer).
    pub fn with_overrides(mut self, overrides: StepOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Attach a dead-letter handler, consulted when `recover-on-failure` is
    /// set and retries are exhausted. Returning `None` drops the item.
    pub fn with_dead_letter<I, O, F>(mut self, f: F) -> Self
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(&I, &BoxError) -> Option<O> + Send + Sync + 'static,
    {
        self.dead_letter = Some(Arc::new(move |item: &Item, err: &BoxError| {
            item.downcast_ref::<I>().and_then(|input| f(input, err)).map(|o| Box::new(o) as Item)
        }));
        self
    }

    /// Codec for the step's input type, used for cache-only writes.
    pub fn with_request_codec(mut self, codec: StepCodec) -> Self {
        self.request_codec = Some(codec);
        self
    }

    /// Codec for the step's output type, used for read-through caching.
    pub fn with_response_codec(mut self, codec: StepCodec) -> Self {
        self.response_codec = Some(codec);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ShapeKind {
        self.shape.kind()
    }

    pub fn input(&self) -> ElementType {
        self.input
    }

    pub fn output(&self) -> ElementType {
        self.output
    }
}

/// Build an erased side-effect function from a typed one.
///
/// Shared with the aspect machinery, which synthesizes side-effect steps
/// from registered handlers.
pub(crate) fn effect_fn<I, F, Fut, E>(name: String, f: F) -> EffectFn
where
    I: Clone + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |item: &Item, _ctx: ContextHandle| {
        let fut = item.downcast_ref::<I>().cloned().map(|input| f(input));
        let name = name.clone();
        Box::pin(async move {
            match fut {
                Some(fut) => fut.await.map_err(Into::into),
                None => Err(type_mismatch(&name, std::any::type_name::<I>())),
            }
        })
    })
}
