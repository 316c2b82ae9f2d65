//! Cache policies, key strategies, and the cache backend contract.
//!
//! The policy engine sits on the client side of a cache-marked step. Given
//! an item, the effective policy, and the registered key strategies it
//! produces a single result plus a recorded [`CacheStatus`]. Backend
//! failures on the side path are logged and recorded, never fatal — except
//! under `RequireCache`, whose whole point is to fail when the cache cannot
//! answer.

use crate::context::ContextHandle;
use crate::error::{BoxError, CacheMiss};
use crate::step::{Item, ProcessFn, StepCodec, StepYield};
use crate::telemetry::{emit, CacheEvent, PipelineEvent, SharedSink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of the cache interaction for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// The read path found an entry.
    Hit,
    /// The read path found nothing.
    Miss,
    /// The cache was not consulted on the read path.
    Bypass,
    /// A backend operation failed; the flow continued without it.
    Error,
}

impl CacheStatus {
    /// Wire value used in the `x-pipeline-cache-status` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIT" => Ok(CacheStatus::Hit),
            "MISS" => Ok(CacheStatus::Miss),
            "BYPASS" => Ok(CacheStatus::Bypass),
            "ERROR" => Ok(CacheStatus::Error),
            other => Err(format!("unknown cache status {other:?}")),
        }
    }
}

/// How cache reads and writes interact with the remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Write-only: record the current item, emit it unchanged.
    CacheOnly,
    /// Read-through: serve hits from cache, fill on miss.
    ///
    /// `return-cached` is accepted as an equivalent spelling.
    #[serde(alias = "return-cached")]
    PreferCache,
    /// Existence probe: skip the remote call when an entry exists.
    SkipIfPresent,
    /// Read-only: a miss fails the item with [`CacheMiss`].
    RequireCache,
    /// Neither read nor write; always invoke the remote.
    BypassCache,
}

impl CachePolicy {
    /// Canonical config spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePolicy::CacheOnly => "cache-only",
            CachePolicy::PreferCache => "prefer-cache",
            CachePolicy::SkipIfPresent => "skip-if-present",
            CachePolicy::RequireCache => "require-cache",
            CachePolicy::BypassCache => "bypass-cache",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-only" => Ok(CachePolicy::CacheOnly),
            "prefer-cache" | "return-cached" => Ok(CachePolicy::PreferCache),
            "skip-if-present" => Ok(CachePolicy::SkipIfPresent),
            "require-cache" => Ok(CachePolicy::RequireCache),
            "bypass-cache" => Ok(CachePolicy::BypassCache),
            other => Err(format!("unknown cache policy {other:?}")),
        }
    }
}

/// A prioritized rule producing a cache key for a given item.
///
/// Strategies are consulted highest priority first; the first that returns
/// a non-blank key wins. Returning `None` means "does not apply".
pub trait KeyStrategy: Send + Sync {
    /// Consultation priority; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Resolve a payload key for `item`, if this strategy applies.
    fn resolve(&self, item: &(dyn Any + Send), ctx: &ContextHandle) -> Option<String>;
}

/// Build a [`KeyStrategy`] from a typed closure.
pub fn key_strategy<T, F>(priority: i32, f: F) -> Arc<dyn KeyStrategy>
where
    T: Send + 'static,
    F: Fn(&T) -> Option<String> + Send + Sync + 'static,
{
    struct FnStrategy<T, F> {
        priority: i32,
        f: F,
        _marker: std::marker::PhantomData<fn(&T)>,
    }

    impl<T, F> KeyStrategy for FnStrategy<T, F>
    where
        T: Send + 'static,
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn resolve(&self, item: &(dyn Any + Send), _ctx: &ContextHandle) -> Option<String> {
            item.downcast_ref::<T>().and_then(|v| (self.f)(v))
        }
    }

    Arc::new(FnStrategy { priority, f, _marker: std::marker::PhantomData })
}

/// Process-wide strategy registry, read-only after startup.
#[derive(Clone)]
pub(crate) struct KeyRegistry {
    strategies: Vec<Arc<dyn KeyStrategy>>,
}

impl KeyRegistry {
    pub(crate) fn new(mut strategies: Vec<Arc<dyn KeyStrategy>>) -> Self {
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        Self { strategies }
    }

    /// First non-blank key from the highest-priority applicable strategy.
    pub(crate) fn resolve(&self, item: &Item, ctx: &ContextHandle) -> Option<String> {
        for strategy in &self.strategies {
            if let Some(key) = strategy.resolve(item.as_ref(), ctx) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }
        None
    }
}

/// Abstract cache storage. All operations must be individually atomic.
///
/// Operations may fail with recoverable errors; the policy engine never
/// retries them itself.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BoxError>;
    async fn exists(&self, key: &str) -> Result<bool, BoxError>;
    async fn invalidate(&self, key: &str) -> Result<bool, BoxError>;
    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64, BoxError>;
}

/// In-memory backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|(_, deadline)| deadline.map_or(true, |d| d > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), BoxError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BoxError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn invalidate(&self, key: &str) -> Result<bool, BoxError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
            .is_some())
    }

    async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64, BoxError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

/// `"[versionTag:]typeFqcn:payloadKey"`.
fn effective_key(version_tag: Option<&str>, type_name: &str, payload_key: &str) -> String {
    match version_tag {
        Some(tag) => format!("{tag}:{type_name}:{payload_key}"),
        None => format!("{type_name}:{payload_key}"),
    }
}

/// `"[versionTag:]typeFqcn:"`, the invalidate-all prefix for a type.
pub fn type_prefix(version_tag: Option<&str>, type_name: &str) -> String {
    match version_tag {
        Some(tag) => format!("{tag}:{type_name}:"),
        None => format!("{type_name}:"),
    }
}

/// One cache interaction: the marked step, its element type, the item, and
/// the codecs available for reading and writing.
pub(crate) struct CacheRequest<'a> {
    pub step: &'a str,
    pub type_name: &'static str,
    pub item: &'a Item,
    pub ctx: &'a ContextHandle,
    pub request_codec: Option<&'a StepCodec>,
    pub response_codec: Option<&'a StepCodec>,
}

/// Policy engine wired to a backend, the strategy registry, and telemetry.
#[derive(Clone)]
pub(crate) struct CacheExecutor {
    backend: Arc<dyn CacheBackend>,
    registry: Arc<KeyRegistry>,
    ttl: Option<Duration>,
    sink: SharedSink,
}

impl CacheExecutor {
    pub(crate) fn new(
        backend: Arc<dyn CacheBackend>,
        registry: Arc<KeyRegistry>,
        ttl: Option<Duration>,
        sink: SharedSink,
    ) -> Self {
        Self { backend, registry, ttl, sink }
    }

    /// Run one item through `policy`. `remote` is the step's underlying
    /// client invocation; policies that never reach the remote ignore it.
    pub(crate) async fn run(
        &self,
        declared: CachePolicy,
        req: CacheRequest<'_>,
        remote: Option<&ProcessFn>,
    ) -> Result<StepYield, BoxError> {
        // A flow-level override beats the declared policy.
        let policy = req.ctx.snapshot().cache_policy_override().unwrap_or(declared);
        let version = req.ctx.snapshot().version_tag().map(str::to_owned);
        let key = self
            .registry
            .resolve(req.item, req.ctx)
            .map(|base| effective_key(version.as_deref(), req.type_name, &base));

        match policy {
            CachePolicy::BypassCache => {
                self.record(req.ctx, req.step, CacheStatus::Bypass).await;
                self.invoke_remote(remote, &req).await
            }
            CachePolicy::CacheOnly => {
                if let (Some(key), Some(codec)) = (key, req.request_codec) {
                    self.write(req.ctx, req.step, &key, codec, req.item.as_ref()).await;
                } else {
                    self.record(req.ctx, req.step, CacheStatus::Bypass).await;
                }
                Ok(StepYield::Original)
            }
            CachePolicy::PreferCache => {
                let Some(key) = key else {
                    self.record(req.ctx, req.step, CacheStatus::Bypass).await;
                    return self.invoke_remote(remote, &req).await;
                };
                match self.read(req.step, &key).await {
                    Some(bytes) => {
                        let codec = req
                            .response_codec
                            .ok_or_else(|| missing_codec(req.step, "response"))?;
                        match (codec.decode)(&bytes) {
                            Ok(value) => {
                                self.record(req.ctx, req.step, CacheStatus::Hit).await;
                                emit(
                                    &self.sink,
                                    PipelineEvent::Cache(CacheEvent::Hit {
                                        step: req.step.into(),
                                        key,
                                    }),
                                )
                                .await;
                                Ok(StepYield::Item(value))
                            }
                            // Corrupt entry: note it and fall back to the remote.
                            Err(e) => {
                                self.side_failure(req.ctx, req.step, &e).await;
                                self.fill(&req, &key, remote).await
                            }
                        }
                    }
                    None => {
                        self.record(req.ctx, req.step, CacheStatus::Miss).await;
                        emit(
                            &self.sink,
                            PipelineEvent::Cache(CacheEvent::Miss {
                                step: req.step.into(),
                                key: key.clone(),
                            }),
                        )
                        .await;
                        self.fill(&req, &key, remote).await
                    }
                }
            }
            CachePolicy::SkipIfPresent => {
                let Some(key) = key else {
                    self.record(req.ctx, req.step, CacheStatus::Bypass).await;
                    return self.invoke_remote(remote, &req).await;
                };
                let present = match self.backend.exists(&key).await {
                    Ok(present) => present,
                    Err(e) => {
                        self.side_failure(req.ctx, req.step, &e).await;
                        false
                    }
                };
                if present {
                    self.record(req.ctx, req.step, CacheStatus::Hit).await;
                    emit(
                        &self.sink,
                        PipelineEvent::Cache(CacheEvent::Hit { step: req.step.into(), key }),
                    )
                    .await;
                    Ok(StepYield::Original)
                } else {
                    self.record(req.ctx, req.step, CacheStatus::Miss).await;
                    emit(
                        &self.sink,
                        PipelineEvent::Cache(CacheEvent::Miss {
                            step: req.step.into(),
                            key: key.clone(),
                        }),
                    )
                    .await;
                    self.fill(&req, &key, remote).await
                }
            }
            CachePolicy::RequireCache => {
                let Some(key) = key else {
                    self.record(req.ctx, req.step, CacheStatus::Miss).await;
                    return Err(Box::new(CacheMiss { key: String::new() }));
                };
                let bytes = self.backend.get(&key).await?;
                match bytes {
                    Some(bytes) => {
                        let codec = req
                            .response_codec
                            .ok_or_else(|| missing_codec(req.step, "response"))?;
                        let value = (codec.decode)(&bytes)?;
                        self.record(req.ctx, req.step, CacheStatus::Hit).await;
                        emit(
                            &self.sink,
                            PipelineEvent::Cache(CacheEvent::Hit { step: req.step.into(), key }),
                        )
                        .await;
                        Ok(StepYield::Item(value))
                    }
                    None => {
                        self.record(req.ctx, req.step, CacheStatus::Miss).await;
                        emit(
                            &self.sink,
                            PipelineEvent::Cache(CacheEvent::Miss {
                                step: req.step.into(),
                                key: key.clone(),
                            }),
                        )
                        .await;
                        Err(Box::new(CacheMiss { key }))
                    }
                }
            }
        }
    }

    /// Invalidate the single entry keyed from `item`.
    pub(crate) async fn invalidate_key(
        &self,
        type_name: &'static str,
        item: &Item,
        ctx: &ContextHandle,
    ) -> Result<(), BoxError> {
        let version = ctx.snapshot().version_tag().map(str::to_owned);
        if let Some(base) = self.registry.resolve(item, ctx) {
            let key = effective_key(version.as_deref(), type_name, &base);
            self.backend.invalidate(&key).await?;
        }
        Ok(())
    }

    /// Invalidate every entry of the element type at this position.
    pub(crate) async fn invalidate_prefix(
        &self,
        type_name: &'static str,
        ctx: &ContextHandle,
    ) -> Result<(), BoxError> {
        let version = ctx.snapshot().version_tag().map(str::to_owned);
        let prefix = type_prefix(version.as_deref(), type_name);
        let count = self.backend.invalidate_by_prefix(&prefix).await?;
        tracing::debug!(prefix = %prefix, count, "cache invalidated by prefix");
        Ok(())
    }

    async fn invoke_remote(
        &self,
        remote: Option<&ProcessFn>,
        req: &CacheRequest<'_>,
    ) -> Result<StepYield, BoxError> {
        emit(&self.sink, PipelineEvent::Cache(CacheEvent::Bypass { step: req.step.into() })).await;
        match remote {
            Some(remote) => remote(req.item, req.ctx.clone()).await,
            None => Ok(StepYield::Original),
        }
    }

    /// Miss path: invoke the remote, then write the result through.
    async fn fill(
        &self,
        req: &CacheRequest<'_>,
        key: &str,
        remote: Option<&ProcessFn>,
    ) -> Result<StepYield, BoxError> {
        let out = match remote {
            Some(remote) => remote(req.item, req.ctx.clone()).await?,
            None => StepYield::Original,
        };
        match &out {
            StepYield::Item(value) => {
                if let Some(codec) = req.response_codec {
                    self.write_value(req.ctx, req.step, key, codec, value.as_ref()).await;
                }
            }
            StepYield::Original => {
                if let Some(codec) = req.request_codec {
                    self.write_value(req.ctx, req.step, key, codec, req.item.as_ref()).await;
                }
            }
        }
        Ok(out)
    }

    async fn read(&self, step: &str, key: &str) -> Option<Vec<u8>> {
        match self.backend.get(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(step, key, error = %e, "cache read failed");
                emit(
                    &self.sink,
                    PipelineEvent::Cache(CacheEvent::Error {
                        step: step.into(),
                        detail: e.to_string(),
                    }),
                )
                .await;
                None
            }
        }
    }

    /// Fire-and-forget write of the item under `key`; sets the status.
    async fn write(
        &self,
        ctx: &ContextHandle,
        step: &str,
        key: &str,
        codec: &StepCodec,
        value: &(dyn Any + Send),
    ) {
        self.record(ctx, step, CacheStatus::Bypass).await;
        self.write_value(ctx, step, key, codec, value).await;
    }

    async fn write_value(
        &self,
        ctx: &ContextHandle,
        step: &str,
        key: &str,
        codec: &StepCodec,
        value: &(dyn Any + Send),
    ) {
        let result = match (codec.encode)(value) {
            Ok(bytes) => self.backend.put(key, bytes, self.ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.side_failure(ctx, step, &e).await;
        }
    }

    async fn side_failure(&self, ctx: &ContextHandle, step: &str, error: &BoxError) {
        tracing::warn!(step, error = %error, "cache side operation failed");
        ctx.record_cache_status(CacheStatus::Error);
        emit(
            &self.sink,
            PipelineEvent::Cache(CacheEvent::Error {
                step: step.into(),
                detail: error.to_string(),
            }),
        )
        .await;
    }

    async fn record(&self, ctx: &ContextHandle, step: &str, status: CacheStatus) {
        ctx.record_cache_status(status);
        if status == CacheStatus::Bypass {
            emit(&self.sink, PipelineEvent::Cache(CacheEvent::Bypass { step: step.into() }))
                .await;
        }
    }
}

fn missing_codec(step: &str, which: &'static str) -> BoxError {
    Box::new(crate::error::NonRetryable::msg(format!(
        "step {step:?}: cached entry present but no {which} codec to decode it"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PipelineContext;
    use crate::step::StepYield;
    use crate::telemetry::{shared, MemorySink, NullSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<KeyRegistry> {
        Arc::new(KeyRegistry::new(vec![key_strategy(0, |s: &String| Some(s.clone()))]))
    }

    fn executor(backend: Arc<dyn CacheBackend>) -> CacheExecutor {
        CacheExecutor::new(backend, registry(), None, shared(NullSink))
    }

    fn remote_returning(value: &'static str, calls: Arc<AtomicUsize>) -> ProcessFn {
        Arc::new(move |_item: &Item, _ctx: ContextHandle| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StepYield::Item(Box::new(value.to_string()) as Item))
            })
        })
    }

    fn request<'a>(
        item: &'a Item,
        ctx: &'a ContextHandle,
        codec: &'a StepCodec,
    ) -> CacheRequest<'a> {
        CacheRequest {
            step: "lookup",
            type_name: "String",
            item,
            ctx,
            request_codec: Some(codec),
            response_codec: Some(codec),
        }
    }

    #[tokio::test]
    async fn prefer_cache_miss_then_hit() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(backend.clone());
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        // First pass: miss, remote invoked, result written.
        let out = exec
            .run(CachePolicy::PreferCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        assert!(matches!(out, StepYield::Item(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Miss));
        assert!(backend.get("String:X").await.unwrap().is_some());

        // Second pass: hit, no remote call.
        let out = exec
            .run(CachePolicy::PreferCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        match out {
            StepYield::Item(value) => {
                assert_eq!(*value.downcast::<String>().unwrap(), "Y");
            }
            StepYield::Original => panic!("expected the cached value"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Hit));
    }

    #[tokio::test]
    async fn require_cache_miss_fails_without_remote_call() {
        let exec = executor(Arc::new(MemoryBackend::new()));
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        let err = exec
            .run(CachePolicy::RequireCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CacheMiss>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Miss));
    }

    #[tokio::test]
    async fn require_cache_blank_key_fails() {
        let exec = CacheExecutor::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(KeyRegistry::new(vec![key_strategy(0, |_: &String| None)])),
            None,
            shared(NullSink),
        );
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());

        let err = exec
            .run(CachePolicy::RequireCache, request(&item, &ctx, &codec), None)
            .await
            .unwrap_err();
        let miss = err.downcast_ref::<CacheMiss>().unwrap();
        assert!(miss.key.is_empty());
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Miss));
    }

    #[tokio::test]
    async fn skip_if_present_short_circuits() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("String:X", b"{}".to_vec(), None).await.unwrap();
        let exec = executor(backend);
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        let out = exec
            .run(CachePolicy::SkipIfPresent, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        assert!(matches!(out, StepYield::Original));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Hit));
    }

    #[tokio::test]
    async fn cache_only_writes_and_passes_through() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(backend.clone());
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::bind(PipelineContext::new().with_version_tag("v7"));
        let item: Item = Box::new("X".to_string());

        let out = exec
            .run(CachePolicy::CacheOnly, request(&item, &ctx, &codec), None)
            .await
            .unwrap();
        assert!(matches!(out, StepYield::Original));
        // Version tag prefixes the key.
        assert!(backend.get("v7:String:X").await.unwrap().is_some());
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Bypass));
    }

    #[tokio::test]
    async fn bypass_never_touches_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(backend.clone());
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        let out = exec
            .run(CachePolicy::BypassCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        assert!(matches!(out, StepYield::Item(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.is_empty());
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Bypass));
    }

    #[tokio::test]
    async fn context_override_beats_declared_policy() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(backend.clone());
        let codec = StepCodec::json::<String>();
        let ctx =
            ContextHandle::bind(PipelineContext::new().with_cache_policy(CachePolicy::BypassCache));
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        let _ = exec
            .run(CachePolicy::PreferCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn write_failure_never_aborts() {
        struct FailingWrites;

        #[async_trait]
        impl CacheBackend for FailingWrites {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BoxError> {
                Ok(None)
            }
            async fn put(
                &self,
                _key: &str,
                _value: Vec<u8>,
                _ttl: Option<Duration>,
            ) -> Result<(), BoxError> {
                Err("backend down".into())
            }
            async fn exists(&self, _key: &str) -> Result<bool, BoxError> {
                Ok(false)
            }
            async fn invalidate(&self, _key: &str) -> Result<bool, BoxError> {
                Ok(false)
            }
            async fn invalidate_by_prefix(&self, _prefix: &str) -> Result<u64, BoxError> {
                Ok(0)
            }
        }

        let sink = MemorySink::new();
        let exec = CacheExecutor::new(
            Arc::new(FailingWrites),
            registry(),
            None,
            shared(sink.clone()),
        );
        let codec = StepCodec::json::<String>();
        let ctx = ContextHandle::empty();
        let item: Item = Box::new("X".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        let remote = remote_returning("Y", calls.clone());

        let out = exec
            .run(CachePolicy::PreferCache, request(&item, &ctx, &codec), Some(&remote))
            .await
            .unwrap();
        assert!(matches!(out, StepYield::Item(_)));
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Error));
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Cache(CacheEvent::Error { .. }))));
    }

    #[tokio::test]
    async fn memory_backend_ttl_and_prefix_invalidation() {
        let backend = MemoryBackend::new();
        backend.put("v1:A:1", vec![1], None).await.unwrap();
        backend.put("v1:A:2", vec![2], None).await.unwrap();
        backend.put("v1:B:1", vec![3], None).await.unwrap();
        backend
            .put("v1:A:3", vec![4], Some(Duration::from_millis(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.get("v1:A:3").await.unwrap().is_none());

        let removed = backend.invalidate_by_prefix("v1:A:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(backend.get("v1:B:1").await.unwrap().is_some());
        assert!(backend.invalidate("v1:B:1").await.unwrap());
        assert!(!backend.invalidate("v1:B:1").await.unwrap());
    }

    #[test]
    fn policy_aliases_parse() {
        assert_eq!("prefer-cache".parse::<CachePolicy>().unwrap(), CachePolicy::PreferCache);
        assert_eq!("return-cached".parse::<CachePolicy>().unwrap(), CachePolicy::PreferCache);
        assert!("hot-cache".parse::<CachePolicy>().is_err());
        assert_eq!(CachePolicy::PreferCache.as_str(), "prefer-cache");
    }

    #[test]
    fn key_helpers_apply_version_tag() {
        assert_eq!(effective_key(Some("v2"), "Order", "42"), "v2:Order:42");
        assert_eq!(effective_key(None, "Order", "42"), "Order:42");
        assert_eq!(type_prefix(Some("v2"), "Order"), "v2:Order:");
        assert_eq!(type_prefix(None, "Order"), "Order:");
    }
}
