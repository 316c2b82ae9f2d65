//! Telemetry events and sinks.
//!
//! Every step engine emits structured [`PipelineEvent`]s describing step
//! lifecycle, retries, buffer pressure, and cache outcomes. Events flow
//! through [`TelemetrySink`] implementations — a `tower::Service` over
//! `PipelineEvent` — so sinks compose with standard tower combinators.
//!
//! Telemetry is best-effort by contract: a sink that is not ready or that
//! errors never blocks or fails the pipeline hot path.

use crate::error::BoxError;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Step lifecycle events.
    Step(StepEvent),
    /// Backpressure buffer events.
    Buffer(BufferEvent),
    /// Cache policy engine events.
    Cache(CacheEvent),
}

/// Per-step lifecycle events. Strictly ordered per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// A step's operator started consuming its input.
    Started { step: String },
    /// One item entered the step's user function.
    Item { step: String },
    /// A retry is about to happen after the given backoff delay.
    Retry { step: String, attempt: u32, delay: Duration },
    /// The step gave up on an item (retries exhausted or non-retryable).
    Failure { step: String, attempts: u32 },
    /// A failed item was handed to the dead-letter handler.
    DeadLetter { step: String },
    /// The step's operator saw the end of its input.
    Completed { step: String, items: u64, failed: u64 },
}

/// Backpressure buffer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    /// Queue depth observed at enqueue time.
    Depth { step: String, depth: usize, capacity: usize },
    /// An item was discarded by the `Drop` strategy.
    Dropped { step: String },
}

/// Cache policy engine events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Read path found an entry.
    Hit { step: String, key: String },
    /// Read path found nothing.
    Miss { step: String, key: String },
    /// Cache was not consulted.
    Bypass { step: String },
    /// A backend operation failed; the flow continued.
    Error { step: String, detail: String },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Step(event) => write!(f, "Step::{}", event),
            PipelineEvent::Buffer(event) => write!(f, "Buffer::{}", event),
            PipelineEvent::Cache(event) => write!(f, "Cache::{}", event),
        }
    }
}

impl fmt::Display for StepEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepEvent::Started { step } => write!(f, "Started({})", step),
            StepEvent::Item { step } => write!(f, "Item({})", step),
            StepEvent::Retry { step, attempt, delay } => {
                write!(f, "Retry({}, #{}, delay={:?})", step, attempt, delay)
            }
            StepEvent::Failure { step, attempts } => {
                write!(f, "Failure({}, attempts={})", step, attempts)
            }
            StepEvent::DeadLetter { step } => write!(f, "DeadLetter({})", step),
            StepEvent::Completed { step, items, failed } => {
                write!(f, "Completed({}, items={}, failed={})", step, items, failed)
            }
        }
    }
}

impl fmt::Display for BufferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferEvent::Depth { step, depth, capacity } => {
                write!(f, "Depth({}, {}/{})", step, depth, capacity)
            }
            BufferEvent::Dropped { step } => write!(f, "Dropped({})", step),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { step, key } => write!(f, "Hit({}, key={})", step, key),
            CacheEvent::Miss { step, key } => write!(f, "Miss({}, key={})", step, key),
            CacheEvent::Bypass { step } => write!(f, "Bypass({})", step),
            CacheEvent::Error { step, detail } => write!(f, "Error({}, {})", step, detail),
        }
    }
}

/// A telemetry sink that consumes pipeline events.
///
/// Implemented as a `tower::Service<PipelineEvent>` so sinks compose with
/// standard tower combinators. Sinks must be internally thread-safe:
/// concurrent writers are expected.
pub trait TelemetrySink:
    Service<PipelineEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Type-erased clone-able sink handle threaded through the engine.
pub type SharedSink = BoxCloneSyncService<PipelineEvent, (), BoxError>;

/// Erase a sink into a [`SharedSink`].
pub fn shared<S>(sink: S) -> SharedSink
where
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(sink.map_err(|e| Box::new(e) as BoxError))
}

/// Best-effort emit that honors `poll_ready` and swallows errors.
///
/// Telemetry must not block policy hot paths: if the sink is not ready or
/// returns an error, the event is dropped.
pub async fn emit(sink: &SharedSink, event: PipelineEvent) {
    let mut sink = sink.clone();
    if let Ok(ready) = sink.ready().await {
        let _ = ready.call(event).await;
    }
}

// ============================================================================
// Built-in sinks
// ============================================================================

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PipelineEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PipelineEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs each event at INFO level through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PipelineEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        tracing::info!(event = %event, "pipeline_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Stores events in memory. Intended for tests and debugging.
///
/// Bounded: oldest events are evicted once capacity is exceeded.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink with the default capacity of 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Bounded sink with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of all stored events.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Count of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events evicted to respect the capacity bound.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Drop all stored events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PipelineEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
