#![forbid(unsafe_code)]

//! # Millrace
//!
//! A reactive pipeline execution runtime: compose an ordered sequence of
//! typed transformation steps into a single lazy stream pipeline and run it
//! end-to-end with retry, backpressure, dead-lettering, caching, and
//! context propagation.
//!
//! ## Features
//!
//! - **Typed steps** of five cardinality shapes (1→1, 1→N, N→1, N→N,
//!   side-effect) behind one uniform engine
//! - **Retry with exponential backoff and jitter**, failure classification,
//!   and dead-letter recovery per step
//! - **Backpressure** with bounded buffers (`BUFFER` or `DROP`)
//! - **Aspects**: persistence, auditing, and cache invalidation attached
//!   declaratively before/after any step
//! - **Cache policies**: cache-only, prefer-cache, skip-if-present,
//!   require-cache, bypass-cache, with prioritized key strategies and
//!   version-tagged keys
//! - **Flow-scoped context** propagated to outbound calls via
//!   `x-pipeline-*` headers
//! - **Telemetry** through composable `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use millrace::{BoxError, NonRetryable, PipelineBuilder, Step};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), millrace::PipelineError> {
//!     let pipeline = PipelineBuilder::new()
//!         .step(Step::one_to_one("validate", |s: String| async move {
//!             if s.is_empty() {
//!                 Err(Box::new(NonRetryable::msg("empty input")) as BoxError)
//!             } else {
//!                 Ok(s)
//!             }
//!         }))
//!         .step(Step::one_to_one("enrich", |s: String| async move {
//!             Ok::<_, BoxError>(format!("{s}!"))
//!         }))
//!         .build()?;
//!
//!     let out: String = pipeline.run_unary_unary(None, "order-42".to_string()).await?;
//!     assert_eq!(out, "order-42!");
//!     Ok(())
//! }
//! ```

mod aspect;
mod backoff;
mod buffer;
mod cache;
mod classify;
mod config;
mod context;
mod engine;
mod error;
mod health;
mod jitter;
mod pacer;
mod parallelism;
mod persist;
mod pipeline;
mod remote;
mod settings;
mod step;

pub mod telemetry;

// Re-exports
pub use aspect::{
    expand, synthetic_step_name, Aspect, AspectPosition, AspectScope, CacheMark, EffectiveStep,
    SideEffectHandler, StepCard, SyntheticStep, CACHE_ASPECT,
};
pub use backoff::Backoff;
pub use cache::{
    key_strategy, type_prefix, CacheBackend, CachePolicy, CacheStatus, KeyStrategy, MemoryBackend,
};
pub use classify::is_retryable;
pub use config::{
    BufferStrategy, ConfigLayer, ConfigProvenance, OrderingMode, StepConfig, StepConfigBuilder,
    StepOverrides, ThreadSafety,
};
pub use context::{
    ContextHandle, PipelineContext, HEADER_CACHE_POLICY, HEADER_CACHE_STATUS, HEADER_REPLAY,
    HEADER_VERSION,
};
pub use error::{BoxError, CacheMiss, ConfigError, HttpError, NonRetryable, PipelineError};
pub use health::{DependencyHealth, DependencyReport, HealthProbe, HealthState, ReadinessReport};
pub use jitter::Jitter;
pub use pacer::{Pacer, WaitLog};
pub use parallelism::{MergeStrategy, Parallelism};
pub use persist::{
    persist_with_policy, persistence_handler, DuplicateKeyPolicy, PersistError,
    PersistenceProvider,
};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use remote::{
    absorb_response_metadata, outbound_metadata, ByteStream, Metadata, RemoteInvoker, RemoteStep,
};
pub use settings::{CacheSettings, HealthSettings, PersistenceSettings, PipelineSettings};
pub use step::{ElementType, Item, ItemStream, ShapeKind, Step, StepCodec, StepShape};

pub mod prelude;
