//! The common surface in one import.
//!
//! ```rust
//! use millrace::prelude::*;
//! ```

pub use crate::telemetry::{LogSink, MemorySink, NullSink, TelemetrySink};
pub use crate::{
    Aspect, BoxError, CacheBackend, CacheMiss, CachePolicy, CacheStatus, ConfigError,
    ContextHandle, HttpError, KeyStrategy, MemoryBackend, NonRetryable, Pipeline,
    PipelineBuilder, PipelineContext, PipelineError, PipelineSettings, RemoteInvoker, RemoteStep,
    SideEffectHandler, Step, StepCodec, StepConfig, StepOverrides,
};
