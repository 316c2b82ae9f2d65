//! Error types for pipeline composition and execution

use thiserror::Error;

/// Boxed error used at the untrusted user-function boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors detected while composing a pipeline. Always fatal at build time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value failed validation.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    /// An effective step could not be resolved against the registry.
    #[error("unknown step {name:?}")]
    UnknownStep { name: String },
    /// Two steps were registered under the same name.
    #[error("duplicate step {name:?}")]
    DuplicateStep { name: String },
    /// Neighbouring steps disagree on the element type.
    #[error("step {upstream:?} produces {produces} but {downstream:?} expects {expects}")]
    TypeMismatch {
        upstream: String,
        produces: &'static str,
        downstream: String,
        expects: &'static str,
    },
    /// An aspect was declared without a registered side-effect handler.
    #[error("no side-effect handler registered for aspect {aspect:?}")]
    MissingHandler { aspect: String },
    /// A cache-marked step lacks the codec its policy needs.
    #[error("step {step:?} is cache-marked but has no {which} codec")]
    MissingCodec { step: String, which: &'static str },
    /// A cache aspect was declared but no cache backend is wired.
    #[error("step {step:?} is cache-marked but no cache backend is configured")]
    CacheBackendRequired { step: String },
    /// A policy string did not parse.
    #[error("unknown cache policy {value:?}")]
    UnknownCachePolicy { value: String },
    /// An aspect targets a step shape the runtime cannot wrap.
    #[error("step {step:?}: {reason}")]
    UnsupportedShape { step: String, reason: String },
}

/// Errors surfaced by a running pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Composition-time failure observed at a run entry.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A step exhausted its retry budget (or failed non-retryably).
    #[error("step {step:?} failed after {attempts} attempt(s)")]
    Step {
        step: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },
    /// The flow was cancelled before completion.
    #[error("pipeline cancelled")]
    Cancelled,
    /// A unary exit produced no item.
    #[error("pipeline completed without emitting an item")]
    EmptyStream,
    /// A startup dependency never became healthy.
    #[error("dependency {dependency:?} unhealthy: {detail}")]
    Unhealthy { dependency: String, detail: String },
}

impl PipelineError {
    /// True when the failure chain contains a [`CacheMiss`].
    pub fn is_cache_miss(&self) -> bool {
        let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(e) = cur {
            if e.is::<CacheMiss>() {
                return true;
            }
            cur = e.source();
        }
        false
    }

    /// True for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Name of the step this failure belongs to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// Read-only cache policy found nothing under the resolved key.
///
/// Non-retryable by classification: retrying cannot make the entry appear.
#[derive(Debug, Clone, Error)]
#[error("required cache entry missing for key {key:?}")]
pub struct CacheMiss {
    /// Effective key that missed; empty when no key strategy applied.
    pub key: String,
}

/// Marker wrapper that pins a failure as non-retryable regardless of cause.
#[derive(Debug, Error)]
#[error("non-retryable: {detail}")]
pub struct NonRetryable {
    detail: String,
    #[source]
    source: Option<BoxError>,
}

impl NonRetryable {
    /// Wrap an existing error, keeping it reachable through `source()`.
    pub fn new(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self { detail: source.to_string(), source: Some(source) }
    }

    /// Marker with a bare message and no underlying cause.
    pub fn msg(detail: impl Into<String>) -> Self {
        Self { detail: detail.into(), source: None }
    }
}

/// An HTTP-shaped failure carrying its status code.
#[derive(Debug, Clone, Error)]
#[error("http status {status}: {message}")]
pub struct HttpError {
    /// Response status code.
    pub status: u16,
    /// Short description from the transport.
    pub message: String,
}

impl HttpError {
    /// Build from a status code and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// True for 4xx codes, the non-retryable client-error band.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}
