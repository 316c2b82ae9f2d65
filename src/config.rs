//! Per-step execution policy.
//!
//! A [`StepConfig`] is immutable once built. Values merge from global
//! defaults, then per-step overrides, then aspect-declared overrides; each
//! applied override records its source layer so misconfiguration can be
//! traced back to where the value came from.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What to do when the backpressure buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BufferStrategy {
    /// Suspend the producer until the consumer drains.
    #[default]
    Buffer,
    /// Silently discard overflow items (counted in telemetry).
    Drop,
}

/// Whether a step's outputs must preserve input order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderingMode {
    #[default]
    Strict,
    Relaxed,
}

/// Whether a step's user function tolerates concurrent invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreadSafety {
    Safe,
    #[default]
    Unsafe,
}

/// Source layer an effective config value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Built-in default.
    Default,
    /// `pipeline.defaults.*`.
    Global,
    /// `pipeline.step.<id>.*`.
    Step,
    /// Declared on the aspect itself.
    Aspect,
}

/// Partial config: every field optional, applied on top of lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct StepOverrides {
    pub retry_limit: Option<u32>,
    pub retry_wait_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub jitter: Option<bool>,
    pub recover_on_failure: Option<bool>,
    pub backpressure_buffer_capacity: Option<usize>,
    pub backpressure_strategy: Option<BufferStrategy>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub ordering: Option<OrderingMode>,
    pub thread_safety: Option<ThreadSafety>,
}

impl StepOverrides {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Layer `other` on top of `self`; set fields in `other` win.
    pub fn overlay(&self, other: &StepOverrides) -> StepOverrides {
        StepOverrides {
            retry_limit: other.retry_limit.or(self.retry_limit),
            retry_wait_ms: other.retry_wait_ms.or(self.retry_wait_ms),
            max_backoff_ms: other.max_backoff_ms.or(self.max_backoff_ms),
            jitter: other.jitter.or(self.jitter),
            recover_on_failure: other.recover_on_failure.or(self.recover_on_failure),
            backpressure_buffer_capacity: other
                .backpressure_buffer_capacity
                .or(self.backpressure_buffer_capacity),
            backpressure_strategy: other.backpressure_strategy.or(self.backpressure_strategy),
            batch_size: other.batch_size.or(self.batch_size),
            batch_timeout_ms: other.batch_timeout_ms.or(self.batch_timeout_ms),
            ordering: other.ordering.or(self.ordering),
            thread_safety: other.thread_safety.or(self.thread_safety),
        }
    }
}

/// Immutable per-step policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepConfig {
    retry_limit: u32,
    retry_wait: Duration,
    max_backoff: Duration,
    jitter: bool,
    recover_on_failure: bool,
    buffer_capacity: usize,
    buffer_strategy: BufferStrategy,
    batch_size: usize,
    batch_timeout: Duration,
    ordering: OrderingMode,
    thread_safety: ThreadSafety,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_wait: Duration::from_millis(2000),
            max_backoff: Duration::from_millis(30_000),
            jitter: false,
            recover_on_failure: false,
            buffer_capacity: 1024,
            buffer_strategy: BufferStrategy::Buffer,
            batch_size: 16,
            batch_timeout: Duration::from_secs(1),
            ordering: OrderingMode::Strict,
            thread_safety: ThreadSafety::Unsafe,
        }
    }
}

impl StepConfig {
    pub fn builder() -> StepConfigBuilder {
        StepConfigBuilder::default()
    }

    /// Maximum total attempts per item (the first call counts as attempt 1).
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Base wait before the first retry.
    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Cap on backoff growth.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Route exhausted items to the dead-letter handler instead of failing.
    pub fn recover_on_failure(&self) -> bool {
        self.recover_on_failure
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn buffer_strategy(&self) -> BufferStrategy {
        self.buffer_strategy
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    pub fn ordering(&self) -> OrderingMode {
        self.ordering
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        self.thread_safety
    }

    /// Merge layers bottom-up and validate the result.
    ///
    /// Returns the effective config plus the provenance of every field that
    /// was overridden above the built-in defaults.
    pub fn resolve(
        global: &StepOverrides,
        step: &StepOverrides,
        aspect: &StepOverrides,
    ) -> Result<(StepConfig, ConfigProvenance), ConfigError> {
        let mut builder = StepConfigBuilder::default();
        let mut provenance = ConfigProvenance::default();
        for (layer, overrides) in [
            (ConfigLayer::Global, global),
            (ConfigLayer::Step, step),
            (ConfigLayer::Aspect, aspect),
        ] {
            builder.apply(overrides, layer, &mut provenance);
        }
        Ok((builder.build()?, provenance))
    }
}

/// Records which layer supplied each overridden field.
#[derive(Debug, Clone, Default)]
pub struct ConfigProvenance {
    sources: HashMap<&'static str, ConfigLayer>,
}

impl ConfigProvenance {
    /// Layer that supplied `field`, or `Default` when never overridden.
    pub fn source_of(&self, field: &str) -> ConfigLayer {
        self.sources.get(field).copied().unwrap_or(ConfigLayer::Default)
    }

    fn record(&mut self, field: &'static str, layer: ConfigLayer) {
        self.sources.insert(field, layer);
    }
}

/// Builder validating the invariants of [`StepConfig`].
#[derive(Debug, Clone, Default)]
pub struct StepConfigBuilder {
    config: StepConfig,
}

impl StepConfigBuilder {
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.retry_limit = limit;
        self
    }

    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.config.retry_wait = wait;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.config.max_backoff = max;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn recover_on_failure(mut self, enabled: bool) -> Self {
        self.config.recover_on_failure = enabled;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    pub fn buffer_strategy(mut self, strategy: BufferStrategy) -> Self {
        self.config.buffer_strategy = strategy;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout = timeout;
        self
    }

    pub fn ordering(mut self, ordering: OrderingMode) -> Self {
        self.config.ordering = ordering;
        self
    }

    pub fn thread_safety(mut self, safety: ThreadSafety) -> Self {
        self.config.thread_safety = safety;
        self
    }

    fn apply(
        &mut self,
        overrides: &StepOverrides,
        layer: ConfigLayer,
        provenance: &mut ConfigProvenance,
    ) {
        if let Some(v) = overrides.retry_limit {
            self.config.retry_limit = v;
            provenance.record("retry-limit", layer);
        }
        if let Some(v) = overrides.retry_wait_ms {
            self.config.retry_wait = Duration::from_millis(v);
            provenance.record("retry-wait-ms", layer);
        }
        if let Some(v) = overrides.max_backoff_ms {
            self.config.max_backoff = Duration::from_millis(v);
            provenance.record("max-backoff-ms", layer);
        }
        if let Some(v) = overrides.jitter {
            self.config.jitter = v;
            provenance.record("jitter", layer);
        }
        if let Some(v) = overrides.recover_on_failure {
            self.config.recover_on_failure = v;
            provenance.record("recover-on-failure", layer);
        }
        if let Some(v) = overrides.backpressure_buffer_capacity {
            self.config.buffer_capacity = v;
            provenance.record("backpressure-buffer-capacity", layer);
        }
        if let Some(v) = overrides.backpressure_strategy {
            self.config.buffer_strategy = v;
            provenance.record("backpressure-strategy", layer);
        }
        if let Some(v) = overrides.batch_size {
            self.config.batch_size = v;
            provenance.record("batch-size", layer);
        }
        if let Some(v) = overrides.batch_timeout_ms {
            self.config.batch_timeout = Duration::from_millis(v);
            provenance.record("batch-timeout-ms", layer);
        }
        if let Some(v) = overrides.ordering {
            self.config.ordering = v;
            provenance.record("ordering", layer);
        }
        if let Some(v) = overrides.thread_safety {
            self.config.thread_safety = v;
            provenance.record("thread-safety", layer);
        }
    }

    pub fn build(self) -> Result<StepConfig, ConfigError> {
        let config = self.config;
        if config.retry_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry-limit",
                reason: "must be at least 1 (the first attempt counts)".into(),
            });
        }
        if config.max_backoff < config.retry_wait {
            return Err(ConfigError::InvalidValue {
                field: "max-backoff-ms",
                reason: format!(
                    "must be >= retry-wait ({:?} < {:?})",
                    config.max_backoff, config.retry_wait
                ),
            });
        }
        if config.buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backpressure-buffer-capacity",
                reason: "must be positive".into(),
            });
        }
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch-size",
                reason: "must be positive".into(),
            });
        }
        if config.batch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "batch-timeout-ms",
                reason: "must be positive".into(),
            });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let config = StepConfig::default();
        assert_eq!(config.retry_limit(), 3);
        assert_eq!(config.retry_wait(), Duration::from_millis(2000));
        assert_eq!(config.max_backoff(), Duration::from_millis(30_000));
        assert!(!config.jitter());
        assert!(!config.recover_on_failure());
        assert_eq!(config.buffer_capacity(), 1024);
        assert_eq!(config.buffer_strategy(), BufferStrategy::Buffer);
    }

    #[test]
    fn zero_retry_limit_rejected() {
        let err = StepConfig::builder().retry_limit(0).build().unwrap_err();
        assert!(err.to_string().contains("retry-limit"));
    }

    #[test]
    fn backoff_below_wait_rejected() {
        let err = StepConfig::builder()
            .retry_wait(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max-backoff-ms"));
    }

    #[test]
    fn layered_merge_records_provenance() {
        let global = StepOverrides { retry_limit: Some(5), jitter: Some(true), ..Default::default() };
        let step = StepOverrides { retry_limit: Some(2), ..Default::default() };
        let aspect = StepOverrides { recover_on_failure: Some(true), ..Default::default() };

        let (config, provenance) = StepConfig::resolve(&global, &step, &aspect).unwrap();
        assert_eq!(config.retry_limit(), 2);
        assert!(config.jitter());
        assert!(config.recover_on_failure());

        assert_eq!(provenance.source_of("retry-limit"), ConfigLayer::Step);
        assert_eq!(provenance.source_of("jitter"), ConfigLayer::Global);
        assert_eq!(provenance.source_of("recover-on-failure"), ConfigLayer::Aspect);
        assert_eq!(provenance.source_of("batch-size"), ConfigLayer::Default);
    }

    #[test]
    fn merged_values_still_validated() {
        let global = StepOverrides {
            retry_wait_ms: Some(10_000),
            max_backoff_ms: Some(100),
            ..Default::default()
        };
        let err =
            StepConfig::resolve(&global, &StepOverrides::default(), &StepOverrides::default())
                .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn overrides_deserialize_from_kebab_case() {
        let overrides: StepOverrides = toml::from_str(
            r#"
            retry-limit = 4
            backpressure-strategy = "DROP"
            ordering = "RELAXED"
            "#,
        )
        .unwrap();
        assert_eq!(overrides.retry_limit, Some(4));
        assert_eq!(overrides.backpressure_strategy, Some(BufferStrategy::Drop));
        assert_eq!(overrides.ordering, Some(OrderingMode::Relaxed));
        assert!(overrides.jitter.is_none());
    }
}
