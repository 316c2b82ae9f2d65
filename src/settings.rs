//! Deployment-facing configuration surface.
//!
//! Everything under the `pipeline.*` namespace: parallelism, step defaults
//! and per-step overrides, cache policy, persistence behavior, and startup
//! health limits. Feeds [`crate::PipelineBuilder`] as plain data, typically
//! loaded from a TOML file.

use crate::cache::CachePolicy;
use crate::config::StepOverrides;
use crate::error::ConfigError;
use crate::parallelism::Parallelism;
use crate::persist::DuplicateKeyPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The `pipeline.*` configuration tree.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Pipeline-level parallelism policy.
    pub parallelism: Parallelism,
    /// Concurrency budget for merged steps.
    pub max_concurrency: usize,
    /// Abort the whole stream on the first failed item.
    pub fail_fast: bool,
    /// Global step defaults, overridable per step.
    pub defaults: StepOverrides,
    /// Per-step overrides, keyed by step name.
    pub step: HashMap<String, StepOverrides>,
    pub cache: CacheSettings,
    pub persistence: PersistenceSettings,
    pub health: HealthSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::Auto,
            max_concurrency: 128,
            fail_fast: false,
            defaults: StepOverrides::default(),
            step: HashMap::new(),
            cache: CacheSettings::default(),
            persistence: PersistenceSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl PipelineSettings {
    /// Parse a TOML document with a top-level `[pipeline]` table.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize, Default)]
        #[serde(default, deny_unknown_fields)]
        struct Root {
            pipeline: PipelineSettings,
        }
        let root: Root = toml::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            field: "pipeline",
            reason: e.to_string(),
        })?;
        Ok(root.pipeline)
    }

    /// Overrides declared for a step, or the empty set.
    pub fn overrides_for(&self, step: &str) -> StepOverrides {
        self.step.get(step).cloned().unwrap_or_default()
    }
}

/// `pipeline.cache.*`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Default policy applied to cache-marked steps.
    pub policy: CachePolicy,
    /// Entry time-to-live in milliseconds; no expiry when unset.
    pub ttl_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { policy: CachePolicy::CacheOnly, ttl_ms: None }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// `pipeline.persistence.*`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PersistenceSettings {
    /// How duplicate-key failures from the provider are absorbed.
    pub duplicate_key: DuplicateKeyPolicy,
}

/// `pipeline.health.*`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HealthSettings {
    /// How long startup polling may keep reporting PENDING.
    pub startup_timeout_ms: u64,
    /// Wait between health polls.
    pub poll_interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { startup_timeout_ms: 300_000, poll_interval_ms: 1000 }
    }
}

impl HealthSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
