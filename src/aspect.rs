//! Aspects and their expansion into the effective step order.
//!
//! An aspect is a cross-cutting side effect (persistence, cache
//! invalidation, auditing) attached declaratively around user steps. The
//! expander turns the declared step order plus the declared aspects into the
//! *effective* order by inserting synthetic side-effect steps — except for
//! the cache aspect, which instead marks the adjacent step's client
//! invocation to flow through the cache policy engine.

use crate::cache::CachePolicy;
use crate::config::StepOverrides;
use crate::context::ContextHandle;
use crate::error::{BoxError, ConfigError};
use crate::step::{effect_fn, ElementType, Item};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;

/// The aspect name that is special-cased onto the client step.
pub const CACHE_ASPECT: &str = "cache";

/// Which steps an aspect attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AspectScope {
    /// Every step in the pipeline.
    #[default]
    Global,
    /// Only the steps listed in `target-steps`.
    Steps,
}

/// Whether the aspect observes a step's input or its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AspectPosition {
    BeforeStep,
    AfterStep,
}

/// A declared aspect.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Aspect {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: AspectScope,
    pub position: AspectPosition,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub target_steps: Vec<String>,
    /// Free-form aspect configuration (`policy`, `invalidate`, ...).
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Step-config overrides adopted by the synthetic step.
    #[serde(default)]
    pub overrides: StepOverrides,
}

fn default_enabled() -> bool {
    true
}

impl Aspect {
    /// A global after-step aspect with defaults.
    pub fn after(name: impl Into<String>) -> Self {
        Self::new(name, AspectPosition::AfterStep)
    }

    /// A global before-step aspect with defaults.
    pub fn before(name: impl Into<String>) -> Self {
        Self::new(name, AspectPosition::BeforeStep)
    }

    fn new(name: impl Into<String>, position: AspectPosition) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            scope: AspectScope::Global,
            position,
            order: 0,
            target_steps: Vec::new(),
            config: HashMap::new(),
            overrides: StepOverrides::default(),
        }
    }

    /// Restrict to the named steps.
    pub fn steps<S: Into<String>>(mut self, steps: impl IntoIterator<Item = S>) -> Self {
        self.scope = AspectScope::Steps;
        self.target_steps = steps.into_iter().map(Into::into).collect();
        self
    }

    /// Insertion order; lower lands closer to the step.
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Set one free-form config entry.
    pub fn config_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Step-config overrides for the synthetic step.
    pub fn overrides(mut self, overrides: StepOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Whether this aspect attaches to `step`.
    pub fn targets(&self, step: &str) -> bool {
        self.enabled
            && match self.scope {
                AspectScope::Global => true,
                AspectScope::Steps => self.target_steps.iter().any(|s| s == step),
            }
    }

    /// The cache aspect is marked onto the client step, never expanded.
    pub fn is_cache(&self) -> bool {
        self.name == CACHE_ASPECT
    }
}

/// The side-effect invocation materialised by a synthetic step.
///
/// Registered on the pipeline builder under the aspect's name and resolved
/// at composition time.
#[derive(Clone)]
pub struct SideEffectHandler {
    pub(crate) func: crate::step::EffectFn,
}

impl SideEffectHandler {
    /// Handler for a single element type.
    pub fn new<T, F, Fut, E>(f: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self { func: effect_fn::<T, F, Fut, E>("side-effect".into(), f) }
    }

    /// Handler over the erased item, for aspects that attach to positions of
    /// differing element types (persistence providers, invalidators).
    pub fn from_dyn<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Item, ContextHandle) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self { func: std::sync::Arc::new(f) }
    }
}

impl std::fmt::Debug for SideEffectHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SideEffectHandler")
    }
}

/// Minimal step info the expander needs.
#[derive(Debug, Clone)]
pub struct StepCard {
    pub name: String,
    pub input: ElementType,
    pub output: ElementType,
}

/// Cache marking attached to a user step by a cache aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMark {
    /// Policy from the aspect config; `None` defers to `pipeline.cache.policy`.
    pub policy: Option<CachePolicy>,
}

/// One entry of the effective step order.
#[derive(Debug, Clone)]
pub enum EffectiveStep {
    /// A user step, possibly cache-marked.
    User { name: String, cache: Option<CacheMark> },
    /// A synthetic side-effect step materialising one aspect invocation.
    Synthetic(SyntheticStep),
}

impl EffectiveStep {
    /// Name as it appears in the effective order.
    pub fn name(&self) -> &str {
        match self {
            EffectiveStep::User { name, .. } => name,
            EffectiveStep::Synthetic(synthetic) => &synthetic.name,
        }
    }
}

/// A synthetic T→T step observing one pipeline position for one aspect.
#[derive(Debug, Clone)]
pub struct SyntheticStep {
    /// Deterministic name, see [`synthetic_step_name`].
    pub name: String,
    /// The aspect that produced this step.
    pub aspect: String,
    /// Element type at the observed position.
    pub element: ElementType,
    pub position: AspectPosition,
    /// The user step this synthetic surrounds.
    pub anchor: String,
    pub overrides: StepOverrides,
    pub config: HashMap<String, String>,
}

/// Deterministic synthetic step name:
/// `"<AspectPascal><ElementType>SideEffect<TransportSuffix>ClientStep"`.
///
/// Kept in one formatter so composition, generated clients, and test
/// assertions all agree.
pub fn synthetic_step_name(aspect: &str, element: &ElementType, transport: &str) -> String {
    format!("{}{}SideEffect{}ClientStep", pascal(aspect), element.short_name(), transport)
}

fn pascal(name: &str) -> String {
    name.split(['-', '_'])
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Expand the declared order into the effective order.
///
/// For each step: `BEFORE` aspects land in front (lower `order` closer to
/// the step, i.e. later in the group), then the step itself, then `AFTER`
/// aspects (lower `order` closer, i.e. earlier in the group). Declaration
/// order breaks ties. Synthetic names already present in the base order are
/// not re-inserted, making expansion idempotent.
pub fn expand(
    cards: &[StepCard],
    aspects: &[Aspect],
    transport: &str,
) -> Result<Vec<EffectiveStep>, ConfigError> {
    let existing: HashSet<&str> = cards.iter().map(|c| c.name.as_str()).collect();
    let mut out = Vec::new();

    for card in cards {
        let mut before: Vec<(usize, &Aspect)> = aspects
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.position == AspectPosition::BeforeStep && a.targets(&card.name) && !a.is_cache()
            })
            .collect();
        before.sort_by_key(|(index, aspect)| (aspect.order, *index));
        // Mirror rule: the lowest order is emitted last, adjacent to the step.
        for (_, aspect) in before.into_iter().rev() {
            push_synthetic(&mut out, &existing, aspect, card, card.input, transport);
        }

        out.push(EffectiveStep::User {
            name: card.name.clone(),
            cache: cache_mark(aspects, &card.name)?,
        });

        let mut after: Vec<(usize, &Aspect)> = aspects
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.position == AspectPosition::AfterStep && a.targets(&card.name) && !a.is_cache()
            })
            .collect();
        after.sort_by_key(|(index, aspect)| (aspect.order, *index));
        for (_, aspect) in after {
            push_synthetic(&mut out, &existing, aspect, card, card.output, transport);
        }
    }

    Ok(out)
}

fn push_synthetic(
    out: &mut Vec<EffectiveStep>,
    existing: &HashSet<&str>,
    aspect: &Aspect,
    card: &StepCard,
    element: ElementType,
    transport: &str,
) {
    let name = synthetic_step_name(&aspect.name, &element, transport);
    if existing.contains(name.as_str()) {
        return;
    }
    out.push(EffectiveStep::Synthetic(SyntheticStep {
        name,
        aspect: aspect.name.clone(),
        element,
        position: aspect.position,
        anchor: card.name.clone(),
        overrides: aspect.overrides.clone(),
        config: aspect.config.clone(),
    }));
}

fn cache_mark(aspects: &[Aspect], step: &str) -> Result<Option<CacheMark>, ConfigError> {
    for aspect in aspects {
        if aspect.is_cache() && aspect.targets(step) {
            let policy = match aspect.config.get("policy") {
                Some(raw) => Some(raw.parse::<CachePolicy>().map_err(|_| {
                    ConfigError::UnknownCachePolicy { value: raw.clone() }
                })?),
                None => None,
            };
            return Ok(Some(CacheMark { policy }));
        }
    }
    Ok(None)
}
