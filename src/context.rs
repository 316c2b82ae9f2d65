//! Request-scoped pipeline context.
//!
//! One [`ContextHandle`] exists per flow. It is threaded explicitly through
//! the stream operators — never stashed in OS-thread-local storage, since
//! items migrate across workers. Reads are lock-free snapshots; the only
//! mutation points are pipeline entry and cache-status receipt.

use crate::cache::{CachePolicy, CacheStatus};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Header carrying the version tag on outbound calls.
pub const HEADER_VERSION: &str = "x-pipeline-version";
/// Header carrying the replay flag on outbound calls.
pub const HEADER_REPLAY: &str = "x-pipeline-replay";
/// Header carrying the cache policy override on outbound calls.
pub const HEADER_CACHE_POLICY: &str = "x-pipeline-cache-policy";
/// Header carrying the observed cache status on responses.
pub const HEADER_CACHE_STATUS: &str = "x-pipeline-cache-status";

/// Flow-scoped carrier of version tag, replay mode, cache policy override,
/// and the last observed cache status.
///
/// All fields are optional; blank strings are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineContext {
    version_tag: Option<String>,
    replay_mode: Option<bool>,
    cache_policy_override: Option<CachePolicy>,
    cache_status: Option<CacheStatus>,
}

impl PipelineContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the version tag. Blank tags are ignored.
    pub fn with_version_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.trim().is_empty() {
            self.version_tag = Some(tag);
        }
        self
    }

    /// Set the replay flag.
    pub fn with_replay_mode(mut self, replay: bool) -> Self {
        self.replay_mode = Some(replay);
        self
    }

    /// Override the declared cache policy for this flow.
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy_override = Some(policy);
        self
    }

    pub fn version_tag(&self) -> Option<&str> {
        self.version_tag.as_deref()
    }

    pub fn replay_mode(&self) -> Option<bool> {
        self.replay_mode
    }

    pub fn cache_policy_override(&self) -> Option<CachePolicy> {
        self.cache_policy_override
    }

    pub fn cache_status(&self) -> Option<CacheStatus> {
        self.cache_status
    }

    /// Header pairs for outbound propagation. Unset fields are omitted.
    pub fn to_header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(tag) = &self.version_tag {
            pairs.push((HEADER_VERSION, tag.clone()));
        }
        if let Some(replay) = self.replay_mode {
            pairs.push((HEADER_REPLAY, replay.to_string()));
        }
        if let Some(policy) = self.cache_policy_override {
            pairs.push((HEADER_CACHE_POLICY, policy.as_str().to_string()));
        }
        if let Some(status) = self.cache_status {
            pairs.push((HEADER_CACHE_STATUS, status.as_str().to_string()));
        }
        pairs
    }

    /// Rebuild a context from inbound headers.
    ///
    /// Blank values and unparseable policies are ignored rather than
    /// poisoning the flow.
    pub fn from_header_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut ctx = Self::new();
        if let Some(tag) = lookup(HEADER_VERSION) {
            ctx = ctx.with_version_tag(tag);
        }
        if let Some(replay) = lookup(HEADER_REPLAY) {
            if let Ok(flag) = replay.trim().parse::<bool>() {
                ctx.replay_mode = Some(flag);
            }
        }
        if let Some(policy) = lookup(HEADER_CACHE_POLICY) {
            if let Ok(policy) = policy.trim().parse::<CachePolicy>() {
                ctx.cache_policy_override = Some(policy);
            }
        }
        if let Some(status) = lookup(HEADER_CACHE_STATUS) {
            if let Ok(status) = status.trim().parse::<CacheStatus>() {
                ctx.cache_status = Some(status);
            }
        }
        ctx
    }
}

/// Clone-able handle to a flow's context.
///
/// Backed by `arc-swap`: readers take lock-free snapshots, writers swap in a
/// new immutable state. Cloning the handle shares the binding; a clone never
/// forks the flow.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<ArcSwap<PipelineContext>>,
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContextHandle").field(&self.snapshot()).finish()
    }
}

impl ContextHandle {
    /// Bind a fresh context for one flow.
    pub fn bind(ctx: PipelineContext) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(ctx)) }
    }

    /// Bind an empty context.
    pub fn empty() -> Self {
        Self::bind(PipelineContext::new())
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> Arc<PipelineContext> {
        self.inner.load_full()
    }

    /// Record the cache status observed for the latest cache interaction
    /// (local policy engine or the response header of a remote call).
    pub fn record_cache_status(&self, status: CacheStatus) {
        self.inner.rcu(|cur| {
            let mut next = (**cur).clone();
            next.cache_status = Some(status);
            next
        });
    }

    /// Clear the binding. Called on every flow exit path.
    pub fn clear(&self) {
        self.inner.store(Arc::new(PipelineContext::new()));
    }
}

impl Default for ContextHandle {
    fn default() -> Self {
        Self::empty()
    }
}
