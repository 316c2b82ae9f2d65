//! Startup health polling and the readiness report.
//!
//! Each pipeline dependency (remote steps, the cache backend) exposes a
//! [`DependencyHealth`] probe. At startup the runner polls them until every
//! one is healthy, one is definitively unhealthy, or the startup timeout
//! budget is spent. The resulting [`ReadinessReport`] backs the readiness
//! probe endpoint.

use crate::pacer::Pacer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Health of one dependency at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Still starting; worth polling again.
    Pending,
    /// Definitively down; polling will not help.
    Unhealthy,
    /// The probe itself failed.
    Error,
}

/// A probe result: state plus optional detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub state: HealthState,
    pub detail: Option<String>,
}

impl HealthProbe {
    pub fn healthy() -> Self {
        Self { state: HealthState::Healthy, detail: None }
    }

    pub fn pending() -> Self {
        Self { state: HealthState::Pending, detail: None }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { state: HealthState::Unhealthy, detail: Some(detail.into()) }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self { state: HealthState::Error, detail: Some(detail.into()) }
    }
}

/// A pollable startup dependency.
#[async_trait]
pub trait DependencyHealth: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> HealthProbe;
}

/// Last observed state of one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReport {
    pub name: String,
    pub state: HealthState,
    pub detail: Option<String>,
}

/// Aggregate startup health, as exposed by the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    dependencies: Vec<DependencyReport>,
}

impl ReadinessReport {
    /// `UP` iff every dependency is healthy.
    pub fn up(&self) -> bool {
        self.dependencies.iter().all(|d| d.state == HealthState::Healthy)
    }

    /// Per-dependency states for the probe body.
    pub fn dependencies(&self) -> &[DependencyReport] {
        &self.dependencies
    }

    /// First recorded error/unhealthy detail, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.state != HealthState::Healthy)
            .find_map(|d| d.detail.as_deref())
    }
}

/// Poll `dependencies` until all healthy, one is definitively down, or the
/// timeout budget is spent. The budget is accounted in poll intervals so
/// tests can drive it with a skipping or recording pacer.
pub(crate) async fn await_startup(
    dependencies: &[Arc<dyn DependencyHealth>],
    timeout: Duration,
    interval: Duration,
    pacer: &Pacer,
) -> ReadinessReport {
    let mut waited = Duration::ZERO;
    loop {
        let mut reports = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let probe = dep.probe().await;
            reports.push(DependencyReport {
                name: dep.name().to_string(),
                state: probe.state,
                detail: probe.detail,
            });
        }
        let report = ReadinessReport { dependencies: reports };

        if report.up() {
            return report;
        }
        let definitive = report
            .dependencies
            .iter()
            .any(|d| matches!(d.state, HealthState::Unhealthy | HealthState::Error));
        if definitive || waited >= timeout {
            if !definitive {
                tracing::warn!(?timeout, "startup health polling timed out");
            }
            return report;
        }

        pacer.pause(interval).await;
        waited += interval;
    }
}
