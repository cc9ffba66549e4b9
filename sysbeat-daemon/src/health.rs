//! Aggregated health check reporting.
//!
//! Polls each collector's `health_check()` through the registry and produces
//! a unified [`DaemonHealth`] report. The overall daemon status is the worst
//! status among all registered collectors.
//!
//! # Aggregation Rule
//!
//! - All Healthy (or no collectors) -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use serde::Serialize;

use sysbeat_core::collector::HealthStatus;

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Overall daemon health status (worst of all collectors).
    pub status: HealthStatus,
    /// Daemon uptime in seconds since start.
    pub uptime_secs: u64,
    /// Per-collector health reports.
    pub collectors: Vec<CollectorHealth>,
}

/// Health status for a single collector.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorHealth {
    /// Collector name from the configuration.
    pub name: String,
    /// Current health status of the collector.
    pub status: HealthStatus,
}

impl From<(String, HealthStatus)> for CollectorHealth {
    fn from((name, status): (String, HealthStatus)) -> Self {
        Self { name, status }
    }
}

/// Aggregate collector health statuses into a single status.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy.
/// Reasons are joined as `name: reason` in collector order.
pub fn aggregate_status(collectors: &[CollectorHealth]) -> HealthStatus {
    let mut degraded = Vec::new();
    let mut unhealthy = Vec::new();

    for collector in collectors {
        match &collector.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                degraded.push(format!("{}: {}", collector.name, reason));
            }
            HealthStatus::Unhealthy(reason) => {
                unhealthy.push(format!("{}: {}", collector.name, reason));
            }
        }
    }

    if !unhealthy.is_empty() {
        unhealthy.extend(degraded);
        HealthStatus::Unhealthy(unhealthy.join("; "))
    } else if !degraded.is_empty() {
        HealthStatus::Degraded(degraded.join("; "))
    } else {
        HealthStatus::Healthy
    }
}
