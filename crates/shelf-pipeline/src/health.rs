//! Coordinator health reporting.

use crate::metrics::Bottleneck;
use serde::{Deserialize, Serialize};
use shelf_config::HealthConfig;

/// Overall health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Failure rate below the degraded threshold and no bottlenecks
    Healthy,
    /// Elevated failure rate or a slow stage
    Degraded,
    /// Failure rate at or above the unhealthy threshold
    Unhealthy,
}

impl HealthState {
    /// Classify from a failure rate and whether any bottleneck exists
    pub fn evaluate(failure_rate: f64, has_bottlenecks: bool, config: &HealthConfig) -> Self {
        if failure_rate >= config.unhealthy_failure_rate {
            HealthState::Unhealthy
        } else if failure_rate >= config.degraded_failure_rate || has_bottlenecks {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Snapshot returned by `PipelineCoordinator::get_health_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    pub active_pipelines: usize,
    pub queued_pipelines: usize,
    pub max_concurrent_pipelines: usize,
    pub failure_rate: f64,
    pub bottlenecks: Vec<Bottleneck>,
}
