//! Running VNF instances

use crate::{InstanceId, VnfType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health state of a running instance.
///
/// Only `starting -> active` (health probe success), `active -> draining`
/// and `draining -> removed` are legal transitions; anything else is a bug
/// in the caller and rejected by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Launched, health probe not yet passed
    Starting,
    /// Serving traffic
    Active,
    /// Excluded from new traffic, waiting for in-flight work
    Draining,
    /// Container destroyed
    Removed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            HealthState::Starting => "starting",
            HealthState::Active => "active",
            HealthState::Draining => "draining",
            HealthState::Removed => "removed",
        };
        f.write_str(tag)
    }
}

impl HealthState {
    /// Legal lifecycle transitions.
    pub fn can_transition(self, to: HealthState) -> bool {
        matches!(
            (self, to),
            (HealthState::Starting, HealthState::Active)
                | (HealthState::Starting, HealthState::Removed)
                | (HealthState::Active, HealthState::Draining)
                | (HealthState::Draining, HealthState::Removed)
        )
    }
}

/// Last-observed per-instance metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstanceMetrics {
    /// CPU utilization, percent
    pub cpu_percent: f64,
    /// Memory utilization, percent
    pub memory_percent: f64,
    /// Processing latency, milliseconds
    pub latency_ms: f64,
    /// Throughput, requests per second
    pub throughput_rps: f64,
    /// Scrape timestamp
    pub scraped_at: DateTime<Utc>,
}

/// A running VNF instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Stable identifier
    pub id: InstanceId,
    /// Which function this instance runs
    pub vnf_type: VnfType,
    /// Opaque reference handed out by the container API
    pub container_ref: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Current health state
    pub state: HealthState,
    /// Last-observed metrics, absent until the first successful scrape
    pub metrics: Option<InstanceMetrics>,
    /// Consecutive failed probes; reset on success
    pub probe_failures: u32,
}

impl Instance {
    /// A freshly launched instance in `starting` state.
    pub fn launched(id: InstanceId, vnf_type: VnfType, container_ref: String) -> Self {
        Self {
            id,
            vnf_type,
            container_ref,
            created_at: Utc::now(),
            state: HealthState::Starting,
            metrics: None,
            probe_failures: 0,
        }
    }

    /// Whether the scraper should include this instance in aggregates.
    pub fn is_healthy(&self, failure_threshold: u32) -> bool {
        self.state == HealthState::Active && self.probe_failures < failure_threshold
    }
}
