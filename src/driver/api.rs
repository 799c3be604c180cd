//! Opaque container capability set
//!
//! Any adapter providing create/destroy/inspect/exec-probe is acceptable;
//! the orchestrator never looks inside a container.

use crate::driver::DriverError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource limits passed to the container runtime at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores, fractional allowed
    pub cpu_cores: f64,
    /// Memory limit in megabytes
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
        }
    }
}

/// Point-in-time resource usage reported by the runtime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU utilization, percent
    pub cpu_percent: f64,
    /// Memory utilization, percent
    pub memory_percent: f64,
    /// Processing latency, milliseconds
    pub latency_ms: f64,
    /// Throughput, requests per second
    pub throughput_rps: f64,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContainerInspection {
    /// Whether the container process is running
    pub running: bool,
    /// Resource usage, absent until the runtime has a sample
    pub stats: Option<ContainerStats>,
}

/// The capability set the instance driver requires from a container runtime.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Launch a container, returning an opaque reference.
    async fn create(
        &self,
        image: &str,
        env: &HashMap<String, String>,
        limits: &ResourceLimits,
    ) -> Result<String, DriverError>;

    /// Remove a container. Idempotent.
    async fn destroy(&self, container: &str) -> Result<(), DriverError>;

    /// Inspect current state and resource usage.
    async fn inspect(&self, container: &str) -> Result<ContainerInspection, DriverError>;

    /// Run a health-probe command inside the container, returning its exit
    /// code (0 = healthy).
    async fn exec_probe(&self, container: &str, command: &str) -> Result<i32, DriverError>;
}
