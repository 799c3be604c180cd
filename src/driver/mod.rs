//! VNF instance driver
//!
//! Owns instance lifecycle against the opaque container API: create with a
//! background health probe, drain with a timed destroy, and the per-instance
//! scrape hook the metrics scraper pulls through. The driver is the only
//! component that launches or removes containers; every failure is returned
//! to the caller, never allowed to take the orchestrator down.

pub mod api;
pub mod sim;

pub use api::{ContainerApi, ContainerInspection, ContainerStats, ResourceLimits};
pub use sim::SimContainerApi;

use crate::config::RollingUpdateConfig;
use crate::vnf::{HealthState, Instance, InstanceMetrics, InstancePool, PoolError, VnfType};
use crate::InstanceId;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

// Fixed timeouts on external container-API calls.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_COMMAND: &str = "/usr/local/bin/healthcheck";
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Instance driver errors. All recoverable at the caller.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The requested image is not available to the runtime
    #[error("image missing: {image}")]
    ImageMissing {
        /// Requested image
        image: String,
    },

    /// The runtime refused the launch for lack of resources
    #[error("insufficient resources: {detail}")]
    InsufficientResources {
        /// Runtime-provided detail
        detail: String,
    },

    /// A single probe call timed out
    #[error("probe timed out for instance {id}")]
    ProbeTimeout {
        /// Affected instance
        id: InstanceId,
    },

    /// The instance never became healthy within T_h and was destroyed
    #[error("instance {id} failed its health probe within the timeout")]
    HealthTimeout {
        /// Affected instance
        id: InstanceId,
    },

    /// Operation against a container that no longer exists
    #[error("container already destroyed: {container}")]
    AlreadyDestroyed {
        /// Container reference
        container: String,
    },

    /// An external call exceeded its timeout
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Configured timeout
        timeout: Duration,
    },

    /// Pool invariant rejected the operation
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Any other runtime failure
    #[error("container runtime error: {message}")]
    Runtime {
        /// Runtime-provided detail
        message: String,
    },
}

impl DriverError {
    /// Whether retrying the call can help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. } | DriverError::Runtime { .. }
        )
    }
}

/// Retry a transient-failure-prone call with bounded exponential backoff.
async fn with_backoff<T, F, Fut>(operation: &'static str, mut call: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(operation, attempt, %err, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A created instance whose health probe is still running in the background.
#[derive(Debug)]
pub struct PendingInstance {
    /// The instance, in `starting` state
    pub instance: Instance,
    health: oneshot::Receiver<Result<Instance, DriverError>>,
}

impl PendingInstance {
    /// Wait for the background probe: the active instance on success,
    /// `HealthTimeout` after the instance has been destroyed on failure.
    pub async fn wait_healthy(self) -> Result<Instance, DriverError> {
        let id = self.instance.id;
        match self.health.await {
            Ok(result) => result,
            Err(_) => Err(DriverError::HealthTimeout { id }),
        }
    }
}

/// Lifecycle driver over the opaque container API.
pub struct InstanceDriver {
    api: Arc<dyn ContainerApi>,
    pool: Arc<InstancePool>,
    timers: RollingUpdateConfig,
}

impl InstanceDriver {
    /// Create a driver bound to one pool and one container runtime.
    pub fn new(
        api: Arc<dyn ContainerApi>,
        pool: Arc<InstancePool>,
        timers: RollingUpdateConfig,
    ) -> Self {
        Self { api, pool, timers }
    }

    /// The pool this driver mutates.
    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    async fn bounded<T, F>(
        operation: &'static str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, DriverError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::Timeout { operation, timeout })?
    }

    /// Launch an instance of `vnf_type`. Returns immediately with the
    /// instance in `starting` state; the health probe continues in the
    /// background until T_h, transitioning to `active` on success or
    /// destroying the container on timeout.
    pub async fn create(&self, vnf_type: VnfType) -> Result<PendingInstance, DriverError> {
        let env = HashMap::from([("VNF_TYPE".to_string(), vnf_type.to_string())]);
        let limits = ResourceLimits::default();
        let container = with_backoff("create", || {
            Self::bounded(
                "create",
                CREATE_TIMEOUT,
                self.api.create(vnf_type.image(), &env, &limits),
            )
        })
        .await?;

        let instance = Instance::launched(uuid::Uuid::new_v4(), vnf_type, container.clone());
        if let Err(err) = self.pool.insert(instance.clone()) {
            // Pool refused the registration; do not leak the container.
            let _ = self.api.destroy(&container).await;
            return Err(err.into());
        }
        info!(instance = %instance.id, %vnf_type, "instance launched, probing");

        let (tx, rx) = oneshot::channel();
        let api = Arc::clone(&self.api);
        let pool = Arc::clone(&self.pool);
        let health_timeout = self.timers.health_timeout();
        let id = instance.id;
        tokio::spawn(async move {
            let result = probe_until_healthy(&api, &pool, id, &container, health_timeout).await;
            let _ = tx.send(result);
        });

        Ok(PendingInstance { instance, health: rx })
    }

    /// Launch an instance and wait for its health probe.
    pub async fn create_active(&self, vnf_type: VnfType) -> Result<Instance, DriverError> {
        self.create(vnf_type).await?.wait_healthy().await
    }

    /// Mark an instance `draining` so the load balancer stops handing it
    /// new traffic. The pool rejects draining below min_instances.
    pub fn begin_drain(&self, id: InstanceId) -> Result<Instance, DriverError> {
        let instance = self.pool.transition(id, HealthState::Draining)?;
        info!(instance = %id, vnf_type = %instance.vnf_type, "draining");
        Ok(instance)
    }

    /// Wait out the drain timeout plus `grace`, then destroy.
    pub async fn complete_drain(&self, id: InstanceId, grace: Duration) -> Result<(), DriverError> {
        tokio::time::sleep(self.timers.drain() + grace).await;
        self.destroy(id).await
    }

    /// Full drain: mark draining, wait T_d plus `grace`, destroy.
    pub async fn drain(&self, id: InstanceId, grace: Duration) -> Result<(), DriverError> {
        self.begin_drain(id)?;
        self.complete_drain(id, grace).await
    }

    /// Destroy an instance's container and drop it from the pool.
    /// Idempotent: destroying an unknown or already-removed instance is Ok.
    pub async fn destroy(&self, id: InstanceId) -> Result<(), DriverError> {
        let Some(instance) = self.pool.get(id) else {
            return Ok(());
        };
        match instance.state {
            HealthState::Removed => {}
            HealthState::Starting | HealthState::Draining => {
                self.pool.transition(id, HealthState::Removed)?;
            }
            HealthState::Active => {
                // Active instances must go through draining first.
                return Err(DriverError::Pool(PoolError::InvalidTransition {
                    id,
                    from: HealthState::Active,
                    to: HealthState::Removed,
                }));
            }
        }
        match with_backoff("destroy", || self.api.destroy(&instance.container_ref)).await {
            Ok(()) | Err(DriverError::AlreadyDestroyed { .. }) => {}
            Err(err) => {
                warn!(instance = %id, %err, "container destroy failed");
                return Err(err);
            }
        }
        self.pool.purge(id);
        info!(instance = %id, vnf_type = %instance.vnf_type, "instance destroyed");
        Ok(())
    }

    /// Snapshot of known instances of one type.
    pub fn list(&self, vnf_type: VnfType) -> Vec<Instance> {
        self.pool.list(vnf_type)
    }

    /// Scrape hook: pull one instance's current metrics through the
    /// container API, bounded by the scrape timeout.
    pub async fn scrape(&self, id: InstanceId) -> Result<InstanceMetrics, DriverError> {
        let instance = self.pool.get(id).ok_or(DriverError::AlreadyDestroyed {
            container: id.to_string(),
        })?;
        let inspection = Self::bounded(
            "scrape",
            SCRAPE_TIMEOUT,
            self.api.inspect(&instance.container_ref),
        )
        .await?;
        let stats = inspection.stats.ok_or(DriverError::Runtime {
            message: format!("no stats for container {}", instance.container_ref),
        })?;
        Ok(InstanceMetrics {
            cpu_percent: stats.cpu_percent,
            memory_percent: stats.memory_percent,
            latency_ms: stats.latency_ms,
            throughput_rps: stats.throughput_rps,
            scraped_at: Utc::now(),
        })
    }
}

async fn probe_until_healthy(
    api: &Arc<dyn ContainerApi>,
    pool: &Arc<InstancePool>,
    id: InstanceId,
    container: &str,
    health_timeout: Duration,
) -> Result<Instance, DriverError> {
    let deadline = tokio::time::Instant::now() + health_timeout;
    loop {
        let probe = tokio::time::timeout(SCRAPE_TIMEOUT, api.exec_probe(container, PROBE_COMMAND));
        match probe.await {
            Ok(Ok(0)) => {
                let instance = pool.transition(id, HealthState::Active)?;
                info!(instance = %id, "health probe passed, instance active");
                return Ok(instance);
            }
            Ok(Ok(code)) => {
                debug!(instance = %id, code, "health probe not yet passing");
            }
            Ok(Err(err)) => {
                debug!(instance = %id, %err, "health probe errored");
            }
            Err(_) => {
                debug!(instance = %id, "health probe call timed out");
            }
        }
        if tokio::time::Instant::now() + PROBE_INTERVAL > deadline {
            break;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    // Timed out: tear the instance down and report.
    warn!(instance = %id, "health probe timed out, destroying instance");
    let _ = pool.transition(id, HealthState::Removed);
    let _ = api.destroy(container).await;
    pool.purge(id);
    Err(DriverError::HealthTimeout { id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnf::PoolLimits;

    fn driver_with(api: Arc<SimContainerApi>) -> InstanceDriver {
        let pool = Arc::new(InstancePool::new(PoolLimits { min: 1, max: 4 }, 8));
        let timers = RollingUpdateConfig {
            health_check_timeout: 1,
            drain_timeout: 0,
            grace_period: 0,
        };
        InstanceDriver::new(api, pool, timers)
    }

    #[tokio::test]
    async fn create_probes_to_active() {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
        let driver = driver_with(Arc::clone(&api));
        let pending = driver.create(VnfType::Firewall).await.unwrap();
        assert_eq!(pending.instance.state, HealthState::Starting);
        let active = pending.wait_healthy().await.unwrap();
        assert_eq!(active.state, HealthState::Active);
        assert_eq!(driver.pool().active_count(VnfType::Firewall), 1);
    }

    #[tokio::test]
    async fn failed_probe_destroys_instance() {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
        api.fail_probes_for(VnfType::Mail.image());
        let driver = driver_with(Arc::clone(&api));
        let err = driver.create_active(VnfType::Mail).await.unwrap_err();
        assert!(matches!(err, DriverError::HealthTimeout { .. }));
        assert_eq!(driver.pool().serving_count(VnfType::Mail), 0);
        assert_eq!(api.live_count(), 0);
    }

    #[tokio::test]
    async fn missing_image_is_reported() {
        let api = Arc::new(SimContainerApi::default());
        api.mark_image_missing(VnfType::Encryption.image());
        let driver = driver_with(api);
        let err = driver.create(VnfType::Encryption).await.unwrap_err();
        assert!(matches!(err, DriverError::ImageMissing { .. }));
    }

    #[tokio::test]
    async fn drain_waits_then_destroys() {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(5)));
        let driver = driver_with(Arc::clone(&api));
        let a = driver.create_active(VnfType::SpamFilter).await.unwrap();
        let b = driver.create_active(VnfType::SpamFilter).await.unwrap();
        driver.drain(a.id, Duration::ZERO).await.unwrap();
        assert!(driver.pool().get(a.id).is_none());
        assert_eq!(driver.pool().active_count(VnfType::SpamFilter), 1);
        assert!(driver.pool().get(b.id).is_some());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(5)));
        let driver = driver_with(api);
        let a = driver.create_active(VnfType::Firewall).await.unwrap();
        let b = driver.create_active(VnfType::Firewall).await.unwrap();
        driver.begin_drain(b.id).unwrap();
        driver.destroy(b.id).await.unwrap();
        driver.destroy(b.id).await.unwrap();
        assert!(driver.pool().get(a.id).is_some());
    }

    #[tokio::test]
    async fn scrape_returns_runtime_stats() {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(5)));
        let driver = driver_with(Arc::clone(&api));
        let a = driver.create_active(VnfType::Mail).await.unwrap();
        api.set_load(
            &a.container_ref,
            ContainerStats {
                cpu_percent: 91.0,
                memory_percent: 70.0,
                latency_ms: 400.0,
                throughput_rps: 10.0,
            },
        );
        let sample = driver.scrape(a.id).await.unwrap();
        assert_eq!(sample.cpu_percent, 91.0);
    }
}
