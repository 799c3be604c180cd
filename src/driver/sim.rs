//! In-process container runtime
//!
//! Backs the test subcommands and the test suite. Containers are table
//! entries whose health and load are controlled by the caller, so scenarios
//! can inject probe failures, missing images, and arbitrary load shapes.

use crate::driver::api::{ContainerApi, ContainerInspection, ContainerStats, ResourceLimits};
use crate::driver::DriverError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct SimContainer {
    image: String,
    healthy_after: Instant,
    probes_fail: bool,
    destroyed: bool,
    load: ContainerStats,
}

/// Simulated container runtime.
pub struct SimContainerApi {
    containers: Mutex<HashMap<String, SimContainer>>,
    missing_images: Mutex<HashSet<String>>,
    failing_images: Mutex<HashSet<String>>,
    startup_delay: Duration,
    next_id: AtomicU64,
}

impl SimContainerApi {
    /// Runtime whose containers become healthy after `startup_delay`.
    pub fn new(startup_delay: Duration) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            missing_images: Mutex::new(HashSet::new()),
            failing_images: Mutex::new(HashSet::new()),
            startup_delay,
            next_id: AtomicU64::new(1),
        }
    }

    /// Make future `create` calls for this image fail with `ImageMissing`.
    pub fn mark_image_missing(&self, image: &str) {
        self.missing_images.lock().insert(image.to_string());
    }

    /// Make health probes fail forever for containers of this image.
    pub fn fail_probes_for(&self, image: &str) {
        self.failing_images.lock().insert(image.to_string());
    }

    /// Override the reported load of one container.
    pub fn set_load(&self, container: &str, load: ContainerStats) {
        if let Some(entry) = self.containers.lock().get_mut(container) {
            entry.load = load;
        }
    }

    /// Override the reported load of every container running `image`.
    pub fn set_load_for_image(&self, image: &str, load: ContainerStats) {
        for entry in self.containers.lock().values_mut() {
            if entry.image == image && !entry.destroyed {
                entry.load = load;
            }
        }
    }

    /// Number of live (not destroyed) containers.
    pub fn live_count(&self) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|c| !c.destroyed)
            .count()
    }
}

impl Default for SimContainerApi {
    fn default() -> Self {
        // Short startup so scenario runs settle quickly.
        Self::new(Duration::from_millis(20))
    }
}

#[async_trait]
impl ContainerApi for SimContainerApi {
    async fn create(
        &self,
        image: &str,
        _env: &HashMap<String, String>,
        _limits: &ResourceLimits,
    ) -> Result<String, DriverError> {
        if self.missing_images.lock().contains(image) {
            return Err(DriverError::ImageMissing {
                image: image.to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("sim-{n}");
        let probes_fail = self.failing_images.lock().contains(image);
        self.containers.lock().insert(
            name.clone(),
            SimContainer {
                image: image.to_string(),
                healthy_after: Instant::now() + self.startup_delay,
                probes_fail,
                destroyed: false,
                load: ContainerStats {
                    cpu_percent: 35.0,
                    memory_percent: 45.0,
                    latency_ms: 80.0,
                    throughput_rps: 50.0,
                },
            },
        );
        debug!(container = %name, %image, "sim container created");
        Ok(name)
    }

    async fn destroy(&self, container: &str) -> Result<(), DriverError> {
        if let Some(entry) = self.containers.lock().get_mut(container) {
            entry.destroyed = true;
        }
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInspection, DriverError> {
        let containers = self.containers.lock();
        let entry = containers
            .get(container)
            .ok_or_else(|| DriverError::AlreadyDestroyed {
                container: container.to_string(),
            })?;
        if entry.destroyed {
            return Err(DriverError::AlreadyDestroyed {
                container: container.to_string(),
            });
        }
        Ok(ContainerInspection {
            running: Instant::now() >= entry.healthy_after && !entry.probes_fail,
            stats: Some(entry.load),
        })
    }

    async fn exec_probe(&self, container: &str, _command: &str) -> Result<i32, DriverError> {
        let containers = self.containers.lock();
        let entry = containers
            .get(container)
            .ok_or_else(|| DriverError::AlreadyDestroyed {
                container: container.to_string(),
            })?;
        if entry.destroyed {
            return Err(DriverError::AlreadyDestroyed {
                container: container.to_string(),
            });
        }
        if entry.probes_fail || Instant::now() < entry.healthy_after {
            Ok(1)
        } else {
            Ok(0)
        }
    }
}
