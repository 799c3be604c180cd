//! Periodic per-instance metrics scraper
//!
//! Pulls every serving instance through the driver's scrape hook, writes
//! current values into the registry gauges, and appends one aggregated
//! sample per (type, metric) series per round. An instance failing its
//! probe `failure_threshold` times in a row is excluded from aggregates
//! until a scrape succeeds again.

use crate::config::ScraperConfig;
use crate::driver::InstanceDriver;
use crate::metrics::registry::Instruments;
use crate::metrics::series::MetricHistory;
use crate::vnf::{HealthState, MetricKind, VnfType};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// The scrape loop and its single-round body.
pub struct MetricsScraper {
    driver: Arc<InstanceDriver>,
    history: Arc<MetricHistory>,
    instruments: Instruments,
    config: ScraperConfig,
    vnf_types: Vec<VnfType>,
}

impl MetricsScraper {
    /// Build a scraper over the given driver and history.
    pub fn new(
        driver: Arc<InstanceDriver>,
        history: Arc<MetricHistory>,
        instruments: Instruments,
        config: ScraperConfig,
        vnf_types: Vec<VnfType>,
    ) -> Self {
        Self {
            driver,
            history,
            instruments,
            config,
            vnf_types,
        }
    }

    /// Run until `shutdown` flips. Jitter stays below one period because
    /// the interval ticker skips missed ticks instead of bunching them.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scrape_round().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("scraper shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One scrape round over every serving instance.
    pub async fn scrape_round(&self) {
        for vnf_type in &self.vnf_types {
            let vnf_type = *vnf_type;
            let instances = self.driver.list(vnf_type);
            for instance in &instances {
                if !matches!(
                    instance.state,
                    HealthState::Active | HealthState::Draining
                ) {
                    continue;
                }
                match self.driver.scrape(instance.id).await {
                    Ok(sample) => {
                        if let Err(err) = self.driver.pool().record_sample(instance.id, sample) {
                            debug!(instance = %instance.id, %err, "sample lost to a racing removal");
                            continue;
                        }
                        let id_label = instance.id.to_string();
                        let labels = [vnf_type.as_str(), id_label.as_str()];
                        self.instruments
                            .vnf_cpu_usage
                            .with_label_values(&labels)
                            .set(sample.cpu_percent);
                        self.instruments
                            .vnf_memory_usage
                            .with_label_values(&labels)
                            .set(sample.memory_percent);
                        self.instruments
                            .vnf_processing_latency
                            .with_label_values(&labels)
                            .observe(sample.latency_ms);
                    }
                    Err(err) => {
                        let Ok(streak) = self.driver.pool().record_probe_failure(instance.id)
                        else {
                            continue;
                        };
                        if streak == self.config.failure_threshold {
                            warn!(
                                instance = %instance.id, %vnf_type, streak,
                                "instance unhealthy, excluding from aggregates"
                            );
                        } else {
                            debug!(instance = %instance.id, %err, streak, "scrape failed");
                        }
                    }
                }
            }
            self.append_aggregates(vnf_type);
            self.instruments
                .vnf_instances_total
                .with_label_values(&[vnf_type.as_str()])
                .set(f64::from(self.driver.pool().serving_count(vnf_type)));
        }
        let any_unhealthy = self
            .driver
            .pool()
            .snapshot()
            .iter()
            .any(|i| i.probe_failures >= self.config.failure_threshold);
        self.instruments
            .component_unhealthy
            .with_label_values(&["instance-driver"])
            .set(if any_unhealthy { 1.0 } else { 0.0 });
    }

    /// Aggregate healthy-instance samples into the ring buffers: mean for
    /// cpu/memory/latency, sum for throughput.
    fn append_aggregates(&self, vnf_type: VnfType) {
        let now = Utc::now();
        let samples: Vec<_> = self
            .driver
            .list(vnf_type)
            .into_iter()
            .filter(|i| i.is_healthy(self.config.failure_threshold))
            .filter_map(|i| i.metrics)
            .collect();
        if samples.is_empty() {
            return;
        }
        let n = samples.len() as f64;
        for metric in MetricKind::ALL {
            let sum: f64 = samples
                .iter()
                .map(|s| match metric {
                    MetricKind::Cpu => s.cpu_percent,
                    MetricKind::Memory => s.memory_percent,
                    MetricKind::Latency => s.latency_ms,
                    MetricKind::Throughput => s.throughput_rps,
                })
                .sum();
            let value = if metric.aggregates_by_sum() { sum } else { sum / n };
            self.history.push(vnf_type, metric, now, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollingUpdateConfig;
    use crate::driver::api::ContainerApi;
    use crate::driver::{ContainerStats, SimContainerApi};
    use crate::metrics::registry::MetricsRegistry;
    use crate::vnf::{InstancePool, PoolLimits};
    use std::time::Duration;

    async fn scraper_fixture() -> (Arc<SimContainerApi>, Arc<InstanceDriver>, MetricsScraper) {
        let api = Arc::new(SimContainerApi::new(Duration::from_millis(5)));
        let pool = Arc::new(InstancePool::new(PoolLimits { min: 1, max: 4 }, 8));
        let driver = Arc::new(InstanceDriver::new(
            Arc::clone(&api) as Arc<dyn crate::driver::ContainerApi>,
            pool,
            RollingUpdateConfig::default(),
        ));
        let registry = MetricsRegistry::new().unwrap();
        let instruments = Instruments::register(&registry).unwrap();
        let history = Arc::new(MetricHistory::new(20));
        let scraper = MetricsScraper::new(
            Arc::clone(&driver),
            history,
            instruments,
            ScraperConfig {
                interval: 1,
                failure_threshold: 3,
            },
            vec![VnfType::Firewall],
        );
        (api, driver, scraper)
    }

    #[tokio::test]
    async fn aggregates_mean_and_sum() {
        let (api, driver, scraper) = scraper_fixture().await;
        let a = driver.create_active(VnfType::Firewall).await.unwrap();
        let b = driver.create_active(VnfType::Firewall).await.unwrap();
        for (id, cpu) in [(&a, 40.0), (&b, 60.0)] {
            api.set_load(
                &id.container_ref,
                ContainerStats {
                    cpu_percent: cpu,
                    memory_percent: 50.0,
                    latency_ms: 100.0,
                    throughput_rps: 25.0,
                },
            );
        }
        scraper.scrape_round().await;
        let history = &scraper.history;
        assert_eq!(
            history.latest(VnfType::Firewall, MetricKind::Cpu).unwrap().1,
            50.0
        );
        assert_eq!(
            history
                .latest(VnfType::Firewall, MetricKind::Throughput)
                .unwrap()
                .1,
            50.0
        );
    }

    #[tokio::test]
    async fn unhealthy_instance_excluded_after_threshold() {
        let (api, driver, scraper) = scraper_fixture().await;
        let a = driver.create_active(VnfType::Firewall).await.unwrap();
        let b = driver.create_active(VnfType::Firewall).await.unwrap();
        api.set_load(
            &a.container_ref,
            ContainerStats {
                cpu_percent: 10.0,
                memory_percent: 10.0,
                latency_ms: 10.0,
                throughput_rps: 10.0,
            },
        );
        scraper.scrape_round().await;
        // Kill b's container behind the driver's back: scrapes now fail.
        api.destroy(&b.container_ref).await.unwrap();
        for _ in 0..3 {
            scraper.scrape_round().await;
        }
        // b's stale sample is gone from the aggregate once the streak hits 3.
        let cpu = scraper
            .history
            .latest(VnfType::Firewall, MetricKind::Cpu)
            .unwrap()
            .1;
        assert_eq!(cpu, 10.0);
    }
}
