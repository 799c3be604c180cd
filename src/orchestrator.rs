//! Top-level wiring and long-lived tasks
//!
//! The orchestrator owns every component and runs one task per duty: the
//! metrics scraper, the control-loop tick, the agent trainer, and the two
//! HTTP surfaces. Shared state moves only through component operations;
//! tasks stop when the shutdown watch flips.

use crate::agent::{ActionSpace, DqnAgent, StateBuilder};
use crate::chain::SfcAllocator;
use crate::config::OrchestratorConfig;
use crate::driver::{ContainerApi, InstanceDriver};
use crate::flow::http::FlowApiState;
use crate::flow::FlowController;
use crate::forecast::Forecaster;
use crate::metrics::registry::{Instruments, MetricsRegistry};
use crate::metrics::scraper::MetricsScraper;
use crate::metrics::series::MetricHistory;
use crate::scaling::{ScalingController, STEERING_PRIORITY};
use crate::vnf::{InstancePool, PoolLimits};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// The assembled control plane.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<MetricsRegistry>,
    instruments: Instruments,
    pool: Arc<InstancePool>,
    driver: Arc<InstanceDriver>,
    flow: Arc<FlowController>,
    history: Arc<MetricHistory>,
    forecaster: Arc<Forecaster>,
    allocator: Arc<SfcAllocator>,
    agent: Arc<tokio::sync::Mutex<DqnAgent>>,
    scaler: Arc<ScalingController>,
    scraper: Arc<MetricsScraper>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    /// Assemble every component over the given container runtime.
    pub fn new(config: OrchestratorConfig, api: Arc<dyn ContainerApi>) -> Result<Self> {
        config.validate().context("configuration invalid")?;
        let registry = Arc::new(MetricsRegistry::new()?);
        let instruments = Instruments::register(&registry)?;
        let pool = Arc::new(InstancePool::new(
            PoolLimits {
                min: config.min_instances,
                max: config.max_instances,
            },
            config.instance_concurrency_cap,
        ));
        let driver = Arc::new(InstanceDriver::new(
            api,
            Arc::clone(&pool),
            config.rolling_update,
        ));
        let flow = Arc::new(FlowController::new(Arc::clone(&pool)));
        let history = Arc::new(MetricHistory::new(config.forecasting.window_size));
        let forecaster = Arc::new(Forecaster::new(config.forecasting, Arc::clone(&history)));
        let allocator = Arc::new(SfcAllocator::new(
            Arc::clone(&pool),
            Arc::clone(&flow),
            instruments.clone(),
        ));
        let state_dim =
            StateBuilder::new(config.vnf_types.clone(), config.max_instances).dim();
        let agent = DqnAgent::new(
            config.drl_config.clone(),
            ActionSpace::new(config.vnf_types.clone()),
            state_dim,
        )?;
        let agent = Arc::new(tokio::sync::Mutex::new(agent));
        let scraper = Arc::new(MetricsScraper::new(
            Arc::clone(&driver),
            Arc::clone(&history),
            instruments.clone(),
            config.scraper,
            config.vnf_types.clone(),
        ));
        let scaler = Arc::new(ScalingController::new(
            &config,
            Arc::clone(&pool),
            Arc::clone(&driver),
            Arc::clone(&flow),
            Arc::clone(&forecaster),
            Arc::clone(&history),
            Arc::clone(&allocator),
            Arc::clone(&agent),
            instruments.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            registry,
            instruments,
            pool,
            driver,
            flow,
            history,
            forecaster,
            allocator,
            agent,
            scaler,
            scraper,
            shutdown,
        })
    }

    /// Bring every enabled type up to min_instances with steering rules.
    pub async fn bootstrap(&self) -> Result<()> {
        for vnf_type in self.config.vnf_types.clone() {
            while self.pool.serving_count(vnf_type) < self.config.min_instances {
                let instance = self
                    .driver
                    .create_active(vnf_type)
                    .await
                    .with_context(|| format!("bootstrapping {vnf_type}"))?;
                self.flow
                    .add_rule(vnf_type, instance.id, STEERING_PRIORITY, None)
                    .with_context(|| format!("wiring {vnf_type} into the balancer"))?;
            }
            self.instruments
                .vnf_instances_total
                .with_label_values(&[vnf_type.as_str()])
                .set(f64::from(self.pool.serving_count(vnf_type)));
            info!(%vnf_type, count = self.pool.serving_count(vnf_type), "bootstrapped");
        }
        Ok(())
    }

    /// Start HTTP surfaces and the long-lived tasks.
    pub async fn start(&self) -> Result<()> {
        self.registry
            .serve(self.config.http.metrics_port)
            .await
            .context("starting metrics listener")?;
        crate::flow::http::serve(
            FlowApiState {
                flow: Arc::clone(&self.flow),
                pool: Arc::clone(&self.pool),
            },
            self.config.http.flow_port,
        )
        .await
        .context("starting flow API listener")?;

        tokio::spawn(Arc::clone(&self.scraper).run(self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self.scaler).run(self.shutdown.subscribe()));
        self.spawn_trainer();
        info!("orchestrator started");
        Ok(())
    }

    fn spawn_trainer(&self) {
        let agent = Arc::clone(&self.agent);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The backward pass is CPU work; run it off-loop.
                        let agent = Arc::clone(&agent);
                        let outcome = tokio::task::spawn_blocking(move || {
                            let mut guard = agent.blocking_lock();
                            guard.train_step()
                        })
                        .await;
                        if let Err(err) = outcome {
                            warn!(%err, "trainer step panicked");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Block until ctrl-c, then stop the tasks. In-flight drains keep
    /// their timers; the signal only stops new work.
    pub async fn run_until_signal(&self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown signal received");
        self.stop();
        Ok(())
    }

    /// Flip the shutdown watch.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The shared pool.
    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    /// The instance driver.
    pub fn driver(&self) -> &Arc<InstanceDriver> {
        &self.driver
    }

    /// The flow controller.
    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    /// The chain allocator.
    pub fn allocator(&self) -> &Arc<SfcAllocator> {
        &self.allocator
    }

    /// The scaling controller.
    pub fn scaler(&self) -> &Arc<ScalingController> {
        &self.scaler
    }

    /// The metrics scraper.
    pub fn scraper(&self) -> &Arc<MetricsScraper> {
        &self.scraper
    }

    /// The aggregated sample history.
    pub fn history(&self) -> &Arc<MetricHistory> {
        &self.history
    }

    /// The forecasting engine.
    pub fn forecaster(&self) -> &Arc<Forecaster> {
        &self.forecaster
    }

    /// The metrics registry.
    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// The instrument set.
    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    /// The learning agent.
    pub fn agent(&self) -> &Arc<tokio::sync::Mutex<DqnAgent>> {
        &self.agent
    }

    /// The loaded configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
