//! Orchestrator configuration
//!
//! All tunables live in a single TOML file. Every section rejects
//! unrecognized keys at load time so a typo fails startup instead of being
//! silently ignored.

use crate::vnf::VnfType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// TOML parse or unknown-key failure
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failure
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    /// Closed set of VNF types managed in this run
    pub vnf_types: Vec<VnfType>,
    /// Lower bound on instances per type
    pub min_instances: u32,
    /// Upper bound on instances per type
    pub max_instances: u32,
    /// Per-instance chain reservation cap
    pub instance_concurrency_cap: u32,
    /// Threshold rule values
    pub scaling_thresholds: ScalingThresholds,
    /// Forecasting engine settings
    pub forecasting: ForecastingConfig,
    /// Rolling update timers
    pub rolling_update: RollingUpdateConfig,
    /// Learning agent hyperparameters
    pub drl_config: DrlConfig,
    /// Control loop cadence
    pub control_loop: ControlLoopConfig,
    /// HTTP listen ports
    pub http: HttpConfig,
    /// Metrics scraper settings
    pub scraper: ScraperConfig,
    /// SLA objectives
    pub sla: SlaConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            vnf_types: vec![
                VnfType::Firewall,
                VnfType::Encryption,
                VnfType::SpamFilter,
                VnfType::ContentFilter,
                VnfType::Mail,
            ],
            min_instances: 1,
            max_instances: 5,
            instance_concurrency_cap: 16,
            scaling_thresholds: ScalingThresholds::default(),
            forecasting: ForecastingConfig::default(),
            rolling_update: RollingUpdateConfig::default(),
            drl_config: DrlConfig::default(),
            control_loop: ControlLoopConfig::default(),
            http: HttpConfig::default(),
            scraper: ScraperConfig::default(),
            sla: SlaConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vnf_types.is_empty() {
            return Err(ConfigError::Invalid("vnf_types must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for vnf in &self.vnf_types {
            if !seen.insert(*vnf) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate vnf type {vnf} in vnf_types"
                )));
            }
        }
        if self.min_instances == 0 {
            return Err(ConfigError::Invalid("min_instances must be at least 1".into()));
        }
        if self.min_instances > self.max_instances {
            return Err(ConfigError::Invalid(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.instance_concurrency_cap == 0 {
            return Err(ConfigError::Invalid(
                "instance_concurrency_cap must be at least 1".into(),
            ));
        }
        self.scaling_thresholds.validate()?;
        self.forecasting.validate()?;
        self.drl_config.validate()?;
        Ok(())
    }
}

/// Upper/lower pair for one threshold rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdBand {
    /// Scale-out trigger level
    pub upper: f64,
    /// Scale-in permit level
    pub lower: f64,
}

/// Threshold rule values for the scaling controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScalingThresholds {
    /// CPU utilization (percent)
    pub cpu: ThresholdBand,
    /// Memory utilization (percent)
    pub memory: ThresholdBand,
    /// Processing latency (milliseconds)
    pub latency: ThresholdBand,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            cpu: ThresholdBand { upper: 80.0, lower: 30.0 },
            memory: ThresholdBand { upper: 85.0, lower: 40.0 },
            latency: ThresholdBand { upper: 1000.0, lower: 200.0 },
        }
    }
}

impl ScalingThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, band) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("latency", self.latency),
        ] {
            if band.lower >= band.upper {
                return Err(ConfigError::Invalid(format!(
                    "scaling_thresholds.{name}: lower ({}) must be below upper ({})",
                    band.lower, band.upper
                )));
            }
        }
        Ok(())
    }
}

/// Forecasting engine settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ForecastingConfig {
    /// Ring buffer window W per metric series
    pub window_size: usize,
    /// Forecast horizon h in steps
    pub forecast_steps: usize,
    /// Confidence required for forecast-driven scaling
    pub confidence_threshold: f64,
    /// Confidence level of the returned bounds
    pub confidence_level: f64,
    /// Maximum non-seasonal differencing before giving up
    pub max_differencing: usize,
    /// Maximum AR order in the grid search
    pub max_p: usize,
    /// Maximum MA order in the grid search
    pub max_q: usize,
    /// Rolling MAPE level (percent) that forces a retrain
    pub retrain_mape: f64,
}

impl Default for ForecastingConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            forecast_steps: 3,
            confidence_threshold: 0.7,
            confidence_level: 0.95,
            max_differencing: 2,
            max_p: 3,
            max_q: 3,
            retrain_mape: 20.0,
        }
    }
}

impl ForecastingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 8 {
            return Err(ConfigError::Invalid(
                "forecasting.window_size must be at least 8".into(),
            ));
        }
        if self.forecast_steps == 0 {
            return Err(ConfigError::Invalid(
                "forecasting.forecast_steps must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(
                "forecasting.confidence_threshold must be in [0, 1)".into(),
            ));
        }
        if !(0.5..1.0).contains(&self.confidence_level) {
            return Err(ConfigError::Invalid(
                "forecasting.confidence_level must be in [0.5, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Samples between scheduled retrains (M = W/4, at least 1).
    pub fn retrain_every(&self) -> usize {
        (self.window_size / 4).max(1)
    }
}

/// Rolling update timers, all in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RollingUpdateConfig {
    /// T_h: instance must become healthy within this many seconds
    pub health_check_timeout: u64,
    /// T_d: drain wait before destroy, seconds
    pub drain_timeout: u64,
    /// Extra grace after drain timeout, seconds
    pub grace_period: u64,
}

impl Default for RollingUpdateConfig {
    fn default() -> Self {
        Self {
            health_check_timeout: 30,
            drain_timeout: 60,
            grace_period: 10,
        }
    }
}

impl RollingUpdateConfig {
    /// T_h as a [`Duration`].
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    /// T_d as a [`Duration`].
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    /// Grace period as a [`Duration`].
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }
}

/// Reward weights for the learning agent, exposed so the tuning baseline is
/// visible in configuration rather than buried in code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RewardWeights {
    /// Chain request satisfied
    pub chain_satisfied: f64,
    /// Chain request dropped
    pub chain_dropped: f64,
    /// Agent proposed an invalid action
    pub invalid_action: f64,
    /// Instance drained while predicted load was above threshold
    pub unnecessary_teardown: f64,
    /// Utilization in the high band with no SLA violation
    pub efficiency_bonus: f64,
    /// SLA violation observed
    pub sla_violation: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            chain_satisfied: 2.0,
            chain_dropped: -1.5,
            invalid_action: -1.0,
            unnecessary_teardown: -0.5,
            efficiency_bonus: 0.3,
            sla_violation: -0.8,
        }
    }
}

/// Learning agent hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DrlConfig {
    /// Adam learning rate
    pub learning_rate: f64,
    /// Replay sample size per train step
    pub batch_size: usize,
    /// Replay buffer capacity B
    pub memory_size: usize,
    /// Discount factor
    pub gamma: f64,
    /// Initial exploration rate
    pub epsilon_start: f64,
    /// Exploration floor
    pub epsilon_min: f64,
    /// Multiplicative epsilon decay per step
    pub epsilon_decay: f64,
    /// Train steps between target network syncs (U)
    pub target_update_freq: u64,
    /// Soft sync blend factor applied at every sync
    pub tau: f64,
    /// Priority exponent alpha
    pub priority_alpha: f64,
    /// Initial importance-sampling exponent beta
    pub beta_start: f64,
    /// Train steps over which beta anneals to 1.0
    pub beta_anneal_steps: u64,
    /// Control ticks per episode
    pub episode_length: u32,
    /// Checkpoint every this many episodes
    pub checkpoint_every: u32,
    /// Checkpoint artifact path
    pub model_path: PathBuf,
    /// RNG seed for reproducible exploration
    pub seed: u64,
    /// Reward weights
    pub rewards: RewardWeights,
}

impl Default for DrlConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 32,
            memory_size: 10_000,
            gamma: 0.99,
            epsilon_start: 1.0,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            target_update_freq: 100,
            tau: 0.1,
            priority_alpha: 0.6,
            beta_start: 0.4,
            beta_anneal_steps: 20_000,
            episode_length: 32,
            checkpoint_every: 10,
            model_path: PathBuf::from("sfcflow-agent.ckpt"),
            seed: 7,
            rewards: RewardWeights::default(),
        }
    }
}

impl DrlConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.memory_size < self.batch_size {
            return Err(ConfigError::Invalid(
                "drl_config: memory_size must be at least batch_size (> 0)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ConfigError::Invalid("drl_config.gamma must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.epsilon_min)
            || !(0.0..=1.0).contains(&self.epsilon_start)
            || self.epsilon_min > self.epsilon_start
        {
            return Err(ConfigError::Invalid(
                "drl_config: epsilon bounds must satisfy 0 <= epsilon_min <= epsilon_start <= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return Err(ConfigError::Invalid("drl_config.tau must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Control loop cadence, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ControlLoopConfig {
    /// Seconds between control ticks
    pub tick_interval: u64,
    /// T_c: per-type cooldown between scale actions, seconds
    pub cooldown: u64,
    /// Global cap on concurrent scale operations
    pub max_concurrent_scaling: usize,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: 60,
            cooldown: 120,
            max_concurrent_scaling: 3,
        }
    }
}

impl ControlLoopConfig {
    /// Tick interval as a [`Duration`].
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_interval)
    }

    /// Cooldown T_c as a [`Duration`].
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown)
    }
}

/// HTTP listen ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpConfig {
    /// Port for the Prometheus text exposition
    pub metrics_port: u16,
    /// Port for the flow control surface
    pub flow_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metrics_port: 9100,
            flow_port: 8080,
        }
    }
}

/// Metrics scraper settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScraperConfig {
    /// Seconds between scrape rounds
    pub interval: u64,
    /// Consecutive probe failures before an instance is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            interval: 15,
            failure_threshold: 3,
        }
    }
}

impl ScraperConfig {
    /// Scrape period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// SLA objectives for chained traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SlaConfig {
    /// End-to-end latency bound, milliseconds
    pub latency_ms: f64,
    /// Acceptance-ratio floor over the tracking window
    pub acceptance_ratio: f64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            latency_ms: 1000.0,
            acceptance_ratio: 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = toml::from_str::<OrchestratorConfig>("frobnicate = 3").unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn unknown_nested_keys_rejected() {
        let raw = "[control_loop]\ntick_interval = 5\nbogus = 1\n";
        assert!(toml::from_str::<OrchestratorConfig>(raw).is_err());
    }

    #[test]
    fn inverted_bounds_rejected() {
        let mut config = OrchestratorConfig::default();
        config.min_instances = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_gets_defaults() {
        let config: OrchestratorConfig =
            toml::from_str("vnf_types = [\"firewall\", \"mail\"]").unwrap();
        assert_eq!(config.vnf_types.len(), 2);
        assert_eq!(config.forecasting.window_size, 20);
        assert_eq!(config.control_loop.cooldown, 120);
    }
}
