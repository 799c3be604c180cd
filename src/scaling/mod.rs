//! Scaling controller
//!
//! Fuses three inputs per VNF type at every control tick: current
//! aggregates against the threshold rules, forecasts with their exceedance
//! confidence, and the learning agent's suggestion filtered through the
//! safety rails. Scale operations run as background tasks bounded by a
//! global budget; per-type serialization and the cooldown both live under
//! the pool's lock so duplicate scale-outs cannot race.

use crate::agent::state::{ForecastSummary, StateBuilder};
use crate::agent::{Action, DqnAgent};
use crate::chain::SfcAllocator;
use crate::config::{ControlLoopConfig, OrchestratorConfig, RewardWeights, ScalingThresholds,
    SlaConfig};
use crate::driver::{DriverError, InstanceDriver};
use crate::flow::{FlowController, FlowError};
use crate::forecast::Forecaster;
use crate::metrics::registry::Instruments;
use crate::metrics::series::MetricHistory;
use crate::vnf::{HealthState, InstancePool, MetricKind, PoolError, VnfType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Priority of the per-instance steering rules the controller installs.
pub const STEERING_PRIORITY: u16 = 0;

/// Scale operation errors.
#[derive(Debug, Error)]
pub enum ScalingError {
    /// Driver failure
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Flow table failure
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Pool invariant failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// No instance can be drained without breaking an invariant
    #[error("{vnf_type}: no drainable instance")]
    NoDrainable {
        /// Affected type
        vnf_type: VnfType,
    },
}

/// Per-type scaling state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePhase {
    /// No scaling activity and no cooldown pending
    Steady,
    /// A scale-out is in flight
    ScalingOut,
    /// A scale-in is in flight
    ScalingIn,
    /// Last action within T_c
    Cooldown,
}

/// What the fusion decided for one type this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Out,
    In,
    Hold,
}

#[derive(Debug, Default)]
struct RewardEvents {
    invalid_actions: u32,
    unnecessary_teardowns: u32,
    failed_scale_outs: u32,
}

struct TypeSignals {
    threshold_out: bool,
    threshold_in: bool,
    forecast_out: bool,
    forecast_available: bool,
}

/// The scaling controller and its control-tick body.
pub struct ScalingController {
    types: Vec<VnfType>,
    thresholds: ScalingThresholds,
    control: ControlLoopConfig,
    rewards: RewardWeights,
    sla: SlaConfig,
    forecast_confidence: f64,
    grace: Duration,
    pool: Arc<InstancePool>,
    driver: Arc<InstanceDriver>,
    flow: Arc<FlowController>,
    forecaster: Arc<Forecaster>,
    history: Arc<MetricHistory>,
    allocator: Arc<SfcAllocator>,
    agent: Arc<tokio::sync::Mutex<DqnAgent>>,
    state_builder: StateBuilder,
    instruments: Instruments,
    budget: Arc<Semaphore>,
    episode_length: u32,
    in_flight: Mutex<HashMap<VnfType, Decision>>,
    events: Mutex<RewardEvents>,
    previous: Mutex<Option<(Vec<f64>, Action)>>,
    episode: Mutex<EpisodeState>,
}

#[derive(Debug, Default)]
struct EpisodeState {
    ticks: u32,
    reward_sum: f64,
}

impl ScalingController {
    /// Wire the controller to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &OrchestratorConfig,
        pool: Arc<InstancePool>,
        driver: Arc<InstanceDriver>,
        flow: Arc<FlowController>,
        forecaster: Arc<Forecaster>,
        history: Arc<MetricHistory>,
        allocator: Arc<SfcAllocator>,
        agent: Arc<tokio::sync::Mutex<DqnAgent>>,
        instruments: Instruments,
    ) -> Self {
        Self {
            types: config.vnf_types.clone(),
            thresholds: config.scaling_thresholds,
            control: config.control_loop,
            rewards: config.drl_config.rewards,
            sla: config.sla,
            forecast_confidence: config.forecasting.confidence_threshold,
            grace: config.rolling_update.grace(),
            pool,
            driver,
            flow,
            forecaster,
            history,
            allocator,
            agent,
            state_builder: StateBuilder::new(config.vnf_types.clone(), config.max_instances),
            instruments,
            budget: Arc::new(Semaphore::new(config.control_loop.max_concurrent_scaling)),
            episode_length: config.drl_config.episode_length.max(1),
            in_flight: Mutex::new(HashMap::new()),
            events: Mutex::new(RewardEvents::default()),
            previous: Mutex::new(None),
            episode: Mutex::new(EpisodeState::default()),
        }
    }

    /// Current phase of one type's scaling state machine.
    pub fn phase(&self, vnf_type: VnfType) -> ScalePhase {
        if let Some(direction) = self.in_flight.lock().get(&vnf_type) {
            return match direction {
                Decision::Out => ScalePhase::ScalingOut,
                Decision::In => ScalePhase::ScalingIn,
                Decision::Hold => ScalePhase::Steady,
            };
        }
        if self
            .pool
            .cooldown_remaining(vnf_type, self.control.cooldown_period())
            .is_some()
        {
            ScalePhase::Cooldown
        } else {
            ScalePhase::Steady
        }
    }

    /// Run the control loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.control.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("scaling controller shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One control tick: sense, decide, act, learn.
    pub async fn tick(self: &Arc<Self>) {
        self.allocator.verify_integrity();
        self.allocator.observe_latencies(&self.history);

        // Forecasting is CPU-heavy; keep it off the control-loop executor.
        let forecaster = Arc::clone(&self.forecaster);
        let history = Arc::clone(&self.history);
        let instruments = self.instruments.clone();
        let types = self.types.clone();
        let thresholds = self.thresholds;
        let confidence = self.forecast_confidence;
        let pass = tokio::task::spawn_blocking(move || {
            forecast_pass(&forecaster, &history, &instruments, &types, thresholds, confidence)
        })
        .await
        .unwrap_or_else(|err| {
            warn!(%err, "forecast pass panicked");
            ForecastPass::default()
        });

        // Assemble the agent state and get one suggestion.
        let arrivals = self.allocator.take_arrivals();
        let state =
            self.state_builder
                .build(&self.pool, &self.history, &pass.summaries, &arrivals);
        let suggestion = {
            let mut agent = self.agent.lock().await;
            agent.select_action(&state)
        };
        debug!(%suggestion, "agent suggestion");

        // Fuse and act per type.
        for vnf_type in self.types.clone() {
            let signals = self.signals_for(vnf_type, &pass);
            let decision = self.fuse(vnf_type, &signals, suggestion);
            match decision {
                Decision::Out => self.spawn_scale_out(vnf_type),
                Decision::In => {
                    let predicted_high = pass.out_triggers.get(&vnf_type).copied().unwrap_or(false);
                    self.spawn_scale_in(vnf_type, predicted_high);
                }
                Decision::Hold => {}
            }
        }

        // Reward the previous action with this tick's observed outcome.
        let reward = self.compute_reward();
        let terminal = {
            let mut episode = self.episode.lock();
            episode.ticks += 1;
            episode.reward_sum += reward;
            episode.ticks >= self.episode_length
        };
        {
            let mut agent = self.agent.lock().await;
            let mut previous = self.previous.lock();
            if let Some((prev_state, prev_action)) = previous.take() {
                agent.observe(prev_state, prev_action, reward, state.clone(), terminal);
            }
            *previous = Some((state, suggestion));
            if terminal {
                let episode_reward = {
                    let mut episode = self.episode.lock();
                    let sum = episode.reward_sum;
                    *episode = EpisodeState::default();
                    sum
                };
                self.instruments
                    .drl_episode_reward
                    .with_label_values(&[])
                    .set(episode_reward);
                if agent.end_episode() {
                    if let Err(err) = agent.checkpoint() {
                        warn!(%err, "agent checkpoint failed");
                    }
                }
            }
        }
    }

    fn signals_for(&self, vnf_type: VnfType, pass: &ForecastPass) -> TypeSignals {
        let aggregates = self.history.latest_aggregates(vnf_type);
        let (threshold_out, threshold_in) = match aggregates {
            Some(agg) => {
                let out = agg.cpu_percent > self.thresholds.cpu.upper
                    || agg.memory_percent > self.thresholds.memory.upper
                    || agg.latency_ms > self.thresholds.latency.upper;
                let inn = agg.cpu_percent < self.thresholds.cpu.lower
                    && agg.memory_percent < self.thresholds.memory.lower
                    && agg.latency_ms < self.thresholds.latency.lower;
                (out, inn)
            }
            None => (false, false),
        };
        TypeSignals {
            threshold_out,
            threshold_in,
            forecast_out: pass.out_triggers.get(&vnf_type).copied().unwrap_or(false),
            forecast_available: !pass.unavailable.contains(&vnf_type),
        }
    }

    fn fuse(&self, vnf_type: VnfType, signals: &TypeSignals, suggestion: Action) -> Decision {
        let cooldown_clear = self
            .pool
            .cooldown_remaining(vnf_type, self.control.cooldown_period())
            .is_none();
        let agent_out = suggestion == Action::AllocateNew(vnf_type);
        let agent_in = suggestion == Action::DrainOne(vnf_type);

        // Safety rails on the agent's suggestion.
        if agent_out && self.pool.serving_count(vnf_type) >= self.pool.limits().max {
            self.record_invalid_action(suggestion, "pool at max_instances");
            return self.rule_only_decision(signals, cooldown_clear);
        }
        if agent_in && !self.drain_is_safe(vnf_type) {
            self.record_invalid_action(suggestion, "drain would break invariants");
            return self.rule_only_decision(signals, cooldown_clear);
        }

        let out = signals.threshold_out
            || signals.forecast_out
            || (agent_out && cooldown_clear);
        if out && cooldown_clear {
            return Decision::Out;
        }
        // Scale-in needs both rules permitting, or the agent inside the
        // scale-in band.
        let forecast_permits_in = !signals.forecast_out || !signals.forecast_available;
        let rules_in = signals.threshold_in && forecast_permits_in;
        let inn = rules_in || (agent_in && cooldown_clear && signals.threshold_in);
        if inn && cooldown_clear && self.drain_is_safe(vnf_type) {
            return Decision::In;
        }
        Decision::Hold
    }

    fn rule_only_decision(&self, signals: &TypeSignals, cooldown_clear: bool) -> Decision {
        if !cooldown_clear {
            return Decision::Hold;
        }
        if signals.threshold_out || signals.forecast_out {
            Decision::Out
        } else if signals.threshold_in && !signals.forecast_out {
            Decision::In
        } else {
            Decision::Hold
        }
    }

    fn record_invalid_action(&self, suggestion: Action, reason: &str) {
        warn!(%suggestion, reason, "suppressing invalid agent action");
        self.events.lock().invalid_actions += 1;
    }

    fn drain_is_safe(&self, vnf_type: VnfType) -> bool {
        let active = self.pool.active_count(vnf_type);
        if self.pool.serving_count(vnf_type) <= self.pool.limits().min {
            return false;
        }
        // Never remove the last active instance of a type with live chains.
        !(active <= 1 && self.pool.chains_reference_type(vnf_type))
    }

    fn spawn_scale_out(self: &Arc<Self>, vnf_type: VnfType) {
        if self
            .pool
            .try_begin_scale(vnf_type, self.control.cooldown_period())
            .is_err()
        {
            return;
        }
        self.in_flight.lock().insert(vnf_type, Decision::Out);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let permit = controller.budget.clone().acquire_owned().await;
            let result = controller.scale_out(vnf_type).await;
            drop(permit);
            let acted = match result {
                Ok(()) => {
                    controller
                        .instruments
                        .scaling_actions_total
                        .with_label_values(&[vnf_type.as_str(), "out"])
                        .inc();
                    info!(%vnf_type, "scale-out complete");
                    true
                }
                Err(err) => {
                    warn!(%vnf_type, %err, "scale-out failed, rolling back to steady");
                    controller
                        .instruments
                        .scaling_actions_total
                        .with_label_values(&[vnf_type.as_str(), "failed"])
                        .inc();
                    controller.events.lock().failed_scale_outs += 1;
                    false
                }
            };
            controller.in_flight.lock().remove(&vnf_type);
            controller.pool.finish_scale(vnf_type, acted);
        });
    }

    fn spawn_scale_in(self: &Arc<Self>, vnf_type: VnfType, predicted_high: bool) {
        if self
            .pool
            .try_begin_scale(vnf_type, self.control.cooldown_period())
            .is_err()
        {
            return;
        }
        self.in_flight.lock().insert(vnf_type, Decision::In);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let permit = controller.budget.clone().acquire_owned().await;
            let result = controller.scale_in(vnf_type).await;
            drop(permit);
            let acted = match result {
                Ok(()) => {
                    controller
                        .instruments
                        .scaling_actions_total
                        .with_label_values(&[vnf_type.as_str(), "in"])
                        .inc();
                    if predicted_high {
                        controller.events.lock().unnecessary_teardowns += 1;
                    }
                    info!(%vnf_type, "scale-in complete");
                    true
                }
                Err(err) => {
                    warn!(%vnf_type, %err, "scale-in failed");
                    false
                }
            };
            controller.in_flight.lock().remove(&vnf_type);
            controller.pool.finish_scale(vnf_type, acted);
        });
    }

    /// Rolling-update scale-out: create, wait for health, wire into the
    /// balancer. The new rule lands before any old rule is touched.
    pub async fn scale_out(&self, vnf_type: VnfType) -> Result<(), ScalingError> {
        let pending = self.driver.create(vnf_type).await?;
        let instance = pending.wait_healthy().await?;
        self.flow
            .add_rule(vnf_type, instance.id, STEERING_PRIORITY, None)?;
        Ok(())
    }

    /// Rolling-update scale-in: drain one instance, pull its rules, wait
    /// out the drain window, destroy.
    pub async fn scale_in(&self, vnf_type: VnfType) -> Result<(), ScalingError> {
        let victim = self
            .pick_drain_victim(vnf_type)
            .ok_or(ScalingError::NoDrainable { vnf_type })?;
        self.driver.begin_drain(victim)?;
        self.flow.remove_rules_for_instance(victim)?;
        self.driver.complete_drain(victim, self.grace).await?;
        Ok(())
    }

    /// Choose the active instance whose removal breaks nothing: other
    /// active instances must keep at least one steering rule for the type
    /// whenever chains reference it.
    fn pick_drain_victim(&self, vnf_type: VnfType) -> Option<crate::InstanceId> {
        let instances = self.pool.list(vnf_type);
        let actives: Vec<_> = instances
            .iter()
            .filter(|i| i.state == HealthState::Active)
            .collect();
        if actives.len() < 2 && self.pool.chains_reference_type(vnf_type) {
            return None;
        }
        let rules = self.flow.list_rules(Some(vnf_type));
        actives
            .iter()
            .filter(|candidate| {
                let others_with_rules = rules
                    .iter()
                    .any(|r| r.instance_id != candidate.id
                        && actives.iter().any(|a| a.id == r.instance_id));
                others_with_rules || !self.pool.chains_reference_type(vnf_type)
            })
            .min_by_key(|candidate| {
                (
                    self.pool.chains_on_instance(candidate.id),
                    self.pool.reservation_count(candidate.id),
                )
            })
            .map(|candidate| candidate.id)
    }

    /// Reward for the elapsed tick, per the configured weights.
    fn compute_reward(&self) -> f64 {
        let outcomes = self.allocator.take_tick_outcomes();
        let events = std::mem::take(&mut *self.events.lock());
        let weights = &self.rewards;
        let mut reward = 0.0;
        reward += outcomes.satisfied as f64 * weights.chain_satisfied;
        reward += outcomes.dropped as f64 * weights.chain_dropped;
        reward += f64::from(events.invalid_actions) * weights.invalid_action;
        reward += f64::from(events.unnecessary_teardowns) * weights.unnecessary_teardown;
        reward += f64::from(events.failed_scale_outs) * weights.invalid_action;

        // Efficiency band and SLA, from current aggregates.
        let mut cpu_sum = 0.0;
        let mut observed = 0usize;
        let mut sla_violation = false;
        for vnf_type in &self.types {
            if let Some(agg) = self.history.latest_aggregates(*vnf_type) {
                cpu_sum += agg.cpu_percent;
                observed += 1;
                if agg.latency_ms > self.sla.latency_ms {
                    sla_violation = true;
                }
            }
        }
        let admitted = outcomes.satisfied + outcomes.dropped;
        let acceptance_ok = admitted == 0
            || outcomes.satisfied as f64 / admitted as f64 >= self.sla.acceptance_ratio;
        if sla_violation || !acceptance_ok {
            reward += weights.sla_violation;
        } else if observed > 0 && cpu_sum / (observed as f64 * 100.0) > 0.8 {
            reward += weights.efficiency_bonus;
        }
        reward
    }
}

/// Output of the blocking forecast pass.
#[derive(Default)]
struct ForecastPass {
    out_triggers: HashMap<VnfType, bool>,
    summaries: ForecastSummary,
    unavailable: HashSet<VnfType>,
}

fn forecast_pass(
    forecaster: &Forecaster,
    history: &MetricHistory,
    instruments: &Instruments,
    types: &[VnfType],
    thresholds: ScalingThresholds,
    confidence: f64,
) -> ForecastPass {
    let mut pass = ForecastPass::default();
    for vnf_type in types {
        let vnf_type = *vnf_type;
        let mut any_available = false;
        let mut triggered = false;
        for (metric, upper) in [
            (MetricKind::Cpu, thresholds.cpu.upper),
            (MetricKind::Memory, thresholds.memory.upper),
            (MetricKind::Latency, thresholds.latency.upper),
        ] {
            // Score the previous one-step prediction first.
            if let Some((_, actual)) = history.latest(vnf_type, metric) {
                if let Some(ape) = forecaster.record_outcome(vnf_type, metric, actual) {
                    instruments
                        .forecast_accuracy
                        .with_label_values(&[vnf_type.as_str(), metric.as_str()])
                        .observe(ape);
                }
            }
            match forecaster.forecast(vnf_type, metric) {
                Ok(forecast) => {
                    any_available = true;
                    if forecast.max_exceedance_probability(upper) >= confidence {
                        triggered = true;
                    }
                    if metric == MetricKind::Cpu {
                        let point = forecast.points.first().copied().unwrap_or(0.0);
                        let sigma = forecast.step_sigma.first().copied().unwrap_or(0.0);
                        pass.summaries.insert(vnf_type, (point, sigma));
                    }
                }
                Err(err) => {
                    debug!(%vnf_type, %metric, %err, "forecast unavailable");
                }
            }
        }
        pass.out_triggers.insert(vnf_type, triggered);
        if !any_available {
            pass.unavailable.insert(vnf_type);
        }
    }
    pass
}
