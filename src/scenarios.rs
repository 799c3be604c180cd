//! Built-in end-to-end scenarios
//!
//! The `test1`/`test2`/`test3` subcommands run these against the simulated
//! container runtime with shortened timers. Each returns a report instead
//! of asserting, so the CLI can distinguish partial failure (exit 3) from
//! a runtime error (exit 2).

use crate::chain::ChainRequest;
use crate::config::OrchestratorConfig;
use crate::driver::SimContainerApi;
use crate::orchestrator::Orchestrator;
use crate::vnf::{HealthState, MetricKind, VnfType};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outcome of one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: &'static str,
    /// Whether every check held
    pub passed: bool,
    /// Human-readable detail
    pub detail: String,
}

impl ScenarioReport {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

fn scenario_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.min_instances = 1;
    config.max_instances = 3;
    config.rolling_update.health_check_timeout = 2;
    config.rolling_update.drain_timeout = 0;
    config.rolling_update.grace_period = 0;
    config.control_loop.cooldown = 1;
    config.drl_config.model_path = std::env::temp_dir().join("sfcflow-scenario.ckpt");
    config
}

fn seed_series(orchestrator: &Orchestrator, vnf_type: VnfType, cpu: &[f64]) {
    let history = orchestrator.history();
    let start = Utc::now() - ChronoDuration::seconds(cpu.len() as i64);
    for (i, value) in cpu.iter().enumerate() {
        let at = start + ChronoDuration::seconds(i as i64);
        history.push(vnf_type, MetricKind::Cpu, at, *value);
        history.push(vnf_type, MetricKind::Memory, at, 50.0);
        history.push(vnf_type, MetricKind::Latency, at, 100.0);
        history.push(vnf_type, MetricKind::Throughput, at, 40.0);
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(what, "condition never held");
    false
}

/// Scenario: a CPU ramp must produce a confident forecast and a proactive
/// scale-out that leaves both instances carrying active flow rules.
pub async fn proactive_scale_out() -> Result<ScenarioReport> {
    const NAME: &str = "proactive-scale-out";
    let mut config = scenario_config();
    config.vnf_types = vec![VnfType::Firewall];
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api)?;
    orchestrator.bootstrap().await?;

    let mut series = vec![30.0; 15];
    series.extend([42.0, 54.0, 66.0, 78.0, 90.0]);
    seed_series(&orchestrator, VnfType::Firewall, &series);

    let forecast = orchestrator
        .forecaster()
        .forecast(VnfType::Firewall, MetricKind::Cpu)?;
    let point = forecast.points.last().copied().unwrap_or(0.0);
    let lower = forecast.lower.last().copied().unwrap_or(0.0);
    if point <= 80.0 || lower <= 70.0 {
        return Ok(ScenarioReport::fail(
            NAME,
            format!("forecast point {point:.1} / lower {lower:.1} not above 80/70"),
        ));
    }

    orchestrator.scaler().tick().await;
    let pool = Arc::clone(orchestrator.pool());
    let out_counter = orchestrator
        .instruments()
        .scaling_actions_total
        .with_label_values(&["firewall", "out"]);
    let scaled = wait_for("completed firewall scale-out", || out_counter.get() == 1).await;
    if !scaled {
        return Ok(ScenarioReport::fail(NAME, "scale-out never completed"));
    }
    if pool.active_count(VnfType::Firewall) != 2 {
        return Ok(ScenarioReport::fail(
            NAME,
            format!(
                "active count {} after scale-out, want 2",
                pool.active_count(VnfType::Firewall)
            ),
        ));
    }
    let instances = pool.list(VnfType::Firewall);
    let all_ruled = instances.iter().all(|i| {
        i.state == HealthState::Active && orchestrator.flow().instance_has_rules(i.id)
    });
    if !all_ruled {
        return Ok(ScenarioReport::fail(
            NAME,
            "an instance is missing its flow rule after scale-out",
        ));
    }
    Ok(ScenarioReport::pass(
        NAME,
        format!("forecast {point:.1} (lower {lower:.1}), scaled 1 -> 2"),
    ))
}

/// Scenario: with one spamfilter instance carrying an active chain and
/// idle metrics, the controller must refuse to drain the last instance.
pub async fn safe_scale_in_blocked() -> Result<ScenarioReport> {
    const NAME: &str = "safe-scale-in-blocked";
    let mut config = scenario_config();
    config.vnf_types = vec![VnfType::SpamFilter];
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api)?;
    orchestrator.bootstrap().await?;

    let chained = orchestrator
        .pool()
        .list(VnfType::SpamFilter)
        .first()
        .map(|i| i.id)
        .ok_or_else(|| anyhow::anyhow!("no spamfilter instance"))?;
    orchestrator
        .allocator()
        .allocate(ChainRequest::new(vec![VnfType::SpamFilter], 5))?;

    // Everything far below the scale-in thresholds.
    seed_series(&orchestrator, VnfType::SpamFilter, &[10.0; 20]);
    let history = orchestrator.history();
    let now = Utc::now();
    history.push(VnfType::SpamFilter, MetricKind::Memory, now, 10.0);
    history.push(VnfType::SpamFilter, MetricKind::Latency, now, 20.0);

    for _ in 0..3 {
        orchestrator.scaler().tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let in_count = orchestrator
        .instruments()
        .scaling_actions_total
        .with_label_values(&["spamfilter", "in"])
        .get();
    let survivor = orchestrator
        .pool()
        .get(chained)
        .map(|i| i.state == HealthState::Active)
        .unwrap_or(false);
    if in_count != 0 || !survivor {
        return Ok(ScenarioReport::fail(
            NAME,
            format!("scale-in count {in_count}, chained instance active: {survivor}"),
        ));
    }
    Ok(ScenarioReport::pass(NAME, "last chained instance protected"))
}

/// Scenario: a flow conflict on the second hop must roll the whole
/// allocation back, leaving no chain rules and untouched reservations.
pub async fn allocation_rollback() -> Result<ScenarioReport> {
    const NAME: &str = "allocation-rollback";
    let mut config = scenario_config();
    config.vnf_types = vec![VnfType::Firewall, VnfType::Encryption, VnfType::SpamFilter];
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api)?;
    orchestrator.bootstrap().await?;

    let pool = orchestrator.pool();
    let encryption = pool
        .list(VnfType::Encryption)
        .first()
        .map(|i| i.id)
        .ok_or_else(|| anyhow::anyhow!("no encryption instance"))?;
    // The allocator derives hop priorities 5000, 5001, 5002 for the first
    // priority-5 request; colliding with the second hop forces the 409 path.
    orchestrator
        .flow()
        .add_rule(VnfType::Encryption, encryption, 5001, None)?;

    let reservations_of = |pool: &crate::vnf::InstancePool| {
        let mut counts: Vec<(crate::InstanceId, u32)> = pool
            .snapshot()
            .iter()
            .map(|i| (i.id, pool.reservation_count(i.id)))
            .collect();
        counts.sort();
        counts
    };
    let reservations_before = reservations_of(pool);

    let request = ChainRequest::new(
        vec![VnfType::Firewall, VnfType::Encryption, VnfType::SpamFilter],
        5,
    );
    let outcome = orchestrator.allocator().allocate(request);
    if outcome.is_ok() {
        return Ok(ScenarioReport::fail(NAME, "allocation unexpectedly succeeded"));
    }

    let chain_tagged = orchestrator
        .flow()
        .list_rules(None)
        .iter()
        .filter(|r| r.chain_id.is_some())
        .count();
    let reservations_after = reservations_of(pool);
    if chain_tagged != 0 {
        return Ok(ScenarioReport::fail(
            NAME,
            format!("{chain_tagged} chain-tagged rules survived the rollback"),
        ));
    }
    if reservations_before != reservations_after {
        return Ok(ScenarioReport::fail(NAME, "reservation counters changed"));
    }
    Ok(ScenarioReport::pass(NAME, "failed allocation left no trace"))
}

/// Run every scenario, in order.
pub async fn run_all() -> Result<Vec<ScenarioReport>> {
    Ok(vec![
        proactive_scale_out().await?,
        safe_scale_in_blocked().await?,
        allocation_rollback().await?,
    ])
}
