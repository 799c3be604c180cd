//! End-to-end scenario coverage against the simulated container runtime

use sfcflow::chain::ChainRequest;
use sfcflow::config::OrchestratorConfig;
use sfcflow::driver::SimContainerApi;
use sfcflow::scaling::ScalePhase;
use sfcflow::scenarios;
use sfcflow::vnf::{HealthState, MetricKind, VnfType};
use sfcflow::Orchestrator;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

fn fast_config(types: Vec<VnfType>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.vnf_types = types;
    config.min_instances = 1;
    config.max_instances = 3;
    config.rolling_update.health_check_timeout = 2;
    config.rolling_update.drain_timeout = 0;
    config.rolling_update.grace_period = 0;
    config.control_loop.cooldown = 60;
    config.drl_config.model_path = std::env::temp_dir().join("sfcflow-test-agent.ckpt");
    config
}

fn seed_flat(orchestrator: &Orchestrator, vnf_type: VnfType, cpu: f64, count: usize) {
    let history = orchestrator.history();
    let start = Utc::now() - ChronoDuration::seconds(count as i64);
    for i in 0..count {
        let at = start + ChronoDuration::seconds(i as i64);
        history.push(vnf_type, MetricKind::Cpu, at, cpu);
        history.push(vnf_type, MetricKind::Memory, at, 50.0);
        history.push(vnf_type, MetricKind::Latency, at, 100.0);
        history.push(vnf_type, MetricKind::Throughput, at, 40.0);
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn scenario_proactive_scale_out() {
    let report = scenarios::proactive_scale_out().await.unwrap();
    assert!(report.passed, "{}", report.detail);
}

#[tokio::test]
async fn scenario_safe_scale_in_blocked() {
    let report = scenarios::safe_scale_in_blocked().await.unwrap();
    assert!(report.passed, "{}", report.detail);
}

#[tokio::test]
async fn scenario_allocation_rollback() {
    let report = scenarios::allocation_rollback().await.unwrap();
    assert!(report.passed, "{}", report.detail);
}

#[tokio::test]
async fn cooldown_suppresses_back_to_back_scaling() {
    let config = fast_config(vec![VnfType::Firewall]);
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api).unwrap();
    orchestrator.bootstrap().await.unwrap();

    // Saturated CPU both by threshold and by (constant-series) forecast.
    seed_flat(&orchestrator, VnfType::Firewall, 95.0, 20);
    let out_counter = orchestrator
        .instruments()
        .scaling_actions_total
        .with_label_values(&["firewall", "out"]);

    orchestrator.scaler().tick().await;
    assert!(wait_until(|| out_counter.get() == 1).await, "first scale-out");
    assert!(
        wait_until(|| orchestrator.scaler().phase(VnfType::Firewall) == ScalePhase::Cooldown)
            .await,
        "type must enter cooldown after the action"
    );

    // Load still high on the next tick, but the cooldown gate must hold.
    let history = orchestrator.history();
    let now = Utc::now() + ChronoDuration::seconds(5);
    for metric in MetricKind::ALL {
        history.push(VnfType::Firewall, metric, now, 95.0);
    }
    orchestrator.scaler().tick().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(out_counter.get(), 1, "cooldown must suppress the second action");
    assert_eq!(orchestrator.pool().active_count(VnfType::Firewall), 2);
}

#[tokio::test]
async fn thresholds_alone_drive_scaling_when_forecast_unavailable() {
    let config = fast_config(vec![VnfType::Firewall]);
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api).unwrap();
    orchestrator.bootstrap().await.unwrap();

    // Five samples is far below the window, so no model can be fitted;
    // the 90% CPU reading must still trigger a threshold scale-out.
    seed_flat(&orchestrator, VnfType::Firewall, 90.0, 5);
    assert!(orchestrator
        .forecaster()
        .forecast(VnfType::Firewall, MetricKind::Cpu)
        .is_err());

    let out_counter = orchestrator
        .instruments()
        .scaling_actions_total
        .with_label_values(&["firewall", "out"]);
    orchestrator.scaler().tick().await;
    assert!(wait_until(|| out_counter.get() == 1).await, "threshold scale-out");
}

#[tokio::test]
async fn flow_rules_only_reference_live_instances() {
    let config = fast_config(vec![VnfType::Firewall, VnfType::Mail]);
    let api = Arc::new(SimContainerApi::new(Duration::from_millis(10)));
    let orchestrator = Orchestrator::new(config, api).unwrap();
    orchestrator.bootstrap().await.unwrap();

    orchestrator
        .allocator()
        .allocate(ChainRequest::new(vec![VnfType::Firewall, VnfType::Mail], 5))
        .unwrap();
    orchestrator
        .scaler()
        .scale_out(VnfType::Firewall)
        .await
        .unwrap();
    orchestrator
        .scaler()
        .scale_in(VnfType::Firewall)
        .await
        .unwrap();

    for rule in orchestrator.flow().list_rules(None) {
        let instance = orchestrator
            .pool()
            .get(rule.instance_id)
            .expect("rule references a purged instance");
        assert!(
            matches!(
                instance.state,
                HealthState::Active | HealthState::Draining
            ),
            "rule {} references instance in state {}",
            rule.flow_id,
            instance.state
        );
    }
}
