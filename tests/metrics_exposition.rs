//! Exposition determinism and listener lifecycle

use sfcflow::metrics::{Instruments, MetricsRegistry};
use std::sync::Arc;

#[test]
fn exposition_lists_each_labeled_series_once() {
    let registry = MetricsRegistry::new().unwrap();
    let counter = registry
        .get_or_create_counter("a", &["type"], "scenario counter")
        .unwrap();
    counter.with_label_values(&["x"]).inc_by(3);
    counter.with_label_values(&["y"]).inc_by(3);

    let body = registry.render().unwrap();
    let series: Vec<&str> = body.lines().filter(|l| l.starts_with("a{")).collect();
    assert_eq!(series.len(), 2, "exactly two time series for `a`:\n{body}");
    assert!(series.iter().all(|l| l.ends_with(" 3")));

    #[cfg(target_os = "linux")]
    assert!(
        body.contains("process_start_time_seconds"),
        "process start gauge missing"
    );
}

#[test]
fn re_registration_does_not_change_exposition() {
    let registry = MetricsRegistry::new().unwrap();
    let counter = registry
        .get_or_create_counter("a", &["type"], "scenario counter")
        .unwrap();
    counter.with_label_values(&["x"]).inc_by(3);
    let before = registry.render().unwrap();
    for _ in 0..5 {
        registry
            .get_or_create_counter("a", &["type"], "scenario counter")
            .unwrap();
    }
    assert_eq!(before, registry.render().unwrap());
}

#[test]
fn full_instrument_set_is_idempotent() {
    let registry = MetricsRegistry::new().unwrap();
    let first = Instruments::register(&registry).unwrap();
    let second = Instruments::register(&registry).unwrap();
    first
        .scaling_actions_total
        .with_label_values(&["firewall", "out"])
        .inc();
    assert_eq!(
        second
            .scaling_actions_total
            .with_label_values(&["firewall", "out"])
            .get(),
        1
    );
}

#[tokio::test]
async fn second_listener_start_is_a_noop() {
    let registry = Arc::new(MetricsRegistry::new().unwrap());
    let first = registry.serve(0).await.unwrap();
    assert!(first.is_some());
    let second = registry.serve(0).await.unwrap();
    assert!(second.is_none());
}
