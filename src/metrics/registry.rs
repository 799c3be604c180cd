//! Process-wide deduplicated metrics registry
//!
//! Thin ownership layer over a [`prometheus::Registry`]: every instrument is
//! created through [`MetricsRegistry::get_or_create`]-style calls so a second
//! registration with a compatible schema hands back the identical instrument,
//! while an incompatible one fails with a schema-mismatch error instead of
//! panicking. Exposition runs on a single background axum listener.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Registry errors. Registration failures are reported to the caller; the
/// registry itself never panics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Re-registration with a different kind or label set
    #[error("schema mismatch for metric {name}: {detail}")]
    SchemaMismatch {
        /// Instrument name
        name: String,
        /// What differed
        detail: String,
    },

    /// Underlying prometheus failure
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Binding the exposition listener failed
    #[error("metrics listener error: {0}")]
    Listener(#[from] std::io::Error),
}

#[derive(Clone)]
enum Instrument {
    Counter(IntCounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Instrument {
    fn kind(&self) -> &'static str {
        match self {
            Instrument::Counter(_) => "counter",
            Instrument::Gauge(_) => "gauge",
            Instrument::Histogram(_) => "histogram",
        }
    }
}

struct Entry {
    instrument: Instrument,
    labels: Vec<String>,
}

/// Deduplicating registry with a single exposition listener per process.
pub struct MetricsRegistry {
    registry: Registry,
    entries: Mutex<HashMap<String, Entry>>,
    listener_started: AtomicBool,
}

impl MetricsRegistry {
    /// Create a registry with the process collector attached.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;
        Ok(Self {
            registry,
            entries: Mutex::new(HashMap::new()),
            listener_started: AtomicBool::new(false),
        })
    }

    fn check_schema(
        entry: &Entry,
        name: &str,
        kind: &'static str,
        labels: &[&str],
    ) -> Result<(), MetricsError> {
        if entry.instrument.kind() != kind {
            return Err(MetricsError::SchemaMismatch {
                name: name.to_string(),
                detail: format!(
                    "registered as {}, requested as {kind}",
                    entry.instrument.kind()
                ),
            });
        }
        if entry.labels != labels {
            return Err(MetricsError::SchemaMismatch {
                name: name.to_string(),
                detail: format!(
                    "registered labels {:?}, requested {:?}",
                    entry.labels, labels
                ),
            });
        }
        Ok(())
    }

    fn mismatch(name: &str, entry: &Entry, requested: &'static str) -> MetricsError {
        MetricsError::SchemaMismatch {
            name: name.to_string(),
            detail: format!(
                "registered as {}, requested as {requested}",
                entry.instrument.kind()
            ),
        }
    }

    /// Get or create a counter family. Idempotent for a compatible schema.
    pub fn get_or_create_counter(
        &self,
        name: &str,
        labels: &[&str],
        help: &str,
    ) -> Result<IntCounterVec, MetricsError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            Self::check_schema(entry, name, "counter", labels)?;
            return match &entry.instrument {
                Instrument::Counter(counter) => Ok(counter.clone()),
                _ => Err(Self::mismatch(name, entry, "counter")),
            };
        }
        let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(counter.clone()))?;
        entries.insert(
            name.to_string(),
            Entry {
                instrument: Instrument::Counter(counter.clone()),
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        );
        Ok(counter)
    }

    /// Get or create a gauge family. Idempotent for a compatible schema.
    pub fn get_or_create_gauge(
        &self,
        name: &str,
        labels: &[&str],
        help: &str,
    ) -> Result<GaugeVec, MetricsError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            Self::check_schema(entry, name, "gauge", labels)?;
            return match &entry.instrument {
                Instrument::Gauge(gauge) => Ok(gauge.clone()),
                _ => Err(Self::mismatch(name, entry, "gauge")),
            };
        }
        let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(gauge.clone()))?;
        entries.insert(
            name.to_string(),
            Entry {
                instrument: Instrument::Gauge(gauge.clone()),
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        );
        Ok(gauge)
    }

    /// Get or create a histogram family with explicit buckets.
    pub fn get_or_create_histogram(
        &self,
        name: &str,
        labels: &[&str],
        help: &str,
        buckets: Vec<f64>,
    ) -> Result<HistogramVec, MetricsError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            Self::check_schema(entry, name, "histogram", labels)?;
            return match &entry.instrument {
                Instrument::Histogram(histogram) => Ok(histogram.clone()),
                _ => Err(Self::mismatch(name, entry, "histogram")),
            };
        }
        let histogram = HistogramVec::new(
            HistogramOpts::new(name, help).buckets(buckets),
            labels,
        )?;
        self.registry.register(Box::new(histogram.clone()))?;
        entries.insert(
            name.to_string(),
            Entry {
                instrument: Instrument::Histogram(histogram.clone()),
                labels: labels.iter().map(|l| l.to_string()).collect(),
            },
        );
        Ok(histogram)
    }

    /// Point-in-time text exposition of every instrument.
    pub fn render(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Start the background exposition listener. The first call binds and
    /// returns the bound address; later calls are a no-op returning `None`.
    pub async fn serve(
        self: &Arc<Self>,
        port: u16,
    ) -> Result<Option<SocketAddr>, MetricsError> {
        if self.listener_started.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(self));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "metrics exposition listening");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "metrics listener terminated");
            }
        });
        Ok(Some(addr))
    }
}

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    match registry.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// The orchestrator's instrument set, created once and shared by handle.
#[derive(Clone)]
pub struct Instruments {
    /// Instances per type
    pub vnf_instances_total: GaugeVec,
    /// Per-instance CPU percent
    pub vnf_cpu_usage: GaugeVec,
    /// Per-instance memory percent
    pub vnf_memory_usage: GaugeVec,
    /// Per-instance processing latency, ms
    pub vnf_processing_latency: HistogramVec,
    /// Scale actions by type and action ("out"/"in"/"failed")
    pub scaling_actions_total: IntCounterVec,
    /// Absolute percentage error of realized forecasts
    pub forecast_accuracy: HistogramVec,
    /// Chain requests by outcome ("satisfied"/"dropped")
    pub sfc_requests_total: IntCounterVec,
    /// Reward accumulated over the last finished episode
    pub drl_episode_reward: GaugeVec,
    /// 1 while the orchestrator is in safe mode
    pub safe_mode: GaugeVec,
    /// 1 while a component's external calls keep failing
    pub component_unhealthy: GaugeVec,
}

impl Instruments {
    /// Register (or re-acquire) the full instrument set.
    pub fn register(registry: &MetricsRegistry) -> Result<Self, MetricsError> {
        let latency_buckets = vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
        ];
        let accuracy_buckets = vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0];
        Ok(Self {
            vnf_instances_total: registry.get_or_create_gauge(
                "vnf_instances_total",
                &["vnf_type"],
                "Instances currently serving or starting, per VNF type",
            )?,
            vnf_cpu_usage: registry.get_or_create_gauge(
                "vnf_cpu_usage",
                &["vnf_type", "instance_id"],
                "Last-scraped CPU utilization percent",
            )?,
            vnf_memory_usage: registry.get_or_create_gauge(
                "vnf_memory_usage",
                &["vnf_type", "instance_id"],
                "Last-scraped memory utilization percent",
            )?,
            vnf_processing_latency: registry.get_or_create_histogram(
                "vnf_processing_latency",
                &["vnf_type", "instance_id"],
                "Per-instance processing latency in milliseconds",
                latency_buckets,
            )?,
            scaling_actions_total: registry.get_or_create_counter(
                "scaling_actions_total",
                &["vnf_type", "action"],
                "Scale actions taken, by type and action",
            )?,
            forecast_accuracy: registry.get_or_create_histogram(
                "forecast_accuracy",
                &["vnf_type", "metric"],
                "Absolute percentage error of realized forecasts",
                accuracy_buckets,
            )?,
            sfc_requests_total: registry.get_or_create_counter(
                "sfc_requests_total",
                &["outcome"],
                "Chain requests by outcome",
            )?,
            drl_episode_reward: registry.get_or_create_gauge(
                "drl_episode_reward",
                &[],
                "Reward accumulated over the last finished episode",
            )?,
            safe_mode: registry.get_or_create_gauge(
                "sfcflow_safe_mode",
                &[],
                "1 while chain admission is suspended after detected corruption",
            )?,
            component_unhealthy: registry.get_or_create_gauge(
                "sfcflow_component_unhealthy",
                &["component"],
                "1 while a component's external calls keep failing",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let registry = MetricsRegistry::new().unwrap();
        let first = registry
            .get_or_create_counter("a", &["type"], "test counter")
            .unwrap();
        let before = registry.render().unwrap();
        let second = registry
            .get_or_create_counter("a", &["type"], "test counter")
            .unwrap();
        first.with_label_values(&["x"]).inc_by(3);
        // Both handles observe the same underlying series.
        assert_eq!(second.with_label_values(&["x"]).get(), 3);
        let after = registry.render().unwrap();
        // Re-registration added no families.
        assert_eq!(
            before.lines().filter(|l| l.starts_with("# TYPE")).count(),
            after.lines().filter(|l| l.starts_with("# TYPE")).count()
        );
    }

    #[test]
    fn kind_mismatch_is_schema_error() {
        let registry = MetricsRegistry::new().unwrap();
        registry
            .get_or_create_counter("a", &["type"], "test")
            .unwrap();
        let err = registry
            .get_or_create_gauge("a", &["type"], "test")
            .unwrap_err();
        assert!(matches!(err, MetricsError::SchemaMismatch { .. }));
    }

    #[test]
    fn label_mismatch_is_schema_error() {
        let registry = MetricsRegistry::new().unwrap();
        registry
            .get_or_create_counter("a", &["type"], "test")
            .unwrap();
        let err = registry
            .get_or_create_counter("a", &["type", "zone"], "test")
            .unwrap_err();
        assert!(matches!(err, MetricsError::SchemaMismatch { .. }));
    }

    #[test]
    fn exposition_lists_each_series_once() {
        let registry = MetricsRegistry::new().unwrap();
        let counter = registry
            .get_or_create_counter("a", &["type"], "test counter")
            .unwrap();
        counter.with_label_values(&["x"]).inc_by(3);
        counter.with_label_values(&["y"]).inc_by(3);
        let body = registry.render().unwrap();
        let series: Vec<&str> = body
            .lines()
            .filter(|l| l.starts_with("a{"))
            .collect();
        assert_eq!(series.len(), 2);
        assert!(series.iter().all(|l| l.ends_with(" 3")));
    }

    #[test]
    fn full_instrument_set_registers_twice() {
        let registry = MetricsRegistry::new().unwrap();
        Instruments::register(&registry).unwrap();
        // A second component acquiring the same set must succeed.
        Instruments::register(&registry).unwrap();
    }
}
