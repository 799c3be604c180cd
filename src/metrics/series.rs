//! Bounded per-(type, metric) sample history
//!
//! The scraper appends one aggregated sample per scrape round; the
//! forecaster and scaling controller read windows from here. Samples carry
//! wall timestamps and must arrive in order; an out-of-order sample is
//! dropped rather than corrupting the series.

use crate::vnf::{MetricKind, VnfType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Latest aggregated values for one VNF type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregates {
    /// Mean CPU percent across healthy instances
    pub cpu_percent: f64,
    /// Mean memory percent
    pub memory_percent: f64,
    /// Mean latency, ms
    pub latency_ms: f64,
    /// Summed throughput, req/s
    pub throughput_rps: f64,
}

impl Aggregates {
    /// Value for one metric kind.
    pub fn get(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::Cpu => self.cpu_percent,
            MetricKind::Memory => self.memory_percent,
            MetricKind::Latency => self.latency_ms,
            MetricKind::Throughput => self.throughput_rps,
        }
    }
}

#[derive(Default)]
struct Series {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    pushed: u64,
}

/// Ring buffers of aggregated samples, window W per series.
pub struct MetricHistory {
    window: usize,
    inner: RwLock<HashMap<(VnfType, MetricKind), Series>>,
}

impl MetricHistory {
    /// Create a history with window `window` per series.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Configured window length W.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Append one sample; drops the oldest beyond W and rejects
    /// non-monotonic timestamps.
    pub fn push(&self, vnf_type: VnfType, metric: MetricKind, at: DateTime<Utc>, value: f64) {
        let mut inner = self.inner.write();
        let series = inner.entry((vnf_type, metric)).or_default();
        if let Some((last, _)) = series.samples.back() {
            if at <= *last {
                warn!(%vnf_type, %metric, "dropping non-monotonic sample");
                return;
            }
        }
        series.samples.push_back((at, value));
        series.pushed += 1;
        while series.samples.len() > self.window {
            series.samples.pop_front();
        }
    }

    /// Values of one series, oldest first.
    pub fn values(&self, vnf_type: VnfType, metric: MetricKind) -> Vec<f64> {
        self.inner
            .read()
            .get(&(vnf_type, metric))
            .map(|series| series.samples.iter().map(|(_, v)| *v).collect())
            .unwrap_or_default()
    }

    /// Number of samples currently held for one series.
    pub fn len(&self, vnf_type: VnfType, metric: MetricKind) -> usize {
        self.inner
            .read()
            .get(&(vnf_type, metric))
            .map(|series| series.samples.len())
            .unwrap_or(0)
    }

    /// Whether a series holds no samples yet.
    pub fn is_empty(&self, vnf_type: VnfType, metric: MetricKind) -> bool {
        self.len(vnf_type, metric) == 0
    }

    /// Monotonic count of samples ever accepted into one series.
    pub fn total_pushed(&self, vnf_type: VnfType, metric: MetricKind) -> u64 {
        self.inner
            .read()
            .get(&(vnf_type, metric))
            .map(|series| series.pushed)
            .unwrap_or(0)
    }

    /// Latest sample of one series.
    pub fn latest(&self, vnf_type: VnfType, metric: MetricKind) -> Option<(DateTime<Utc>, f64)> {
        self.inner
            .read()
            .get(&(vnf_type, metric))
            .and_then(|series| series.samples.back().copied())
    }

    /// Latest values across all four metrics of one type, if every series
    /// has at least one sample.
    pub fn latest_aggregates(&self, vnf_type: VnfType) -> Option<Aggregates> {
        let inner = self.inner.read();
        let fetch = |metric: MetricKind| {
            inner
                .get(&(vnf_type, metric))
                .and_then(|series| series.samples.back())
                .map(|(_, v)| *v)
        };
        Some(Aggregates {
            cpu_percent: fetch(MetricKind::Cpu)?,
            memory_percent: fetch(MetricKind::Memory)?,
            latency_ms: fetch(MetricKind::Latency)?,
            throughput_rps: fetch(MetricKind::Throughput)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn window_is_bounded() {
        let history = MetricHistory::new(3);
        let start = Utc::now();
        for i in 0..5 {
            history.push(
                VnfType::Firewall,
                MetricKind::Cpu,
                start + Duration::seconds(i),
                i as f64,
            );
        }
        assert_eq!(history.values(VnfType::Firewall, MetricKind::Cpu), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn non_monotonic_samples_dropped() {
        let history = MetricHistory::new(10);
        let start = Utc::now();
        history.push(VnfType::Mail, MetricKind::Latency, start, 10.0);
        history.push(VnfType::Mail, MetricKind::Latency, start - Duration::seconds(1), 99.0);
        history.push(VnfType::Mail, MetricKind::Latency, start, 99.0);
        assert_eq!(history.values(VnfType::Mail, MetricKind::Latency), vec![10.0]);
    }

    #[test]
    fn aggregates_need_all_series() {
        let history = MetricHistory::new(10);
        let now = Utc::now();
        history.push(VnfType::Mail, MetricKind::Cpu, now, 50.0);
        assert!(history.latest_aggregates(VnfType::Mail).is_none());
        history.push(VnfType::Mail, MetricKind::Memory, now, 40.0);
        history.push(VnfType::Mail, MetricKind::Latency, now, 5.0);
        history.push(VnfType::Mail, MetricKind::Throughput, now, 100.0);
        let agg = history.latest_aggregates(VnfType::Mail).unwrap();
        assert_eq!(agg.get(MetricKind::Cpu), 50.0);
        assert_eq!(agg.get(MetricKind::Throughput), 100.0);
    }
}
