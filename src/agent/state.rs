//! State vector assembly
//!
//! Fixed-dimension layout, every entry clamped to [0, 1]:
//!
//! ```text
//! [ cpu/mem/bandwidth headroom      | 3       ]
//! [ per-type instance counts       | K       ]
//! [ pending requests by priority   | 10      ]
//! [ per-type cpu/mem/lat/thr       | 4K      ]
//! [ per-type cpu forecast + sigma  | 2K      ]
//! ```

use crate::metrics::series::MetricHistory;
use crate::vnf::{InstancePool, MetricKind, VnfType};
use std::collections::HashMap;

const LATENCY_SCALE: f64 = 2000.0;
const THROUGHPUT_SCALE: f64 = 1000.0;

/// Priority levels tracked for pending chain requests.
pub const PRIORITY_LEVELS: usize = 10;

/// Per-type forecast summary fed into the state: (point, sigma) for CPU.
pub type ForecastSummary = HashMap<VnfType, (f64, f64)>;

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Builds normalized state vectors for the agent.
#[derive(Debug, Clone)]
pub struct StateBuilder {
    types: Vec<VnfType>,
    max_instances: u32,
}

impl StateBuilder {
    /// Builder over the configured types.
    pub fn new(types: Vec<VnfType>, max_instances: u32) -> Self {
        Self {
            types,
            max_instances: max_instances.max(1),
        }
    }

    /// Dimension of every produced vector.
    pub fn dim(&self) -> usize {
        3 + self.types.len() * 7 + PRIORITY_LEVELS
    }

    /// Assemble the current state.
    pub fn build(
        &self,
        pool: &InstancePool,
        history: &MetricHistory,
        forecasts: &ForecastSummary,
        pending_by_priority: &[usize; PRIORITY_LEVELS],
    ) -> Vec<f64> {
        let k = self.types.len() as f64;
        let mut state = Vec::with_capacity(self.dim());

        // Data-center headroom, approximated from current aggregates.
        let mut cpu_sum = 0.0;
        let mut mem_sum = 0.0;
        let mut thr_sum = 0.0;
        for vnf_type in &self.types {
            if let Some(agg) = history.latest_aggregates(*vnf_type) {
                cpu_sum += agg.cpu_percent;
                mem_sum += agg.memory_percent;
                thr_sum += agg.throughput_rps;
            }
        }
        state.push(clamp01(1.0 - cpu_sum / (100.0 * k)));
        state.push(clamp01(1.0 - mem_sum / (100.0 * k)));
        state.push(clamp01(1.0 - thr_sum / (THROUGHPUT_SCALE * k)));

        // Instance counts.
        for vnf_type in &self.types {
            let count = pool.serving_count(*vnf_type);
            state.push(clamp01(f64::from(count) / f64::from(self.max_instances)));
        }

        // Pending chain requests by priority.
        for pending in pending_by_priority {
            state.push(clamp01(*pending as f64 / 32.0));
        }

        // Current aggregates.
        for vnf_type in &self.types {
            let agg = history.latest_aggregates(*vnf_type).unwrap_or_default();
            state.push(clamp01(agg.get(MetricKind::Cpu) / 100.0));
            state.push(clamp01(agg.get(MetricKind::Memory) / 100.0));
            state.push(clamp01(agg.get(MetricKind::Latency) / LATENCY_SCALE));
            state.push(clamp01(agg.get(MetricKind::Throughput) / THROUGHPUT_SCALE));
        }

        // Latest forecasts with their uncertainty; zeros when unavailable.
        for vnf_type in &self.types {
            let (point, sigma) = forecasts.get(vnf_type).copied().unwrap_or((0.0, 0.0));
            state.push(clamp01(point / 100.0));
            state.push(clamp01(sigma / 100.0));
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnf::PoolLimits;
    use chrono::Utc;

    #[test]
    fn dimension_is_stable_and_bounded() {
        let types = vec![VnfType::Firewall, VnfType::Mail];
        let builder = StateBuilder::new(types.clone(), 5);
        assert_eq!(builder.dim(), 3 + 14 + 10);

        let pool = InstancePool::new(PoolLimits { min: 1, max: 5 }, 8);
        let history = MetricHistory::new(20);
        let now = Utc::now();
        for metric in MetricKind::ALL {
            history.push(VnfType::Firewall, metric, now, 5000.0);
        }
        let state = builder.build(&pool, &history, &HashMap::new(), &[0; PRIORITY_LEVELS]);
        assert_eq!(state.len(), builder.dim());
        assert!(state.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
