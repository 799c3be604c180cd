//! Forecasting engine: model cache and retraining policy
//!
//! One fitted model per (VNF type, metric). A model is retrained once
//! `window_size / 4` new samples have arrived since its last fit, or sooner
//! when the rolling absolute percentage error of realized one-step
//! predictions exceeds the configured level. Fit failures invalidate the
//! slot so the next call retries from scratch.

use crate::config::ForecastingConfig;
use crate::forecast::sarima::{self, SarimaModel};
use crate::forecast::{normal_quantile, Forecast, ForecastError};
use crate::metrics::series::MetricHistory;
use crate::vnf::{MetricKind, VnfType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

const ERROR_WINDOW: usize = 8;

struct ModelSlot {
    model: SarimaModel,
    trained_at: DateTime<Utc>,
    pushed_at_train: u64,
    recent_ape: VecDeque<f64>,
    last_one_step: Option<f64>,
}

/// Per-(VNF, metric) forecaster over the shared metric history.
pub struct Forecaster {
    config: ForecastingConfig,
    history: Arc<MetricHistory>,
    slots: Mutex<HashMap<(VnfType, MetricKind), ModelSlot>>,
}

impl Forecaster {
    /// Build a forecaster over `history`.
    pub fn new(config: ForecastingConfig, history: Arc<MetricHistory>) -> Self {
        Self {
            config,
            history,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Configured settings.
    pub fn config(&self) -> &ForecastingConfig {
        &self.config
    }

    /// Produce an h-step forecast for one series, training or retraining
    /// the underlying model as needed. CPU-heavy; callers on the control
    /// loop should wrap this in a blocking task.
    pub fn forecast(
        &self,
        vnf_type: VnfType,
        metric: MetricKind,
    ) -> Result<Forecast, ForecastError> {
        let series = self.history.values(vnf_type, metric);
        if series.len() < self.config.window_size {
            return Err(ForecastError::InsufficientData {
                have: series.len(),
                need: self.config.window_size,
            });
        }

        // An identically constant series needs no model at all.
        let first = series[0];
        if series.iter().all(|v| (*v - first).abs() < 1e-9) {
            let h = self.config.forecast_steps;
            return Ok(Forecast {
                points: vec![first; h],
                lower: vec![first; h],
                upper: vec![first; h],
                step_sigma: vec![0.0; h],
                confidence_level: self.config.confidence_level,
            });
        }

        let pushed = self.history.total_pushed(vnf_type, metric);
        let mut slots = self.slots.lock();
        let key = (vnf_type, metric);
        let needs_fit = match slots.get(&key) {
            None => true,
            Some(slot) => {
                let new_samples = pushed.saturating_sub(slot.pushed_at_train);
                new_samples >= self.config.retrain_every() as u64
                    || self.drifted(slot)
            }
        };
        if needs_fit {
            match sarima::train(&series, &self.config) {
                Ok(model) => {
                    debug!(%vnf_type, %metric, order = ?model.order, "model trained");
                    let previous = slots.remove(&key);
                    slots.insert(
                        key,
                        ModelSlot {
                            model,
                            trained_at: Utc::now(),
                            pushed_at_train: pushed,
                            recent_ape: previous
                                .map(|p| p.recent_ape)
                                .unwrap_or_default(),
                            last_one_step: None,
                        },
                    );
                }
                Err(err) => {
                    slots.remove(&key);
                    return Err(err);
                }
            }
        }

        let slot = slots.get_mut(&key).ok_or(ForecastError::FitFailed)?;
        let bands = match slot.model.forecast(&series, self.config.forecast_steps) {
            Ok(bands) => bands,
            Err(err) => {
                // A model that cannot forecast is invalid; drop it.
                slots.remove(&key);
                return Err(err);
            }
        };
        slot.last_one_step = bands.points.first().copied();

        let z = normal_quantile(self.config.confidence_level);
        let lower = bands
            .points
            .iter()
            .zip(&bands.sigmas)
            .map(|(point, sigma)| point - z * sigma)
            .collect();
        let upper = bands
            .points
            .iter()
            .zip(&bands.sigmas)
            .map(|(point, sigma)| point + z * sigma)
            .collect();
        Ok(Forecast {
            points: bands.points,
            lower,
            upper,
            step_sigma: bands.sigmas,
            confidence_level: self.config.confidence_level,
        })
    }

    /// Record the realized value against the last one-step prediction.
    /// Returns the absolute percentage error when one was pending.
    pub fn record_outcome(
        &self,
        vnf_type: VnfType,
        metric: MetricKind,
        actual: f64,
    ) -> Option<f64> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&(vnf_type, metric))?;
        let predicted = slot.last_one_step.take()?;
        let ape = if actual.abs() > f64::EPSILON {
            ((actual - predicted) / actual).abs() * 100.0
        } else {
            predicted.abs() * 100.0
        };
        slot.recent_ape.push_back(ape);
        while slot.recent_ape.len() > ERROR_WINDOW {
            slot.recent_ape.pop_front();
        }
        Some(ape)
    }

    /// Age of the current model for one series, if any.
    pub fn trained_at(&self, vnf_type: VnfType, metric: MetricKind) -> Option<DateTime<Utc>> {
        self.slots
            .lock()
            .get(&(vnf_type, metric))
            .map(|slot| slot.trained_at)
    }

    fn drifted(&self, slot: &ModelSlot) -> bool {
        if slot.recent_ape.len() < ERROR_WINDOW / 2 {
            return false;
        }
        let mape = slot.recent_ape.iter().sum::<f64>() / slot.recent_ape.len() as f64;
        if mape > self.config.retrain_mape {
            warn!(mape, "forecast drift detected, forcing retrain");
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seeded_history(values: &[f64]) -> Arc<MetricHistory> {
        let history = Arc::new(MetricHistory::new(20));
        let start = Utc::now() - Duration::seconds(values.len() as i64);
        for (i, value) in values.iter().enumerate() {
            history.push(
                VnfType::Firewall,
                MetricKind::Cpu,
                start + Duration::seconds(i as i64),
                *value,
            );
        }
        history
    }

    #[test]
    fn short_series_is_unavailable() {
        let history = seeded_history(&[30.0, 31.0, 29.0, 30.0, 30.0]);
        let forecaster = Forecaster::new(ForecastingConfig::default(), history);
        let err = forecaster
            .forecast(VnfType::Firewall, MetricKind::Cpu)
            .unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientData { .. }));
    }

    #[test]
    fn constant_series_has_zero_width_bounds() {
        let history = seeded_history(&[42.0; 20]);
        let forecaster = Forecaster::new(ForecastingConfig::default(), history);
        let forecast = forecaster
            .forecast(VnfType::Firewall, MetricKind::Cpu)
            .unwrap();
        assert_eq!(forecast.points, vec![42.0; 3]);
        assert_eq!(forecast.lower, forecast.upper);
        assert!(forecast.exceedance_probability(0, 41.0) > 0.99);
        assert_eq!(forecast.exceedance_probability(0, 43.0), 0.0);
    }

    #[test]
    fn ramp_triggers_high_exceedance() {
        let mut values = vec![30.0; 15];
        values.extend([42.0, 54.0, 66.0, 78.0, 90.0]);
        let history = seeded_history(&values);
        let forecaster = Forecaster::new(ForecastingConfig::default(), history);
        let forecast = forecaster
            .forecast(VnfType::Firewall, MetricKind::Cpu)
            .unwrap();
        assert!(forecast.max_exceedance_probability(80.0) >= 0.7);
        assert!(forecast.points.last().copied().unwrap() > 80.0);
    }

    #[test]
    fn outcome_tracking_reports_ape() {
        let values: Vec<f64> = (0..20)
            .map(|i| 50.0 + ((i * 37 + 11) % 7) as f64 - 3.0)
            .collect();
        let history = seeded_history(&values);
        let forecaster = Forecaster::new(ForecastingConfig::default(), history);
        forecaster
            .forecast(VnfType::Firewall, MetricKind::Cpu)
            .unwrap();
        let ape = forecaster
            .record_outcome(VnfType::Firewall, MetricKind::Cpu, 50.0)
            .unwrap();
        assert!(ape < 50.0);
        // The pending prediction is consumed.
        assert!(forecaster
            .record_outcome(VnfType::Firewall, MetricKind::Cpu, 50.0)
            .is_none());
    }
}
