//! Per-(VNF, metric) load forecasting
//!
//! Seasonal ARIMA with adaptive order selection. The recurrence is
//! linearized (additive seasonal terms) and fitted by two-stage least
//! squares, which keeps the fit cheap enough to rerun on every retrain
//! trigger while still producing calibrated confidence bands.

pub mod engine;
pub mod sarima;
pub mod stationarity;

pub use engine::Forecaster;
pub use sarima::{SarimaModel, SarimaOrder};

use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

/// Why no forecast is available. Callers must fall back to current
/// observations; none of these is an error at the control loop.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Fewer samples than the configured window
    #[error("no forecast available: {have} samples, need {need}")]
    InsufficientData {
        /// Samples on hand
        have: usize,
        /// Window length W
        need: usize,
    },

    /// Still non-stationary after maximum differencing
    #[error("no forecast available: series non-stationary after maximum differencing")]
    NonStationary,

    /// Every candidate order failed to fit or failed diagnostics
    #[error("no forecast available: model fit failed")]
    FitFailed,
}

/// An h-step forecast with confidence bounds.
#[derive(Debug, Clone)]
pub struct Forecast {
    /// Point predictions for steps 1..=h
    pub points: Vec<f64>,
    /// Lower bounds at the configured confidence level
    pub lower: Vec<f64>,
    /// Upper bounds at the configured confidence level
    pub upper: Vec<f64>,
    /// Per-step forecast standard deviation
    pub step_sigma: Vec<f64>,
    /// Confidence level of the bounds
    pub confidence_level: f64,
}

impl Forecast {
    /// Probability that the value at `step` (0-based) exceeds `threshold`,
    /// under the forecast's normal error model.
    pub fn exceedance_probability(&self, step: usize, threshold: f64) -> f64 {
        let (Some(point), Some(sigma)) = (self.points.get(step), self.step_sigma.get(step))
        else {
            return 0.0;
        };
        if *sigma <= f64::EPSILON {
            return if *point > threshold { 1.0 } else { 0.0 };
        }
        match Normal::new(*point, *sigma) {
            Ok(normal) => 1.0 - normal.cdf(threshold),
            Err(_) => 0.0,
        }
    }

    /// Highest exceedance probability across the whole horizon.
    pub fn max_exceedance_probability(&self, threshold: f64) -> f64 {
        (0..self.points.len())
            .map(|step| self.exceedance_probability(step, threshold))
            .fold(0.0, f64::max)
    }
}

/// Two-sided normal quantile for a confidence level (e.g. 0.95 -> 1.96).
pub(crate) fn normal_quantile(confidence_level: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(0.5 + confidence_level / 2.0),
        Err(_) => 1.96,
    }
}
