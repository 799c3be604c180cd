//! Linearized seasonal ARIMA
//!
//! The model on the differenced series w is additive in seasonal terms:
//!
//! ```text
//! w_t = c + sum phi_i w_{t-i} + sum PHI_j w_{t-js}
//!         + e_t + sum theta_i e_{t-i} + sum THETA_j e_{t-js}
//! ```
//!
//! fitted by the Hannan-Rissanen two-stage least squares: a long AR
//! regression estimates the innovations, then the ARMA regression includes
//! the lagged innovations as regressors. Forecasting composes the AR and
//! differencing polynomials so the recursion runs directly on the original
//! scale, and step-ahead variance follows from the psi-weight expansion.

use crate::config::ForecastingConfig;
use crate::forecast::stationarity::{acf, adf_is_stationary, detect_season, difference,
    seasonal_difference};
use crate::forecast::ForecastError;
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, trace};

/// Orders of a fitted model: (p, d, q)(P, D, Q)_s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarimaOrder {
    /// Non-seasonal AR order
    pub p: usize,
    /// Non-seasonal differencing
    pub d: usize,
    /// Non-seasonal MA order
    pub q: usize,
    /// Seasonal AR order
    pub sp: usize,
    /// Seasonal differencing
    pub sd: usize,
    /// Seasonal MA order
    pub sq: usize,
    /// Seasonal period; 0 means non-seasonal
    pub season: usize,
}

impl SarimaOrder {
    /// Tie-break key: total number of ARMA terms.
    pub fn complexity(&self) -> usize {
        self.p + self.q + self.sp + self.sq
    }
}

#[derive(Debug, Clone)]
struct ArmaFit {
    intercept: f64,
    ar: Vec<f64>,
    sar: Vec<f64>,
    ma: Vec<f64>,
    sma: Vec<f64>,
    sigma2: f64,
    aic: f64,
    lb_pvalue: f64,
}

/// Point predictions plus per-step standard deviations.
#[derive(Debug, Clone)]
pub struct ForecastBands {
    /// Point predictions for steps 1..=h
    pub points: Vec<f64>,
    /// Per-step forecast standard deviation
    pub sigmas: Vec<f64>,
}

/// A fitted seasonal ARIMA model.
#[derive(Debug, Clone)]
pub struct SarimaModel {
    /// Selected order
    pub order: SarimaOrder,
    fit: ArmaFit,
}

impl SarimaModel {
    /// Residual variance of the fit.
    pub fn sigma2(&self) -> f64 {
        self.fit.sigma2
    }

    /// Akaike information criterion of the fit.
    pub fn aic(&self) -> f64 {
        self.fit.aic
    }

    /// Ljung-Box p-value of the fit residuals.
    pub fn ljung_box_pvalue(&self) -> f64 {
        self.fit.lb_pvalue
    }

    /// Combined AR polynomial including differencing, coefficients pi_0..pi_m
    /// with pi_0 = 1.
    fn full_ar_poly(&self) -> Vec<f64> {
        let s = self.order.season;
        let mut arpoly = vec![0.0; 1 + self.order.p.max(self.order.sp * s)];
        arpoly[0] = 1.0;
        for (i, phi) in self.fit.ar.iter().enumerate() {
            arpoly[i + 1] -= phi;
        }
        for (j, sphi) in self.fit.sar.iter().enumerate() {
            arpoly[(j + 1) * s] -= sphi;
        }
        let mut diff = vec![1.0];
        for _ in 0..self.order.d {
            diff = convolve(&diff, &[1.0, -1.0]);
        }
        if self.order.sd > 0 && s > 0 {
            let mut sdiff = vec![0.0; s + 1];
            sdiff[0] = 1.0;
            sdiff[s] = -1.0;
            for _ in 0..self.order.sd {
                diff = convolve(&diff, &sdiff);
            }
        }
        convolve(&arpoly, &diff)
    }

    /// Combined MA polynomial, coefficients theta_0..theta_m with
    /// theta_0 = 1.
    fn full_ma_poly(&self) -> Vec<f64> {
        let s = self.order.season;
        let mut mapoly = vec![0.0; 1 + self.order.q.max(self.order.sq * s)];
        mapoly[0] = 1.0;
        for (i, theta) in self.fit.ma.iter().enumerate() {
            mapoly[i + 1] += theta;
        }
        for (j, stheta) in self.fit.sma.iter().enumerate() {
            mapoly[(j + 1) * s] += stheta;
        }
        mapoly
    }

    /// Forecast `horizon` steps beyond the end of `series` (original scale).
    pub fn forecast(&self, series: &[f64], horizon: usize) -> Result<ForecastBands, ForecastError> {
        let pi = self.full_ar_poly();
        let theta = self.full_ma_poly();
        let warm = pi.len().max(theta.len()) - 1;
        let n = series.len();
        if n <= warm {
            return Err(ForecastError::FitFailed);
        }

        // In-sample innovations via the level recursion, zero-primed.
        let mut residuals = vec![0.0; n];
        for t in warm..n {
            let mut pred = self.fit.intercept;
            for (i, coeff) in pi.iter().enumerate().skip(1) {
                pred -= coeff * series[t - i];
            }
            for (j, coeff) in theta.iter().enumerate().skip(1) {
                pred += coeff * residuals[t - j];
            }
            residuals[t] = series[t] - pred;
        }

        // Point forecasts: future innovations are zero.
        let mut extended: Vec<f64> = series.to_vec();
        let mut ext_resid = residuals;
        let mut points = Vec::with_capacity(horizon);
        for step in 0..horizon {
            let t = n + step;
            let mut pred = self.fit.intercept;
            for (i, coeff) in pi.iter().enumerate().skip(1) {
                if i <= t {
                    pred -= coeff * extended[t - i];
                }
            }
            for (j, coeff) in theta.iter().enumerate().skip(1) {
                if j <= t {
                    pred += coeff * ext_resid[t - j];
                }
            }
            if !pred.is_finite() {
                return Err(ForecastError::FitFailed);
            }
            extended.push(pred);
            ext_resid.push(0.0);
            points.push(pred);
        }

        // Psi-weight expansion for step-ahead error propagation.
        let mut psi = vec![1.0];
        for j in 1..horizon {
            let mut value = theta.get(j).copied().unwrap_or(0.0);
            for i in 1..=j.min(pi.len() - 1) {
                value -= pi[i] * psi[j - i];
            }
            psi.push(value);
        }
        let mut cumulative = 0.0;
        let mut sigmas = Vec::with_capacity(horizon);
        for weight in psi.iter().take(horizon) {
            cumulative += weight * weight;
            sigmas.push((self.fit.sigma2 * cumulative).sqrt());
        }

        Ok(ForecastBands { points, sigmas })
    }
}

fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Ljung-Box portmanteau p-value on residual independence.
fn ljung_box_pvalue(residuals: &[f64], fitted_params: usize) -> f64 {
    let n = residuals.len();
    if n < 6 {
        return 1.0;
    }
    let lags = (n / 2).min(8).max(1);
    let r = acf(residuals, lags);
    let mut q = 0.0;
    for k in 1..=lags {
        q += r[k] * r[k] / (n - k) as f64;
    }
    q *= n as f64 * (n as f64 + 2.0);
    let dof = lags.saturating_sub(fitted_params).max(1);
    match ChiSquared::new(dof as f64) {
        Ok(chi2) => 1.0 - chi2.cdf(q),
        Err(_) => 0.0,
    }
}

/// Hannan-Rissanen fit of the additive ARMA on a differenced series.
fn fit_arma(
    w: &[f64],
    p: usize,
    q: usize,
    sp: usize,
    sq: usize,
    season: usize,
) -> Option<ArmaFit> {
    let n = w.len();
    let s = season;

    // Stage 1: long AR regression for innovation estimates.
    let long_order = (n / 3).clamp(1, 6);
    let mut innovations = vec![0.0; n];
    if n > long_order + 2 {
        let rows = n - long_order;
        let mut x = DMatrix::zeros(rows, long_order + 1);
        let mut target = DVector::zeros(rows);
        for t in long_order..n {
            let row = t - long_order;
            x[(row, 0)] = 1.0;
            for i in 1..=long_order {
                x[(row, i)] = w[t - i];
            }
            target[row] = w[t];
        }
        if let Ok(beta) = x.clone().svd(true, true).solve(&target, 1e-10) {
            for t in long_order..n {
                let mut pred = beta[0];
                for i in 1..=long_order {
                    pred += beta[i] * w[t - i];
                }
                innovations[t] = w[t] - pred;
            }
        }
    }

    // Stage 2: ARMA regression with lagged innovations as regressors.
    let t0 = [p, q, sp * s, sq * s].into_iter().max().unwrap_or(0).max(1);
    let k = 1 + p + sp + q + sq;
    if n <= t0 + k + 2 {
        return None;
    }
    let rows = n - t0;
    let mut x = DMatrix::zeros(rows, k);
    let mut target = DVector::zeros(rows);
    for t in t0..n {
        let row = t - t0;
        let mut col = 0;
        x[(row, col)] = 1.0;
        col += 1;
        for i in 1..=p {
            x[(row, col)] = w[t - i];
            col += 1;
        }
        for j in 1..=sp {
            x[(row, col)] = w[t - j * s];
            col += 1;
        }
        for i in 1..=q {
            x[(row, col)] = innovations[t - i];
            col += 1;
        }
        for j in 1..=sq {
            x[(row, col)] = innovations[t - j * s];
            col += 1;
        }
        target[row] = w[t];
    }
    let beta = x.clone().svd(true, true).solve(&target, 1e-10).ok()?;
    let fitted = &x * &beta;
    let resid_vec = &target - fitted;
    if beta.iter().any(|b| !b.is_finite()) {
        return None;
    }

    let sigma2 = (resid_vec.dot(&resid_vec) / rows as f64).max(1e-12);
    let aic = rows as f64 * sigma2.ln() + 2.0 * (k as f64 + 1.0);
    let residuals: Vec<f64> = resid_vec.iter().copied().collect();
    let lb_pvalue = ljung_box_pvalue(&residuals, p + q + sp + sq);

    let mut col = 1;
    let take = |col: &mut usize, count: usize| -> Vec<f64> {
        let out: Vec<f64> = (0..count).map(|i| beta[*col + i]).collect();
        *col += count;
        out
    };
    let ar = take(&mut col, p);
    let sar = take(&mut col, sp);
    let ma = take(&mut col, q);
    let sma = take(&mut col, sq);

    Some(ArmaFit {
        intercept: beta[0],
        ar,
        sar,
        ma,
        sma,
        sigma2,
        aic,
        lb_pvalue,
    })
}

/// AIC ties closer than this prefer the simpler order.
const AIC_TIE_EPSILON: f64 = 0.01;

/// Full training pipeline on one series: difference to stationarity,
/// estimate the seasonal period, grid-search the order, pick the best fit
/// passing the Ljung-Box gate.
pub fn train(series: &[f64], config: &ForecastingConfig) -> Result<SarimaModel, ForecastError> {
    let n = series.len();
    if n < config.window_size {
        return Err(ForecastError::InsufficientData {
            have: n,
            need: config.window_size,
        });
    }

    // Non-seasonal differencing until ADF accepts stationarity.
    let mut work = series.to_vec();
    let mut d = 0;
    while !adf_is_stationary(&work) {
        if d == config.max_differencing {
            return Err(ForecastError::NonStationary);
        }
        work = difference(&work);
        d += 1;
    }

    // Seasonal period from the ACF of the stationary series.
    let max_period = (config.window_size / 2).max(2);
    let season = detect_season(&work, max_period).unwrap_or(0);
    let sd = usize::from(season > 0);
    let seasonal_work = if season > 0 {
        seasonal_difference(&work, season)
    } else {
        work.clone()
    };
    if seasonal_work.len() < 6 {
        return Err(ForecastError::FitFailed);
    }

    // Order grid search.
    let mut candidates: Vec<SarimaModel> = Vec::new();
    let seasonal_orders: &[(usize, usize)] = if season > 0 {
        &[(0, 0), (0, 1), (1, 0), (1, 1)]
    } else {
        &[(0, 0)]
    };
    for p in 0..=config.max_p {
        for q in 0..=config.max_q {
            for &(sp, sq) in seasonal_orders {
                let Some(fit) = fit_arma(&seasonal_work, p, q, sp, sq, season) else {
                    continue;
                };
                trace!(p, q, sp, sq, aic = fit.aic, lb = fit.lb_pvalue, "candidate fit");
                candidates.push(SarimaModel {
                    order: SarimaOrder {
                        p,
                        d,
                        q,
                        sp,
                        sd: if season > 0 { sd } else { 0 },
                        sq,
                        season,
                    },
                    fit,
                });
            }
        }
    }

    let passing: Vec<&SarimaModel> = candidates
        .iter()
        .filter(|m| m.fit.lb_pvalue > 0.05)
        .collect();
    if passing.is_empty() {
        return Err(ForecastError::FitFailed);
    }
    let best_aic = passing
        .iter()
        .map(|m| m.fit.aic)
        .fold(f64::INFINITY, f64::min);
    let chosen = passing
        .iter()
        .filter(|m| m.fit.aic - best_aic <= AIC_TIE_EPSILON)
        .min_by_key(|m| m.order.complexity())
        .ok_or(ForecastError::FitFailed)?;

    debug!(
        order = ?chosen.order,
        aic = chosen.fit.aic,
        sigma2 = chosen.fit.sigma2,
        "model selected"
    );
    Ok((*chosen).clone())
}
