//! Differencing, autocorrelation, and stationarity testing

use nalgebra::{DMatrix, DVector};

/// First difference: w_t = y_t - y_{t-1}.
pub fn difference(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Seasonal difference at period `s`: w_t = y_t - y_{t-s}.
pub fn seasonal_difference(series: &[f64], s: usize) -> Vec<f64> {
    if series.len() <= s {
        return Vec::new();
    }
    (s..series.len()).map(|t| series[t] - series[t - s]).collect()
}

/// Sample autocorrelations r_0..r_max_lag (r_0 = 1).
pub fn acf(series: &[f64], max_lag: usize) -> Vec<f64> {
    let n = series.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = series.iter().sum::<f64>() / n as f64;
    let var: f64 = series.iter().map(|y| (y - mean).powi(2)).sum();
    let mut out = Vec::with_capacity(max_lag + 1);
    for k in 0..=max_lag.min(n.saturating_sub(1)) {
        if var <= f64::EPSILON {
            out.push(if k == 0 { 1.0 } else { 0.0 });
            continue;
        }
        let cov: f64 = (0..n - k)
            .map(|t| (series[t] - mean) * (series[t + k] - mean))
            .sum();
        out.push(cov / var);
    }
    out
}

/// Asymptotic 5% critical value of the ADF t-statistic with a constant term.
const ADF_CRITICAL_5PCT: f64 = -2.86;

/// Augmented Dickey-Fuller test with one lagged difference:
/// dy_t = c + gamma * y_{t-1} + phi * dy_{t-1} + e_t.
/// Returns true when the unit-root hypothesis is rejected at 5%.
pub fn adf_is_stationary(series: &[f64]) -> bool {
    let n = series.len();
    if n < 8 {
        // Too short to regress; let the fit diagnostics decide instead.
        return true;
    }
    let dy = difference(series);
    let rows = dy.len() - 1;
    let mut x = DMatrix::zeros(rows, 3);
    let mut target = DVector::zeros(rows);
    for t in 1..dy.len() {
        let row = t - 1;
        x[(row, 0)] = 1.0;
        x[(row, 1)] = series[t];
        x[(row, 2)] = dy[t - 1];
        target[row] = dy[t];
    }
    let xtx = x.transpose() * &x;
    let xty = x.transpose() * &target;
    let Some(xtx_inv) = xtx.try_inverse() else {
        // Singular design happens for (near-)constant series.
        return true;
    };
    let beta = &xtx_inv * xty;
    let fitted = &x * &beta;
    let resid = &target - fitted;
    let dof = rows.saturating_sub(3).max(1) as f64;
    let sigma2 = resid.dot(&resid) / dof;
    let se = (sigma2 * xtx_inv[(1, 1)]).sqrt();
    if se <= f64::EPSILON {
        return true;
    }
    let t_stat = beta[1] / se;
    t_stat < ADF_CRITICAL_5PCT
}

/// Estimate the seasonal period from the autocorrelation function: the
/// largest significant local ACF peak in [2, max_period], or `None` when no
/// peak clears the 2/sqrt(n) significance band.
pub fn detect_season(series: &[f64], max_period: usize) -> Option<usize> {
    let n = series.len();
    if n < 6 || max_period < 2 {
        return None;
    }
    let r = acf(series, max_period + 1);
    let significance = 2.0 / (n as f64).sqrt();
    let mut best: Option<(usize, f64)> = None;
    for lag in 2..=max_period.min(r.len().saturating_sub(2)) {
        let here = r[lag];
        if here <= significance {
            continue;
        }
        let is_peak = here > r[lag - 1] && here >= r[lag + 1];
        if !is_peak {
            continue;
        }
        if best.map(|(_, v)| here > v).unwrap_or(true) {
            best = Some((lag, here));
        }
    }
    best.map(|(lag, _)| lag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differencing_shortens_by_one() {
        assert_eq!(difference(&[1.0, 3.0, 6.0]), vec![2.0, 3.0]);
        assert_eq!(seasonal_difference(&[1.0, 2.0, 4.0, 8.0], 2), vec![3.0, 6.0]);
    }

    #[test]
    fn acf_of_white_noise_decays() {
        // Fixed pseudo-noise; lag-0 is 1 and higher lags stay small.
        let noise: Vec<f64> = (0..64)
            .map(|i| ((i * 37 + 11) % 23) as f64 - 11.0)
            .collect();
        let r = acf(&noise, 5);
        assert!((r[0] - 1.0).abs() < 1e-12);
        assert!(r[1].abs() < 0.5);
    }

    #[test]
    fn random_walk_not_stationary_but_noise_is() {
        let mut walk = vec![0.0f64];
        for i in 1..40 {
            let step = if (i * 31 + 7) % 5 < 3 { 1.0 } else { -1.0 };
            walk.push(walk[i - 1] + step + 0.4);
        }
        assert!(!adf_is_stationary(&walk));

        let noise: Vec<f64> = (0..40)
            .map(|i| ((i * 37 + 11) % 23) as f64 - 11.0)
            .collect();
        assert!(adf_is_stationary(&noise));
    }

    #[test]
    fn seasonality_detected_on_sine() {
        let series: Vec<f64> = (0..40)
            .map(|i| (i as f64 * std::f64::consts::TAU / 8.0).sin() * 10.0)
            .collect();
        assert_eq!(detect_season(&series, 10), Some(8));
    }

    #[test]
    fn no_season_on_trendless_noise() {
        let noise: Vec<f64> = (0..40)
            .map(|i| ((i * 53 + 29) % 17) as f64 - 8.0)
            .collect();
        assert_eq!(detect_season(&noise, 10), None);
    }
}
