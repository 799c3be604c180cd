//! Forecast interval calibration on a stationary Gaussian series

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use sfcflow::config::ForecastingConfig;
use sfcflow::forecast::sarima;
use statrs::distribution::{ContinuousCDF, Normal as StatNormal};

#[test]
fn empirical_coverage_matches_nominal_level() {
    let config = ForecastingConfig::default();
    let window = config.window_size;
    let mut rng = StdRng::seed_from_u64(20240817);
    let noise = Normal::new(50.0, 2.0).unwrap();
    let series: Vec<f64> = (0..340).map(|_| noise.sample(&mut rng)).collect();
    let z = StatNormal::new(0.0, 1.0).unwrap().inverse_cdf(0.975);

    let mut trials = 0usize;
    let mut covered = 0usize;
    for start in 0..(series.len() - window - 1) {
        let train_window = &series[start..start + window];
        let actual = series[start + window];
        let Ok(model) = sarima::train(train_window, &config) else {
            continue;
        };
        let Ok(bands) = model.forecast(train_window, 1) else {
            continue;
        };
        let point = bands.points[0];
        let sigma = bands.sigmas[0];
        trials += 1;
        if actual >= point - z * sigma && actual <= point + z * sigma {
            covered += 1;
        }
    }

    assert!(trials > 200, "only {trials} usable windows");
    let coverage = covered as f64 / trials as f64;
    assert!(
        (0.90..=0.99).contains(&coverage),
        "coverage {coverage:.3} outside [0.90, 0.99] over {trials} trials"
    );
}
