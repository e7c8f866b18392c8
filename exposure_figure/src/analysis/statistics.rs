//! Agreement statistics between predicted and observed concentrations.
//!
//! Correlation is computed on complete pairs only. NMB and NRMSE take each
//! mean over its own non-missing elements, so a gap in one column drops that
//! row's difference without discarding the rest of the observed column. The
//! IQR is a plain percentile and still turns `NaN` on a gap in the
//! observations.

use polars::prelude::*;
use statrs::statistics::Statistics;
use tracing::{debug, error};

use crate::models::StatsTriple;

/// Percentile with linear interpolation between closest ranks
/// (numpy's default method). `NaN` for empty input or input containing `NaN`.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() || values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    if frac == 0.0 {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Pearson correlation over positions where neither value is `NaN`.
pub fn masked_correlation(observed: &[f64], predicted: &[f64]) -> f64 {
    let (obs, pred): (Vec<f64>, Vec<f64>) = observed
        .iter()
        .zip(predicted)
        .filter(|(o, p)| !o.is_nan() && !p.is_nan())
        .map(|(&o, &p)| (o, p))
        .unzip();

    if obs.len() < 2 {
        return f64::NAN;
    }

    let mean_obs = obs.iter().mean();
    let mean_pred = pred.iter().mean();

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (o, p) in obs.iter().zip(&pred) {
        let dx = o - mean_obs;
        let dy = p - mean_pred;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }

    // zero variance gives 0/0 = NaN, which is what we want
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

fn skip_nan(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| !v.is_nan())
}

fn differences<'a>(observed: &'a [f64], predicted: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
    observed
        .iter()
        .zip(predicted)
        .map(|(o, p)| p - o)
        .filter(|d| !d.is_nan())
}

/// mean(predicted − observed) / mean(observed) × 100, each mean taken over
/// its non-missing elements.
pub fn normalized_mean_bias(observed: &[f64], predicted: &[f64]) -> f64 {
    let bias = differences(observed, predicted).mean();
    bias / skip_nan(observed).mean() * 100.0
}

/// RMSE over the non-missing differences, scaled by the interquartile range
/// of the observations, in percent.
pub fn normalized_rmse(observed: &[f64], predicted: &[f64]) -> f64 {
    let mse = differences(observed, predicted).map(|d| d.powi(2)).mean();
    let iqr = percentile(observed, 75.0) - percentile(observed, 25.0);
    mse.sqrt() / iqr * 100.0
}

/// Upper axis limit shared by both axes of a panel: the larger of the two
/// 99.5th percentiles. A `NaN` observed percentile wins, a `NaN` predicted
/// one falls back to the observed side.
pub fn max_lim(observed: &[f64], predicted: &[f64]) -> f64 {
    let obs = percentile(observed, 99.5);
    let pred = percentile(predicted, 99.5);
    if pred > obs {
        pred
    } else {
        obs
    }
}

pub fn compute_stats(observed: &[f64], predicted: &[f64]) -> PolarsResult<StatsTriple> {
    if observed.len() != predicted.len() {
        error!(
            "Mismatch in data lengths - observed {}, predicted {}",
            observed.len(),
            predicted.len()
        );
        return Err(PolarsError::ShapeMismatch(
            format!(
                "observed has {} values but predicted has {}",
                observed.len(),
                predicted.len()
            )
            .into(),
        ));
    }

    let valid_pairs = observed
        .iter()
        .zip(predicted)
        .filter(|(o, p)| !o.is_nan() && !p.is_nan())
        .count();

    let stats = StatsTriple {
        correlation: masked_correlation(observed, predicted),
        nmb: normalized_mean_bias(observed, predicted),
        nrmse: normalized_rmse(observed, predicted),
        n: observed.len(),
        valid_pairs,
    };
    debug!("{:?}", stats);
    Ok(stats)
}

/// Two-decimal rendering used in the panel annotations; non-finite values
/// print as `nan`, `inf` and `-inf`.
pub fn format_stat(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == f64::INFINITY {
        "inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn identical_series_have_no_bias_or_error() {
        let mut rng = StdRng::seed_from_u64(7);
        let x: Vec<f64> = (0..500).map(|_| rng.gen_range(0.0..80.0)).collect();

        assert_eq!(normalized_mean_bias(&x, &x), 0.0);
        assert_eq!(normalized_rmse(&x, &x), 0.0);
    }

    #[test]
    fn self_correlation_is_one() {
        let x = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        assert!((masked_correlation(&x, &x) - 1.0).abs() < EPS);

        let two = [1.0, 2.0];
        assert!((masked_correlation(&two, &two) - 1.0).abs() < EPS);
    }

    #[test]
    fn nmb_worked_example() {
        let observed = [10.0, 20.0, 30.0, 40.0];
        let predicted = [12.0, 18.0, 33.0, 38.0];
        assert!((normalized_mean_bias(&observed, &predicted) - 1.0).abs() < EPS);
    }

    #[test]
    fn nrmse_worked_example() {
        let observed = [10.0, 20.0, 30.0, 40.0];
        let predicted = [12.0, 18.0, 33.0, 38.0];
        // rmse = sqrt((4 + 4 + 9 + 4) / 4), iqr = 32.5 - 17.5
        let expected = (21.0f64 / 4.0).sqrt() / 15.0 * 100.0;
        assert!((normalized_rmse(&observed, &predicted) - expected).abs() < EPS);
    }

    #[test]
    fn nan_pairs_do_not_move_the_correlation() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 3.0).collect();
        let clean = masked_correlation(&x, &y);

        let mut x_nan = x.clone();
        let mut y_nan = y.clone();
        x_nan.insert(5, f64::NAN);
        y_nan.insert(5, f64::NAN);
        x_nan.push(100.0);
        y_nan.push(f64::NAN);

        assert!((clean - 1.0).abs() < EPS);
        assert!((masked_correlation(&x_nan, &y_nan) - clean).abs() < EPS);
    }

    #[test]
    fn too_few_pairs_give_nan_correlation() {
        assert!(masked_correlation(&[], &[]).is_nan());
        assert!(masked_correlation(&[1.0], &[2.0]).is_nan());
        assert!(masked_correlation(&[1.0, f64::NAN], &[2.0, 3.0]).is_nan());
        // constant series
        assert!(masked_correlation(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_nan());
    }

    #[test]
    fn missing_prediction_only_drops_its_row() {
        let observed = [10.0, 20.0, 30.0, 40.0];
        let predicted = [12.0, 18.0, f64::NAN, 38.0];

        let stats = compute_stats(&observed, &predicted).unwrap();
        // differences 2, -2, -2 over an observed mean of 25
        assert!((stats.nmb - (-2.0 / 3.0 / 25.0 * 100.0)).abs() < EPS);
        // rmse 2 over an IQR of 15
        assert!((stats.nrmse - 2.0 / 15.0 * 100.0).abs() < EPS);
        assert_eq!(stats.valid_pairs, 3);
        assert_eq!(stats.n, 4);
        assert!(stats.correlation.is_finite());
    }

    #[test]
    fn missing_observation_keeps_nmb_but_not_the_iqr() {
        let observed = [10.0, 20.0, f64::NAN, 40.0];
        let predicted = [12.0, 18.0, 33.0, 38.0];

        // mean difference -2/3 over an observed mean of 70/3
        let expected = (-2.0 / 3.0) / (70.0 / 3.0) * 100.0;
        assert!((normalized_mean_bias(&observed, &predicted) - expected).abs() < EPS);
        assert!((expected - (-2.857142857)).abs() < 1e-6);
        assert!(normalized_rmse(&observed, &predicted).is_nan());
    }

    #[test]
    fn degenerate_denominators() {
        // zero mean observation
        let nmb = normalized_mean_bias(&[-1.0, 1.0], &[0.0, 2.0]);
        assert!(nmb.is_infinite());
        // zero IQR
        assert_eq!(normalized_rmse(&[5.0, 5.0, 5.0], &[6.0, 6.0, 6.0]), f64::INFINITY);
        assert!(normalized_rmse(&[5.0, 5.0], &[5.0, 5.0]).is_nan());
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [40.0, 10.0, 30.0, 20.0];
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 40.0);
        assert_eq!(percentile(&values, 25.0), 17.5);
        assert_eq!(percentile(&values, 75.0), 32.5);
        assert_eq!(percentile(&values, 50.0), 25.0);
        assert!(percentile(&[], 50.0).is_nan());
        assert!(percentile(&[1.0, f64::NAN], 50.0).is_nan());
    }

    #[test]
    fn max_lim_takes_the_larger_percentile() {
        let observed: Vec<f64> = (1..=200).map(f64::from).collect();
        let predicted: Vec<f64> = observed.iter().map(|v| v * 0.5).collect();

        // rank 0.995 * 199 = 198.005 between 199 and 200
        let expected = 199.0 + 0.005;
        assert!((percentile(&observed, 99.5) - expected).abs() < 1e-9);
        assert!((max_lim(&observed, &predicted) - expected).abs() < 1e-9);
        assert!((max_lim(&predicted, &observed) - expected).abs() < 1e-9);
    }

    #[test]
    fn max_lim_only_falls_back_from_the_predicted_side() {
        let clean = [1.0, 2.0, 3.0];
        let gappy = [1.0, f64::NAN, 3.0];
        assert!(max_lim(&gappy, &clean).is_nan());
        assert!((max_lim(&clean, &gappy) - percentile(&clean, 99.5)).abs() < EPS);
        assert!(max_lim(&gappy, &gappy).is_nan());
    }

    #[test]
    fn unequal_lengths_are_rejected() {
        assert!(compute_stats(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn stat_formatting() {
        assert_eq!(format_stat(0.876), "0.88");
        assert_eq!(format_stat(-12.346), "-12.35");
        assert_eq!(format_stat(f64::NAN), "nan");
        assert_eq!(format_stat(f64::INFINITY), "inf");
        assert_eq!(format_stat(f64::NEG_INFINITY), "-inf");
    }
}
