//! Noise level estimation, synthetic noise and distribution overlap.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::error::{DeerError, DeerResult, ensure_finite};

/// How the noise standard deviation of a signal is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoiseEstimator {
    /// Standard deviation of first differences divided by √2.
    ///
    /// Acts as a high-pass filter; the slow dipolar modulation contributes
    /// little to consecutive differences of a densely sampled signal.
    #[default]
    Derivative,
    /// Standard deviation of the signal minus its centred moving mean.
    MovingAverage { window: usize },
}

/// Estimate the noise standard deviation of `v`.
pub fn noise_level(v: &[f64], estimator: NoiseEstimator) -> DeerResult<f64> {
    ensure_finite("signal", v)?;
    match estimator {
        NoiseEstimator::Derivative => {
            if v.len() < 3 {
                return Err(DeerError::invalid(
                    "derivative noise estimate needs at least 3 points",
                ));
            }
            let diffs: Vec<f64> = v.windows(2).map(|w| w[1] - w[0]).collect();
            Ok(std_dev(&diffs) / std::f64::consts::SQRT_2)
        }
        NoiseEstimator::MovingAverage { window } => {
            if window < 2 || window > v.len() {
                return Err(DeerError::invalid(format!(
                    "moving-average window {window} must be in [2, {}]",
                    v.len()
                )));
            }
            let smooth = moving_mean(v, window);
            let resid: Vec<f64> = v.iter().zip(&smooth).map(|(a, b)| a - b).collect();
            let w = window as f64;
            // Subtracting a mean over `w` samples removes 1/w of the variance.
            Ok(std_dev(&resid) * (w / (w - 1.0)).sqrt())
        }
    }
}

/// Centred moving mean; the window shrinks near the ends.
fn moving_mean(v: &[f64], window: usize) -> Vec<f64> {
    let before = (window - 1) / 2;
    let after = window - 1 - before;
    (0..v.len())
        .map(|i| {
            let lo = i.saturating_sub(before);
            let hi = (i + after).min(v.len() - 1);
            v[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
        })
        .collect()
}

/// Population standard deviation.
pub(crate) fn std_dev(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Reproducible white Gaussian noise with standard deviation `std`.
pub fn white_gaussian_noise(n: usize, std: f64, seed: u64) -> DeerResult<Vec<f64>> {
    if !(std.is_finite() && std >= 0.0) {
        return Err(DeerError::invalid(format!(
            "noise std must be finite and non-negative, got {std}"
        )));
    }
    let normal = Normal::new(0.0, std)
        .map_err(|e| DeerError::invalid(format!("noise distribution error: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..n).map(|_| normal.sample(&mut rng)).collect())
}

/// Overlap of two distributions after normalising each to unit sum:
/// `Σ min(P1, P2)`, 1 for identical shapes and 0 for disjoint ones.
pub fn overlap(p1: &[f64], p2: &[f64]) -> DeerResult<f64> {
    ensure_finite("p1", p1)?;
    ensure_finite("p2", p2)?;
    crate::error::ensure_len("p2", p2.len(), p1.len())?;
    let s1: f64 = p1.iter().sum();
    let s2: f64 = p2.iter().sum();
    if s1 == 0.0 || s2 == 0.0 {
        return Err(DeerError::invalid("cannot compute overlap of a zero distribution"));
    }
    Ok(p1
        .iter()
        .zip(p2)
        .map(|(a, b)| (a / s1).min(b / s2))
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivative_estimate_recovers_white_noise_level() {
        let noise = white_gaussian_noise(20_000, 0.05, 7).unwrap();
        let signal: Vec<f64> = noise
            .iter()
            .enumerate()
            .map(|(i, e)| (-(i as f64) / 20_000.0).exp() + e)
            .collect();
        let sigma = noise_level(&signal, NoiseEstimator::Derivative).unwrap();
        assert!((sigma - 0.05).abs() < 0.002, "got {sigma}");
    }

    #[test]
    fn moving_average_estimate_recovers_white_noise_level() {
        let noise = white_gaussian_noise(20_000, 0.1, 11).unwrap();
        let sigma = noise_level(&noise, NoiseEstimator::MovingAverage { window: 9 }).unwrap();
        assert!((sigma - 0.1).abs() < 0.004, "got {sigma}");
    }

    #[test]
    fn noise_is_reproducible_per_seed() {
        let a = white_gaussian_noise(16, 1.0, 3).unwrap();
        let b = white_gaussian_noise(16, 1.0, 3).unwrap();
        let c = white_gaussian_noise(16, 1.0, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(white_gaussian_noise(4, -1.0, 0).is_err());
        assert!(white_gaussian_noise(4, f64::NAN, 0).is_err());
        assert!(white_gaussian_noise(4, f64::INFINITY, 0).is_err());
        assert_eq!(white_gaussian_noise(3, 0.0, 0).unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn overlap_bounds() {
        let p = [0.0, 1.0, 2.0, 1.0, 0.0];
        let q = [0.0, 2.0, 4.0, 2.0, 0.0];
        let disjoint = [1.0, 0.0, 0.0, 0.0, 1.0];
        assert!((overlap(&p, &q).unwrap() - 1.0).abs() < 1e-15);
        assert_eq!(overlap(&p, &disjoint).unwrap(), 0.0);
        assert!(overlap(&p, &[0.0; 5]).is_err());
    }

    #[test]
    fn rejects_bad_windows() {
        for window in [1, 4] {
            let estimator = NoiseEstimator::MovingAverage { window };
            assert!(noise_level(&[1.0, 2.0, 3.0], estimator).is_err());
        }
        assert!(noise_level(&[1.0, 2.0], NoiseEstimator::Derivative).is_err());
    }
}
