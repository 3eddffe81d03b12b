//! Bootstrap uncertainty analysis.
//!
//! Synthetic signals are generated around a fitted signal, re-analysed by a
//! caller-supplied closure, and the spread of the outputs summarised per
//! component. Each sample owns an RNG seeded from `(seed, index)`, so results
//! do not depend on the thread schedule.

use log::debug;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::uncertainty::noise::std_dev;

/// How synthetic signals are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// Draw residuals with replacement.
    #[default]
    Residual,
    /// Add white Gaussian noise with the residuals' standard deviation.
    Gaussian,
}

/// Per-component summary of bootstrap outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    /// Raw outputs, one row per sample in sample order.
    pub samples: Vec<Vec<f64>>,
}

impl BootstrapSummary {
    /// Per-component percentile (`q` in `[0, 100]`), linearly interpolated.
    pub fn percentile(&self, q: f64) -> DeerResult<Vec<f64>> {
        if !(0.0..=100.0).contains(&q) {
            return Err(DeerError::invalid(format!("percentile {q} is outside [0, 100]")));
        }
        let width = self.mean.len();
        Ok((0..width)
            .map(|j| {
                let mut column: Vec<f64> = self.samples.iter().map(|s| s[j]).collect();
                column.sort_by(f64::total_cmp);
                interpolate_sorted(&column, q / 100.0)
            })
            .collect())
    }

    /// Percentile interval with `coverage` percent probability.
    pub fn ci(&self, coverage: f64) -> DeerResult<Vec<(f64, f64)>> {
        let tail = (100.0 - coverage) / 2.0;
        let lo = self.percentile(tail)?;
        let hi = self.percentile(100.0 - tail)?;
        Ok(lo.into_iter().zip(hi).collect())
    }
}

fn interpolate_sorted(sorted: &[f64], frac: f64) -> f64 {
    let pos = frac * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let w = pos - lo as f64;
    sorted[lo] * (1.0 - w) + sorted[hi] * w
}

/// Run `analysis` on `samples` synthetic signals built from `fitted` and
/// `residuals`.
pub fn bootstrap<F>(
    fitted: &[f64],
    residuals: &[f64],
    samples: usize,
    seed: u64,
    resampling: Resampling,
    analysis: F,
) -> DeerResult<BootstrapSummary>
where
    F: Fn(&[f64]) -> DeerResult<Vec<f64>> + Sync,
{
    ensure_finite("fitted signal", fitted)?;
    ensure_finite("residuals", residuals)?;
    ensure_len("residuals", residuals.len(), fitted.len())?;
    if samples < 2 {
        return Err(DeerError::invalid("bootstrap needs at least 2 samples"));
    }
    let sigma = std_dev(residuals);
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| DeerError::invalid(format!("noise distribution error: {e}")))?;

    let outputs: Vec<DeerResult<Vec<f64>>> = (0..samples)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let synthetic: Vec<f64> = match resampling {
                Resampling::Residual => fitted
                    .iter()
                    .map(|&f| f + residuals[rng.gen_range(0..residuals.len())])
                    .collect(),
                Resampling::Gaussian => {
                    fitted.iter().map(|&f| f + normal.sample(&mut rng)).collect()
                }
            };
            analysis(&synthetic)
        })
        .collect();
    let outputs: Vec<Vec<f64>> = outputs.into_iter().collect::<DeerResult<_>>()?;

    let width = outputs[0].len();
    if let Some(bad) = outputs.iter().position(|o| o.len() != width) {
        return Err(DeerError::invalid(format!(
            "bootstrap sample {bad} returned {} values, expected {width}",
            outputs[bad].len()
        )));
    }

    let n = outputs.len() as f64;
    let mean: Vec<f64> = (0..width)
        .map(|j| outputs.iter().map(|o| o[j]).sum::<f64>() / n)
        .collect();
    let std: Vec<f64> = (0..width)
        .map(|j| {
            let ss: f64 = outputs.iter().map(|o| (o[j] - mean[j]).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        })
        .collect();
    debug!("bootstrap finished: {samples} samples, {width} outputs");

    Ok(BootstrapSummary {
        mean,
        std,
        samples: outputs,
    })
}
