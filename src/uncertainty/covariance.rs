//! Covariance-based uncertainty of fitted distributions and parameters.
//!
//! Three estimators are provided:
//! - linearized Tikhonov covariance `σ² A⁻¹ KᵀK A⁻¹`, `A = KᵀK + α²LᵀL`
//! - HC1 heteroscedasticity-consistent sandwich on the augmented problem
//!   `[K; αL] P ≈ [V; 0]`
//! - Gauss–Newton covariance `σ² (JᵀJ)⁺` for nonlinear parametric fits
//!
//! All of them feed a [`CovarianceEstimate`], which turns a covariance into
//! standard deviations, confidence intervals and propagated uncertainties of
//! derived scalars.

use finitediff::FiniteDiff;
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{RANK_RTOL, pseudo_inverse, spd_inverse, symmetrize, trapz};

/// Distance from the lower bound below which gradients are one-sided.
const FD_MARGIN: f64 = 1e-5;

/// Mean and covariance of a fitted vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceEstimate {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    /// Confidence intervals are clipped below at this value.
    lower_bound: Option<f64>,
}

/// Propagated uncertainty of a scalar functional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalarEstimate {
    pub value: f64,
    pub std: f64,
}

impl ScalarEstimate {
    /// Two-sided normal interval with `coverage` percent probability.
    pub fn ci(&self, coverage: f64) -> DeerResult<(f64, f64)> {
        let z = normal_quantile(coverage)?;
        Ok((self.value - z * self.std, self.value + z * self.std))
    }
}

impl CovarianceEstimate {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> DeerResult<Self> {
        let n = mean.len();
        if covariance.shape() != (n, n) {
            return Err(DeerError::invalid(format!(
                "covariance is {:?}, expected ({n}, {n})",
                covariance.shape()
            )));
        }
        let mut covariance = covariance;
        symmetrize(&mut covariance);
        Ok(Self {
            mean,
            covariance,
            lower_bound: None,
        })
    }

    /// Clip interval lower ends at `bound`, e.g. `0.0` for non-negative
    /// distributions.
    pub fn with_lower_bound(mut self, bound: f64) -> Self {
        self.lower_bound = Some(bound);
        self
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn lower_bound(&self) -> Option<f64> {
        self.lower_bound
    }

    /// Standard deviations; tiny negative variances from round-off map to 0.
    pub fn std(&self) -> Vec<f64> {
        self.covariance
            .diagonal()
            .iter()
            .map(|v| v.max(0.0).sqrt())
            .collect()
    }

    /// Pointwise two-sided confidence intervals with `coverage` percent
    /// probability (e.g. `95.0`).
    pub fn ci(&self, coverage: f64) -> DeerResult<Vec<(f64, f64)>> {
        let z = normal_quantile(coverage)?;
        Ok(self
            .mean
            .iter()
            .zip(self.std())
            .map(|(&m, s)| {
                let mut lo = m - z * s;
                if let Some(b) = self.lower_bound {
                    lo = lo.max(b);
                }
                (lo, m + z * s)
            })
            .collect())
    }

    /// Rescale the underlying vector by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            mean: &self.mean * factor,
            covariance: &self.covariance * (factor * factor),
            lower_bound: self.lower_bound.map(|b| b * factor),
        }
    }

    /// First-order propagation of a scalar functional of the vector.
    ///
    /// The gradient is a central finite difference, or a forward one when a
    /// component sits at the lower bound so the functional is never
    /// evaluated below it.
    pub fn propagate<F>(&self, functional: F) -> ScalarEstimate
    where
        F: Fn(&[f64]) -> f64,
    {
        let x: Vec<f64> = self.mean.iter().copied().collect();
        let value = functional(&x);
        let g = |p: &Vec<f64>| functional(p);
        let at_bound = self
            .lower_bound
            .is_some_and(|lb| x.iter().any(|&v| v - lb < FD_MARGIN));
        let grad = if at_bound {
            x.forward_diff(&g)
        } else {
            x.central_diff(&g)
        };
        let grad = DVector::from_vec(grad);
        let variance = grad.dot(&(&self.covariance * &grad));
        ScalarEstimate {
            value,
            std: variance.max(0.0).sqrt(),
        }
    }
}

/// Linearized covariance of a Tikhonov solution, `σ² A⁻¹ KᵀK A⁻¹`.
pub fn propagate_uncertainty(
    k: &DMatrix<f64>,
    l: &DMatrix<f64>,
    alpha: f64,
    noise_std: f64,
    p: &[f64],
) -> DeerResult<CovarianceEstimate> {
    ensure_len("distribution", p.len(), k.ncols())?;
    ensure_len("penalty columns", l.ncols(), k.ncols())?;
    ensure_finite("distribution", p)?;
    if !(noise_std.is_finite() && noise_std >= 0.0) {
        return Err(DeerError::invalid(format!(
            "noise level {noise_std} must be finite and non-negative"
        )));
    }
    let ktk = k.transpose() * k;
    let a = &ktk + l.transpose() * l * (alpha * alpha);
    let a_inv = spd_inverse(&a);
    let cov = &a_inv * &ktk * &a_inv * (noise_std * noise_std);
    CovarianceEstimate::new(DVector::from_column_slice(p), cov)
}

/// HC1 sandwich covariance of the augmented Tikhonov problem.
///
/// `signal_residual` is `V − KP`; the penalty residual `αLP` is appended
/// internally.
pub fn hc1_covariance(
    k: &DMatrix<f64>,
    l: &DMatrix<f64>,
    alpha: f64,
    signal_residual: &[f64],
    p: &[f64],
) -> DeerResult<CovarianceEstimate> {
    ensure_len("residual", signal_residual.len(), k.nrows())?;
    ensure_len("distribution", p.len(), k.ncols())?;
    let pv = DVector::from_column_slice(p);
    let penalty_residual = l * &pv * alpha;

    let rows = k.nrows() + l.nrows();
    let cols = k.ncols();
    let mut jac = DMatrix::zeros(rows, cols);
    jac.view_mut((0, 0), (k.nrows(), cols)).copy_from(k);
    jac.view_mut((k.nrows(), 0), (l.nrows(), cols))
        .copy_from(&(l * alpha));
    let residual: Vec<f64> = signal_residual
        .iter()
        .copied()
        .chain(penalty_residual.iter().copied())
        .collect();

    let cov = sandwich_hc1(&jac, &residual);
    CovarianceEstimate::new(pv, cov)
}

/// `C JᵀΩJ C` with `C = (JᵀJ)⁺` and `Ω = diag(e²)·n/(n−k)`.
fn sandwich_hc1(jac: &DMatrix<f64>, residual: &[f64]) -> DMatrix<f64> {
    let (n, k) = jac.shape();
    let correction = if n > k { n as f64 / (n - k) as f64 } else { 1.0 };
    let bread = pseudo_inverse(&(jac.transpose() * jac), RANK_RTOL);
    let mut weighted = jac.clone();
    for (i, mut row) in weighted.row_iter_mut().enumerate() {
        row *= residual[i];
    }
    let meat = weighted.transpose() * &weighted * correction;
    &bread * meat * &bread
}

/// Covariance of nonlinear least-squares parameters, `σ² (JᵀJ)⁺`.
///
/// Without a known noise level, `σ²` is estimated as `‖e‖² / (N − p)`.
pub fn gauss_newton_covariance(
    jacobian: &DMatrix<f64>,
    residual: &[f64],
    noise_std: Option<f64>,
) -> DeerResult<DMatrix<f64>> {
    ensure_len("residual", residual.len(), jacobian.nrows())?;
    ensure_finite("residual", residual)?;
    let (n, p) = jacobian.shape();
    let sigma2 = match noise_std {
        Some(s) => s * s,
        None => {
            let rss: f64 = residual.iter().map(|e| e * e).sum();
            rss / (n.saturating_sub(p)).max(1) as f64
        }
    };
    let mut cov = pseudo_inverse(&(jacobian.transpose() * jacobian), RANK_RTOL) * sigma2;
    symmetrize(&mut cov);
    Ok(cov)
}

/// Mean distance `∫ r P dr / ∫ P dr`.
pub fn mean_distance(r: &[f64], p: &[f64]) -> f64 {
    let weighted: Vec<f64> = r.iter().zip(p).map(|(ri, pi)| ri * pi).collect();
    trapz(&weighted, r) / trapz(p, r)
}

/// Standard deviation of the distance under `P`.
pub fn distance_std(r: &[f64], p: &[f64]) -> f64 {
    let mu = mean_distance(r, p);
    let weighted: Vec<f64> = r
        .iter()
        .zip(p)
        .map(|(ri, pi)| (ri - mu).powi(2) * pi)
        .collect();
    (trapz(&weighted, r) / trapz(p, r)).max(0.0).sqrt()
}

/// Two-sided standard normal quantile for `coverage` percent.
fn normal_quantile(coverage: f64) -> DeerResult<f64> {
    if !(coverage > 0.0 && coverage < 100.0) {
        return Err(DeerError::invalid(format!(
            "coverage {coverage} must be in (0, 100) percent"
        )));
    }
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| DeerError::numerical(format!("standard normal: {e}")))?;
    Ok(normal.inverse_cdf(0.5 + coverage / 200.0))
}
