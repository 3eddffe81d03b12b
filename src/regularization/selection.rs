//! Regularization parameter selection.
//!
//! Every candidate α of a log-spaced sweep is solved independently (in
//! parallel) and scored. Per candidate we record:
//! - residual norm `ρ = ‖KP − V‖`
//! - penalty seminorm `η = ‖LP‖` (with the reweighted operator for
//!   non-quadratic penalties)
//! - `tr H` and `tr H²` of the influence matrix `H = K (KᵀK + α²LᵀL)⁻¹ Kᵀ`
//!
//! The traces are computed from the `m × m` matrix `M = A⁻¹ KᵀK` since
//! `tr H = tr M` and `tr H² = tr M²`.
//!
//! Selection rules:
//! 1. Minimise the criterion; ties go to the lowest sweep index.
//! 2. A minimiser on either end of the sweep is not a bracketed minimum: the
//!    fallback α is used and a warning is attached.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AlphaSweep, Convergence, FitConfig, NnlsSolver, Penalty, SelectionMethod, Warning,
};
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{log_space, nnls, spd_inverse};
use crate::regularization::operator::reweighted_penalty;
use crate::uncertainty::noise::{NoiseEstimator, noise_level};

/// Robust GCV tuning constant.
const RGCV_GAMMA: f64 = 0.9;
/// Strong robust GCV tuning constant.
const SRGCV_GAMMA: f64 = 0.8;

/// Options of the α sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionOptions {
    pub sweep: AlphaSweep,
    /// Score non-negative solutions instead of unconstrained ones.
    pub nonneg: bool,
    pub solver: NnlsSolver,
    /// Penalty functional; non-quadratic ones are reweighted per α.
    pub penalty: Penalty,
    /// Noise level for Mallows' C_L; estimated from the signal when absent.
    pub noise_std: Option<f64>,
    pub convergence: Convergence,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        Self {
            sweep: AlphaSweep::default(),
            nonneg: true,
            solver: NnlsSolver::Fnnls,
            penalty: Penalty::Tikhonov,
            noise_std: None,
            convergence: Convergence::default(),
        }
    }
}

impl From<&FitConfig> for SelectionOptions {
    fn from(config: &FitConfig) -> Self {
        Self {
            sweep: config.sweep,
            nonneg: config.nonneg,
            solver: config.solver,
            penalty: config.penalty,
            noise_std: config.noise_std,
            convergence: config.convergence,
        }
    }
}

/// Outcome of an α sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlphaSelection {
    pub method: SelectionMethod,
    /// Selected regularization parameter.
    pub alpha: f64,
    /// Sweep index of the selected α, `None` when the fallback was used.
    pub index: Option<usize>,
    pub alphas: Vec<f64>,
    pub scores: Vec<f64>,
    pub residuals: Vec<f64>,
    pub penalties: Vec<f64>,
    /// `tr H` per candidate.
    pub traces: Vec<f64>,
    pub warning: Option<Warning>,
}

#[derive(Debug, Clone, Copy)]
struct SweepPoint {
    residual: f64,
    penalty: f64,
    trace: f64,
    trace_sq: f64,
}

/// `(tr H, tr H²)` of the influence matrix for one α.
pub fn influence_traces(ktk: &DMatrix<f64>, ltl: &DMatrix<f64>, alpha: f64) -> (f64, f64) {
    let a = ktk + ltl * (alpha * alpha);
    traces_from_inverse(&spd_inverse(&a), ktk)
}

fn traces_from_inverse(a_inv: &DMatrix<f64>, ktk: &DMatrix<f64>) -> (f64, f64) {
    let m = a_inv * ktk;
    (m.trace(), (&m * &m).trace())
}

/// Select α for the problem `‖KP − V‖² + α²‖LP‖²`, or its reweighted form
/// for a non-quadratic penalty.
pub fn select_alpha(
    k: &DMatrix<f64>,
    l: &DMatrix<f64>,
    v: &[f64],
    method: SelectionMethod,
    options: &SelectionOptions,
) -> DeerResult<AlphaSelection> {
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), k.nrows())?;
    ensure_len("penalty columns", l.ncols(), k.ncols())?;
    options.penalty.validate()?;
    let sweep = options.sweep;
    let alphas = log_space(sweep.min, sweep.max, sweep.points)?;

    let n = v.len() as f64;
    let sigma2 = if method.needs_noise() {
        let sigma = match options.noise_std {
            Some(s) if s.is_finite() && s > 0.0 => s,
            Some(s) => {
                return Err(DeerError::invalid(format!(
                    "noise level {s} must be positive and finite"
                )));
            }
            None => noise_level(v, NoiseEstimator::Derivative)?,
        };
        sigma * sigma
    } else {
        0.0
    };

    let vv = DVector::from_column_slice(v);
    let ktk = k.transpose() * k;
    let ltl = l.transpose() * l;
    let ktv = k.transpose() * &vv;

    // Evaluate each α independently (parallel); collect keeps sweep order.
    let points: Vec<SweepPoint> = alphas
        .par_iter()
        .map(|&alpha| evaluate_alpha(k, l, &vv, &ktk, &ltl, &ktv, alpha, options))
        .collect::<DeerResult<_>>()?;

    let residuals: Vec<f64> = points.iter().map(|p| p.residual).collect();
    let penalties: Vec<f64> = points.iter().map(|p| p.penalty).collect();
    let traces: Vec<f64> = points.iter().map(|p| p.trace).collect();

    let scores: Vec<f64> = match method {
        SelectionMethod::Lcurve => lcurve_curvature(&residuals, &penalties)
            .into_iter()
            .map(|kappa| -kappa)
            .collect(),
        SelectionMethod::Lr => lcurve_radius(&residuals, &penalties),
        _ => points
            .iter()
            .map(|p| pointwise_score(method, p, n, sigma2))
            .collect(),
    };

    let best = argmin(&scores);
    let bracketed = best.filter(|&i| i > 0 && i + 1 < scores.len());
    let (alpha, index, warning) = match bracketed {
        Some(i) => (alphas[i], Some(i), None),
        None => {
            let fallback = sweep.fallback_alpha();
            warn!(
                "{} has no interior minimum over alpha in [{:e}, {:e}]; using alpha = {fallback:e}",
                method.display_name(),
                sweep.min,
                sweep.max
            );
            (
                fallback,
                None,
                Some(Warning::NoBracketedMinimum { method, fallback }),
            )
        }
    };
    debug!("{} selected alpha = {alpha:e}", method.display_name());

    Ok(AlphaSelection {
        method,
        alpha,
        index,
        alphas,
        scores,
        residuals,
        penalties,
        traces,
        warning,
    })
}

#[allow(clippy::too_many_arguments)]
fn evaluate_alpha(
    k: &DMatrix<f64>,
    l: &DMatrix<f64>,
    v: &DVector<f64>,
    ktk: &DMatrix<f64>,
    ltl: &DMatrix<f64>,
    ktv: &DVector<f64>,
    alpha: f64,
    options: &SelectionOptions,
) -> DeerResult<SweepPoint> {
    let reweighted = match options.penalty {
        Penalty::Tikhonov => None,
        penalty => Some(reweighted_penalty(k, v.as_slice(), l, alpha, penalty)?),
    };
    let (l, a) = match &reweighted {
        Some(lw) => (lw, ktk + lw.transpose() * lw * (alpha * alpha)),
        None => (l, ktk + ltl * (alpha * alpha)),
    };
    let a_inv = spd_inverse(&a);
    let (trace, trace_sq) = traces_from_inverse(&a_inv, ktk);

    let p = if options.nonneg {
        nnls(options.solver, &a, ktv, options.convergence).x
    } else {
        &a_inv * ktv
    };
    Ok(SweepPoint {
        residual: (k * &p - v).norm(),
        penalty: (l * &p).norm(),
        trace,
        trace_sq,
    })
}

fn pointwise_score(method: SelectionMethod, p: &SweepPoint, n: f64, sigma2: f64) -> f64 {
    let rho2 = p.residual * p.residual;
    let tr = p.trace;
    let gcv = rho2 / (1.0 - tr / n).powi(2);
    let aic = n * (rho2 / n).ln() + 2.0 * tr;
    match method {
        SelectionMethod::Aic => aic,
        SelectionMethod::Aicc => aic + 2.0 * tr * (tr + 1.0) / (n - tr - 1.0),
        SelectionMethod::Bic => n * (rho2 / n).ln() + n.ln() * tr,
        SelectionMethod::Gcv => gcv,
        SelectionMethod::Rgcv => gcv * (RGCV_GAMMA + (1.0 - RGCV_GAMMA) * p.trace_sq / n),
        SelectionMethod::Srgcv => gcv * (SRGCV_GAMMA + (1.0 - SRGCV_GAMMA) * tr / n),
        SelectionMethod::Mcl => rho2 + 2.0 * sigma2 * tr - 2.0 * n * sigma2,
        SelectionMethod::Lcurve | SelectionMethod::Lr => f64::NAN,
    }
}

/// Signed curvature of `(ln ρ, ln η)` along the sweep.
fn lcurve_curvature(residuals: &[f64], penalties: &[f64]) -> Vec<f64> {
    let x: Vec<f64> = residuals.iter().map(|v| v.ln()).collect();
    let y: Vec<f64> = penalties.iter().map(|v| v.ln()).collect();
    let dx = gradient(&x);
    let dy = gradient(&y);
    let ddx = gradient(&dx);
    let ddy = gradient(&dy);
    (0..x.len())
        .map(|i| (dx[i] * ddy[i] - ddx[i] * dy[i]) / (dx[i].powi(2) + dy[i].powi(2)).powf(1.5))
        .collect()
}

/// Distance of the rescaled `(ln ρ, ln η)` curve to the origin.
fn lcurve_radius(residuals: &[f64], penalties: &[f64]) -> Vec<f64> {
    let x = rescale(residuals.iter().map(|v| v.ln()).collect());
    let y = rescale(penalties.iter().map(|v| v.ln()).collect());
    x.iter().zip(&y).map(|(a, b)| a.hypot(*b)).collect()
}

fn rescale(v: Vec<f64>) -> Vec<f64> {
    let lo = v.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = hi - lo;
    if !(span.is_finite() && span > 0.0) {
        return vec![0.0; v.len()];
    }
    v.into_iter().map(|x| (x - lo) / span).collect()
}

/// Second-order central differences, one-sided at the ends (unit spacing).
fn gradient(y: &[f64]) -> Vec<f64> {
    let n = y.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| match i {
            0 => y[1] - y[0],
            i if i == n - 1 => y[n - 1] - y[n - 2],
            _ => 0.5 * (y[i + 1] - y[i - 1]),
        })
        .collect()
}

/// Index of the smallest finite score; the lowest index wins ties.
fn argmin(scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some(b) if s >= scores[b] => {}
            _ => best = Some(i),
        }
    }
    best
}
