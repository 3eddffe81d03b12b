//! Non-parametric (Tikhonov) fitting of distance distributions.
//!
//! [`fit_distribution`] solves a single problem for a given α:
//!
//! ```text
//! minimize ‖K P − V‖² + α² ‖L P‖²      (optionally subject to P ≥ 0)
//! ```
//!
//! [`fit_regularized`] is the full pipeline around it:
//! 1. penalty operator of the configured order, reweighted for the
//!    total-variation and Huber penalties
//! 2. noise level (given or estimated)
//! 3. α (given or selected by the configured criterion)
//! 4. solve, or Osher–Bregman iterated regularization
//! 5. covariance of the solution
//! 6. goodness of fit with `tr H` effective parameters
//! 7. renormalization by `∫ P dr`
//!
//! [`fit_regularized_global`] stacks several weighted datasets that share a
//! distribution and runs the same pipeline once.

use std::ops::Range;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::domain::{
    Convergence, ConvergenceReport, CovarianceMethod, FitConfig, GoodnessOfFit, NnlsSolver,
    Warning,
};
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::fit::gof::goodness_of_fit;
use crate::math::{
    RANK_RTOL, cholesky_solve, ensure_increasing, nnls, numerical_rank,
    regularized_normal_equations, solve_least_squares, trapz,
};
use crate::regularization::{
    AlphaSelection, SelectionOptions, build_penalty_matrix, influence_traces, reweighted_penalty,
    select_alpha,
};
use crate::uncertainty::covariance::{CovarianceEstimate, hc1_covariance, propagate_uncertainty};
use crate::uncertainty::noise::{NoiseEstimator, noise_level, std_dev};

/// Solution of one regularized least-squares problem.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionSolution {
    pub p: Vec<f64>,
    /// `‖K P − V‖`.
    pub residual_norm: f64,
    pub convergence: ConvergenceReport,
}

/// Result of the regularized fitting pipeline.
#[derive(Debug, Clone)]
pub struct RegularizedFit {
    /// Fitted distribution (renormalized unless disabled).
    pub p: Vec<f64>,
    /// `K P` of the fitted (not renormalized) distribution.
    pub fitted: Vec<f64>,
    pub residual_norm: f64,
    pub alpha: f64,
    /// α sweep, present when α was selected rather than given.
    pub selection: Option<AlphaSelection>,
    pub uncertainty: CovarianceEstimate,
    pub noise_std: f64,
    /// `∫ P dr` before renormalization.
    pub scale: f64,
    pub stats: GoodnessOfFit,
    /// `tr H` of the final (possibly reweighted) problem.
    pub effective_params: f64,
    pub convergence: ConvergenceReport,
    pub warnings: Vec<Warning>,
}

/// One dataset of a global fit.
#[derive(Debug, Clone, Copy)]
pub struct Dataset<'a> {
    pub signal: &'a [f64],
    pub kernel: &'a DMatrix<f64>,
    /// Relative weight; `1.0` when equal weighting is wanted.
    pub weight: f64,
}

impl<'a> Dataset<'a> {
    pub fn new(signal: &'a [f64], kernel: &'a DMatrix<f64>) -> Self {
        Self {
            signal,
            kernel,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Per-dataset part of a global fit.
#[derive(Debug, Clone)]
pub struct DatasetFit {
    pub fitted: Vec<f64>,
    pub noise_std: f64,
    pub stats: GoodnessOfFit,
}

/// Result of a global fit.
#[derive(Debug, Clone)]
pub struct GlobalRegularizedFit {
    /// Fit of the stacked, weighted problem.
    pub fit: RegularizedFit,
    pub datasets: Vec<DatasetFit>,
}

/// Solve `min ‖K P − V‖² + α²‖L P‖²` for a fixed α.
///
/// Returns [`DeerError::SingularKernel`] when no regularization is applied
/// (`α = 0` or an empty `L`) and `K` is rank deficient.
pub fn fit_distribution(
    k: &DMatrix<f64>,
    v: &[f64],
    l: &DMatrix<f64>,
    alpha: f64,
    nonneg: bool,
    solver: NnlsSolver,
    criterion: Convergence,
) -> DeerResult<DistributionSolution> {
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), k.nrows())?;
    ensure_len("penalty columns", l.ncols(), k.ncols())?;
    validate_alpha(alpha)?;
    criterion.validate()?;

    if alpha == 0.0 || l.nrows() == 0 {
        let rank = numerical_rank(k, RANK_RTOL);
        if rank < k.ncols() {
            return Err(DeerError::SingularKernel {
                rank,
                size: k.ncols(),
            });
        }
    }

    let vv = DVector::from_column_slice(v);
    let (a, ktv) = regularized_normal_equations(k, &vv, l, alpha);

    let (p, convergence) = if nonneg {
        let out = nnls(solver, &a, &ktv, criterion);
        if !out.report.converged {
            warn!(
                "NNLS stopped after {} iterations without converging",
                out.report.iterations
            );
        }
        (out.x, out.report)
    } else {
        let x = cholesky_solve(&a, &ktv)
            .or_else(|| solve_least_squares(&a, &ktv))
            .ok_or_else(|| {
                DeerError::numerical("regularized normal equations could not be solved")
            })?;
        (x, ConvergenceReport::direct(criterion))
    };

    let residual_norm = (k * &p - &vv).norm();
    Ok(DistributionSolution {
        p: p.iter().copied().collect(),
        residual_norm,
        convergence,
    })
}

/// Full regularized fitting pipeline for a single dataset.
pub fn fit_regularized(
    v: &[f64],
    k: &DMatrix<f64>,
    r: &[f64],
    config: &FitConfig,
) -> DeerResult<RegularizedFit> {
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), k.nrows())?;
    let noise_std = match config.noise_std {
        Some(s) => s,
        None => noise_level(v, NoiseEstimator::Derivative)?,
    };
    fit_stacked(v, k, r, config, noise_std)
}

/// Regularized fit of several datasets sharing one distribution.
pub fn fit_regularized_global(
    datasets: &[Dataset<'_>],
    r: &[f64],
    config: &FitConfig,
) -> DeerResult<GlobalRegularizedFit> {
    if datasets.is_empty() {
        return Err(DeerError::invalid("global fit needs at least one dataset"));
    }
    let m = r.len();
    let mut ranges: Vec<Range<usize>> = Vec::with_capacity(datasets.len());
    let mut noise: Vec<f64> = Vec::with_capacity(datasets.len());
    let mut offset = 0;
    for (i, d) in datasets.iter().enumerate() {
        ensure_finite(&format!("dataset {i} signal"), d.signal)?;
        ensure_len(&format!("dataset {i} signal"), d.signal.len(), d.kernel.nrows())?;
        ensure_len(&format!("dataset {i} kernel columns"), d.kernel.ncols(), m)?;
        if !(d.weight.is_finite() && d.weight > 0.0) {
            return Err(DeerError::invalid(format!(
                "dataset {i} weight {} must be positive and finite",
                d.weight
            )));
        }
        noise.push(noise_level(d.signal, NoiseEstimator::Derivative)?);
        ranges.push(offset..offset + d.signal.len());
        offset += d.signal.len();
    }

    // Rows of dataset i are scaled by √wᵢ so that KᵀK = Σ wᵢ KᵢᵀKᵢ.
    let mut k = DMatrix::zeros(offset, m);
    let mut v = Vec::with_capacity(offset);
    for (d, range) in datasets.iter().zip(&ranges) {
        let s = d.weight.sqrt();
        k.view_mut((range.start, 0), (range.len(), m))
            .copy_from(&(d.kernel * s));
        v.extend(d.signal.iter().map(|x| x * s));
    }

    let pooled_noise = match config.noise_std {
        Some(s) => s,
        None => {
            let var: f64 = datasets
                .iter()
                .zip(&noise)
                .map(|(d, s)| d.weight * s * s * d.signal.len() as f64)
                .sum();
            (var / offset as f64).sqrt()
        }
    };
    let fit = fit_stacked(&v, &k, r, config, pooled_noise)?;
    let trace = fit.effective_params;

    let mut per_dataset = Vec::with_capacity(datasets.len());
    for ((d, range), sigma) in datasets.iter().zip(&ranges).zip(&noise) {
        let s = d.weight.sqrt();
        let fitted: Vec<f64> = fit.fitted[range.clone()].iter().map(|x| x / s).collect();
        let sigma = config.noise_std.unwrap_or(*sigma);
        let stats = goodness_of_fit(d.signal, &fitted, trace, sigma)?;
        per_dataset.push(DatasetFit {
            fitted,
            noise_std: sigma,
            stats,
        });
    }

    Ok(GlobalRegularizedFit {
        fit,
        datasets: per_dataset,
    })
}

fn fit_stacked(
    v: &[f64],
    k: &DMatrix<f64>,
    r: &[f64],
    config: &FitConfig,
    noise_std: f64,
) -> DeerResult<RegularizedFit> {
    ensure_finite("r", r)?;
    ensure_increasing("r", r)?;
    ensure_len("kernel columns", k.ncols(), r.len())?;
    config.convergence.validate()?;
    config.penalty.validate()?;
    if !(noise_std.is_finite() && noise_std > 0.0) {
        return Err(DeerError::invalid(format!(
            "noise level {noise_std} must be positive and finite"
        )));
    }

    let base = build_penalty_matrix(r, config.order)?;
    let mut warnings = Vec::new();

    let (alpha, selection) = match config.alpha {
        Some(a) => {
            validate_alpha(a)?;
            (a, None)
        }
        None => {
            let options = SelectionOptions {
                noise_std: Some(noise_std),
                ..SelectionOptions::from(config)
            };
            let sel = select_alpha(k, &base, v, config.method, &options)?;
            if let Some(w) = &sel.warning {
                warnings.push(w.clone());
            }
            (sel.alpha, Some(sel))
        }
    };

    let (solution, alpha, l) = if config.obir {
        obir(k, v, &base, alpha, config, noise_std)?
    } else {
        let l = reweighted_penalty(k, v, &base, alpha, config.penalty)?;
        let s = fit_distribution(
            k,
            v,
            &l,
            alpha,
            config.nonneg,
            config.solver,
            config.convergence,
        )?;
        (s, alpha, l)
    };
    if !solution.convergence.converged {
        warnings.push(Warning::NotConverged {
            stage: if config.obir { "obir" } else { "nnls" }.to_string(),
            iterations: solution.convergence.iterations,
        });
    }

    let p = solution.p;
    let vv = DVector::from_column_slice(v);
    let pv = DVector::from_column_slice(&p);
    let fitted_vec = k * &pv;
    let fitted: Vec<f64> = fitted_vec.iter().copied().collect();

    let mut uncertainty = match config.covariance {
        CovarianceMethod::Linearized => propagate_uncertainty(k, &l, alpha, noise_std, &p)?,
        CovarianceMethod::Hc1 => {
            let resid: Vec<f64> = (&vv - &fitted_vec).iter().copied().collect();
            hc1_covariance(k, &l, alpha, &resid, &p)?
        }
    };
    if config.nonneg {
        uncertainty = uncertainty.with_lower_bound(0.0);
    }

    let ktk = k.transpose() * k;
    let (trace, _) = influence_traces(&ktk, &(l.transpose() * &l), alpha);
    let stats = goodness_of_fit(v, &fitted, trace, noise_std)?;

    let scale = trapz(&p, r);
    let p = if config.renormalize {
        if scale.is_finite() && scale > 0.0 {
            uncertainty = uncertainty.scaled(1.0 / scale);
            p.iter().map(|x| x / scale).collect()
        } else {
            warn!("distribution integrates to {scale}; renormalization skipped");
            p
        }
    } else {
        p
    };

    debug!(
        "regularized fit: alpha = {alpha:e}, residual = {:.4e}, tr H = {trace:.2}",
        solution.residual_norm
    );

    Ok(RegularizedFit {
        p,
        fitted,
        residual_norm: solution.residual_norm,
        alpha,
        selection,
        uncertainty,
        noise_std,
        scale,
        stats,
        effective_params: trace,
        convergence: solution.convergence,
        warnings,
    })
}

/// Osher–Bregman iterated regularization.
///
/// Starts from an oversmoothing α (doubled until the first solution's
/// residual exceeds the noise level), then repeatedly adds back the residual
/// through the subgradient until the residual falls to the noise level. The
/// subgradient accumulates over every solve, the doubling restarts included.
/// Returns the solution, the final α and the penalty operator used with it.
fn obir(
    k: &DMatrix<f64>,
    v: &[f64],
    base: &DMatrix<f64>,
    alpha: f64,
    config: &FitConfig,
    noise_aim: f64,
) -> DeerResult<(DistributionSolution, f64, DMatrix<f64>)> {
    validate_alpha(alpha)?;
    let vv = DVector::from_column_slice(v);
    let kt = k.transpose();

    let mut alpha = alpha;
    let mut l = reweighted_penalty(k, v, base, alpha, config.penalty)?;
    let (mut a, ktv) = regularized_normal_equations(k, &vv, &l, alpha);
    let mut subgrad = DVector::<f64>::zeros(k.ncols());
    let mut p = DVector::<f64>::zeros(k.ncols());
    let mut doublings = 0;
    let mut bregman_started = false;
    let mut iterations = 0;
    let mut converged = false;
    let mut last_change = f64::INFINITY;

    while iterations < config.convergence.max_iter {
        iterations += 1;
        let rhs = &ktv - &subgrad;
        let next = if config.nonneg {
            nnls(config.solver, &a, &rhs, config.convergence).x
        } else {
            cholesky_solve(&a, &rhs)
                .or_else(|| solve_least_squares(&a, &rhs))
                .ok_or_else(|| DeerError::numerical("OBIR step could not be solved"))?
        };
        let resid = k * &next - &vv;
        let resid_std = std_dev(resid.as_slice());
        last_change = (&next - &p).norm() / next.norm().max(f64::MIN_POSITIVE);
        p = next;
        subgrad += &kt * &resid;

        if !bregman_started {
            if noise_aim > resid_std {
                // Already below the noise: oversmooth and solve again.
                doublings += 1;
                alpha *= 2f64.powi(doublings);
                l = reweighted_penalty(k, v, base, alpha, config.penalty)?;
                a = regularized_normal_equations(k, &vv, &l, alpha).0;
                debug!("OBIR residual below the noise level, alpha raised to {alpha:e}");
                continue;
            }
            bregman_started = true;
        } else if noise_aim > resid_std {
            converged = true;
            break;
        }
    }

    debug!("OBIR finished after {iterations} iterations at alpha = {alpha:e}");
    let residual_norm = (k * &p - &vv).norm();
    Ok((
        DistributionSolution {
            p: p.iter().copied().collect(),
            residual_norm,
            convergence: ConvergenceReport {
                criterion: config.convergence,
                iterations,
                converged,
                last_change,
            },
        },
        alpha,
        l,
    ))
}

fn validate_alpha(alpha: f64) -> DeerResult<()> {
    if !(alpha.is_finite() && alpha >= 0.0) {
        return Err(DeerError::invalid(format!(
            "regularization parameter {alpha} must be finite and non-negative"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pathway;
    use crate::kernel::build_kernel;
    use crate::math::linspace;
    use crate::models::{BasisShape, DistributionModel};

    fn solve(
        k: &DMatrix<f64>,
        v: &[f64],
        l: &DMatrix<f64>,
        alpha: f64,
        nonneg: bool,
    ) -> DeerResult<DistributionSolution> {
        fit_distribution(k, v, l, alpha, nonneg, NnlsSolver::Fnnls, Convergence::default())
    }

    fn gaussian_problem() -> (Vec<f64>, Vec<f64>, DMatrix<f64>, Vec<f64>) {
        let t = linspace(0.0, 3.0, 150);
        let r = linspace(2.0, 5.0, 60);
        let k = build_kernel(&t, &r, &[Pathway::unit()], &Default::default()).unwrap();
        let p = BasisShape::Gaussian.evaluate(&r, &[3.5, 0.5]);
        (t, r, k, p)
    }

    #[test]
    fn unregularized_singular_kernel_is_reported() {
        let k = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let l = DMatrix::zeros(0, 2);
        let err = solve(&k, &[1.0, 2.0, 3.0], &l, 0.0, false).unwrap_err();
        assert_eq!(err, DeerError::SingularKernel { rank: 1, size: 2 });
    }

    #[test]
    fn full_rank_unregularized_solve_is_exact() {
        let k = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let l = DMatrix::zeros(0, 2);
        let sol = solve(&k, &[1.0, 2.0, 3.0], &l, 0.0, false).unwrap();
        assert!((sol.p[0] - 1.0).abs() < 1e-12);
        assert!((sol.p[1] - 2.0).abs() < 1e-12);
        assert!(sol.residual_norm < 1e-12);
    }

    #[test]
    fn solvers_agree_on_regularized_problem() {
        let (_, r, k, p) = gaussian_problem();
        let v: Vec<f64> = (&k * DVector::from_vec(p)).iter().copied().collect();
        let l = build_penalty_matrix(&r, 2).unwrap();
        let a = solve(&k, &v, &l, 0.05, true).unwrap();
        let criterion = Convergence::default();
        let b = fit_distribution(&k, &v, &l, 0.05, true, NnlsSolver::Bpp, criterion).unwrap();
        let diff = a.p.iter().zip(&b.p).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max);
        assert!(diff < 1e-6, "max difference {diff}");
        assert!(a.p.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn pipeline_renormalizes_and_reports_stats() {
        let (_, r, k, p) = gaussian_problem();
        let clean: Vec<f64> = (&k * DVector::from_vec(p)).iter().copied().collect();
        let noise = crate::uncertainty::noise::white_gaussian_noise(clean.len(), 0.01, 3).unwrap();
        let v: Vec<f64> = clean.iter().zip(&noise).map(|(a, b)| 2.0 * a + b).collect();

        let config = FitConfig {
            alpha: Some(0.05),
            ..FitConfig::default()
        };
        let fit = fit_regularized(&v, &k, &r, &config).unwrap();
        assert!((trapz(&fit.p, &r) - 1.0).abs() < 1e-12);
        assert!((fit.scale - 2.0).abs() < 0.1, "scale {}", fit.scale);
        assert!(fit.selection.is_none());
        assert!(fit.stats.dof > 0.0 && fit.stats.dof < v.len() as f64);
        assert_eq!(fit.uncertainty.mean().len(), r.len());
        assert_eq!(fit.uncertainty.lower_bound(), Some(0.0));
        assert!(fit.effective_params > 0.0 && fit.effective_params < r.len() as f64);
    }

    #[test]
    fn obir_doubles_an_undersmoothing_alpha() {
        let (_, r, k, p) = gaussian_problem();
        let clean: Vec<f64> = (&k * DVector::from_vec(p)).iter().copied().collect();
        let noise = crate::uncertainty::noise::white_gaussian_noise(clean.len(), 0.01, 4).unwrap();
        let v: Vec<f64> = clean.iter().zip(&noise).map(|(a, b)| a + b).collect();
        let aim = 0.012;
        let config = FitConfig {
            alpha: Some(1e-3),
            obir: true,
            noise_std: Some(aim),
            ..FitConfig::default()
        };
        let fit = fit_regularized(&v, &k, &r, &config).unwrap();
        assert!(fit.convergence.converged);
        assert!(fit.alpha > 1e-3, "alpha {}", fit.alpha);
        let resid: Vec<f64> = v.iter().zip(&fit.fitted).map(|(a, b)| a - b).collect();
        assert!(std_dev(&resid) < aim);
        assert!(fit.p.iter().all(|&x| x >= 0.0));
    }

    #[test]
    fn invalid_alpha_is_rejected() {
        let (_, r, k, p) = gaussian_problem();
        let l = build_penalty_matrix(&r, 2).unwrap();
        let v: Vec<f64> = (&k * DVector::from_vec(p)).iter().copied().collect();
        assert!(solve(&k, &v, &l, -1.0, true).is_err());
        assert!(solve(&k, &v, &l, f64::NAN, true).is_err());
    }

    #[test]
    fn global_fit_of_identical_datasets_matches_single_fit() {
        let (_, r, k, p) = gaussian_problem();
        let clean: Vec<f64> = (&k * DVector::from_vec(p)).iter().copied().collect();
        let noise = crate::uncertainty::noise::white_gaussian_noise(clean.len(), 0.01, 8).unwrap();
        let v: Vec<f64> = clean.iter().zip(&noise).map(|(a, b)| a + b).collect();
        let config = FitConfig {
            alpha: Some(0.05),
            noise_std: Some(0.01),
            ..FitConfig::default()
        };

        let single = fit_regularized(&v, &k, &r, &config).unwrap();
        // Two copies with half weight each stack to the single problem.
        let data = [
            Dataset::new(&v, &k).with_weight(0.5),
            Dataset::new(&v, &k).with_weight(0.5),
        ];
        let global = fit_regularized_global(&data, &r, &config).unwrap();
        let diff = single
            .p
            .iter()
            .zip(&global.fit.p)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(diff < 1e-6, "max difference {diff}");
        assert_eq!(global.datasets.len(), 2);
        assert_eq!(global.datasets[0].fitted.len(), v.len());
    }
}
