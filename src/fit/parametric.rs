//! Parametric fitting of distance distributions.
//!
//! The distribution is a [`DistributionModel`] `P(r; θ)` and the signal model
//! is `K P(r; θ)`. Models with linear amplitudes are fitted by variable
//! projection: bounded Levenberg–Marquardt runs over the nonlinear shape
//! parameters only, and for every trial shape the amplitudes are solved
//! exactly (NNLS when they are constrained non-negative). Other models are
//! searched jointly. The parameter covariance comes from the Gauss–Newton
//! approximation at the solution.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::domain::{Convergence, ConvergenceReport, NnlsSolver, Warning};
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{
    ensure_increasing, levenberg_marquardt, nnls, numerical_jacobian, solve_least_squares,
};
use crate::models::DistributionModel;
use crate::uncertainty::covariance::gauss_newton_covariance;

/// Options of a parametric fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParametricOptions {
    pub convergence: Convergence,
    /// Noise level for the parameter covariance; estimated from the
    /// residual when absent.
    pub noise_std: Option<f64>,
}

impl Default for ParametricOptions {
    fn default() -> Self {
        Self {
            convergence: Convergence::new(1e-10, 200),
            noise_std: None,
        }
    }
}

/// Result of a parametric fit.
#[derive(Debug, Clone)]
pub struct ParametricFit {
    /// Distribution at the fitted parameters.
    pub p: Vec<f64>,
    pub params: Vec<f64>,
    pub fitted: Vec<f64>,
    pub residual_norm: f64,
    pub convergence: ConvergenceReport,
    /// Whether the start point had to be clipped into the bounds.
    pub clipped: bool,
    /// Gauss–Newton covariance of `params`.
    pub covariance: DMatrix<f64>,
    pub warnings: Vec<Warning>,
}

impl ParametricFit {
    pub fn param_std(&self) -> Vec<f64> {
        self.covariance
            .diagonal()
            .iter()
            .map(|v| v.max(0.0).sqrt())
            .collect()
    }
}

/// Fit `V ≈ K P(r; θ)`.
///
/// `initial` and `bounds` default to the model's own start point and bounds.
/// When the model's linear parameters are all bounded to `[0, ∞)` or all
/// unbounded they are solved exactly, and their start values are ignored.
pub fn fit_parametric<M>(
    k: &DMatrix<f64>,
    v: &[f64],
    r: &[f64],
    model: &M,
    initial: Option<&[f64]>,
    bounds: Option<&[(f64, f64)]>,
    options: &ParametricOptions,
) -> DeerResult<ParametricFit>
where
    M: DistributionModel + ?Sized,
{
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), k.nrows())?;
    ensure_finite("r", r)?;
    ensure_increasing("r", r)?;
    ensure_len("kernel columns", k.ncols(), r.len())?;
    options.convergence.validate()?;

    let n_params = model.n_params();
    let start = initial.map_or_else(|| model.start(), <[f64]>::to_vec);
    let bounds = bounds.map_or_else(|| model.bounds(), <[(f64, f64)]>::to_vec);
    ensure_len("initial parameters", start.len(), n_params)?;
    ensure_len("parameter bounds", bounds.len(), n_params)?;
    ensure_finite("initial parameters", &start)?;
    validate_bounds(&bounds)?;

    let mut warnings = Vec::new();
    let outside: Vec<usize> = start
        .iter()
        .zip(&bounds)
        .enumerate()
        .filter(|(_, (x, (lo, hi)))| **x < *lo || **x > *hi)
        .map(|(i, _)| i)
        .collect();
    let clipped = !outside.is_empty();
    if clipped {
        warn!("initial parameters {outside:?} lie outside their bounds and were clipped");
        warnings.push(Warning::ParametersClipped { indices: outside });
    }

    let vv = DVector::from_column_slice(v);
    let residual = |theta: &[f64]| -> Vec<f64> {
        let p = DVector::from_vec(model.evaluate(r, theta));
        (k * p - &vv).iter().copied().collect()
    };

    let n_linear = model.n_linear().min(n_params);
    let split = n_params - n_linear;
    let linear_bounds = &bounds[split..];
    let nonneg = linear_bounds.iter().all(|&b| b == (0.0, f64::INFINITY));
    let free = linear_bounds
        .iter()
        .all(|&b| b == (f64::NEG_INFINITY, f64::INFINITY));

    let (params, report, stage) = if n_linear > 0 && (nonneg || free) {
        let design = |theta: &[f64]| basis_design(k, &model.basis(r, theta), n_linear);
        let out = separable_least_squares(
            design,
            &vv,
            &start[..split],
            &bounds[..split],
            nonneg,
            options.convergence,
        )?;
        let mut params = out.nonlinear;
        params.extend(out.linear);
        (params, out.report, "variable-projection")
    } else {
        let out = levenberg_marquardt(&residual, &start, &bounds, options.convergence)?;
        (out.x, out.report, "levenberg-marquardt")
    };
    if !report.converged {
        warn!(
            "parametric fit stopped after {} iterations without converging",
            report.iterations
        );
        warnings.push(Warning::NotConverged {
            stage: stage.to_string(),
            iterations: report.iterations,
        });
    }

    let p = model.evaluate(r, &params);
    let fitted: Vec<f64> = (k * DVector::from_column_slice(&p)).iter().copied().collect();
    let res = residual(&params);
    let residual_norm = res.iter().map(|e| e * e).sum::<f64>().sqrt();
    let jacobian = numerical_jacobian(&residual, &params, &bounds);
    let covariance = gauss_newton_covariance(&jacobian, &res, options.noise_std)?;
    debug!(
        "parametric fit ({stage}): {} iterations, residual = {residual_norm:.4e}",
        report.iterations
    );

    Ok(ParametricFit {
        p,
        params,
        fitted,
        residual_norm,
        convergence: report,
        clipped,
        covariance,
        warnings,
    })
}

pub(crate) fn validate_bounds(bounds: &[(f64, f64)]) -> DeerResult<()> {
    if let Some(i) = bounds
        .iter()
        .position(|&(lo, hi)| lo.is_nan() || hi.is_nan() || lo > hi)
    {
        return Err(DeerError::invalid(format!(
            "bounds of parameter {i} are inverted or NaN: {:?}",
            bounds[i]
        )));
    }
    Ok(())
}

/// `K Φ` for basis functions `Φ` given as one vector per column.
fn basis_design(
    k: &DMatrix<f64>,
    columns: &[Vec<f64>],
    n_linear: usize,
) -> DeerResult<DMatrix<f64>> {
    ensure_len("basis functions", columns.len(), n_linear)?;
    for col in columns {
        ensure_len("basis function", col.len(), k.ncols())?;
    }
    let phi = DMatrix::from_fn(k.ncols(), n_linear, |i, j| columns[j][i]);
    Ok(k * phi)
}

/// Solution of a separable least-squares problem.
#[derive(Debug, Clone)]
pub(crate) struct SeparableOutcome {
    pub nonlinear: Vec<f64>,
    pub linear: Vec<f64>,
    pub report: ConvergenceReport,
}

/// Minimise `‖A(θ) a − y‖` over box-bounded `θ` and linear `a`.
///
/// The outer Levenberg–Marquardt search sees `θ` only; for each trial `θ`
/// the linear parameters are solved exactly, by NNLS when `nonneg`. A design
/// that cannot be built counts as a rejected trial.
pub(crate) fn separable_least_squares<D>(
    design: D,
    y: &DVector<f64>,
    start: &[f64],
    bounds: &[(f64, f64)],
    nonneg: bool,
    criterion: Convergence,
) -> DeerResult<SeparableOutcome>
where
    D: Fn(&[f64]) -> DeerResult<DMatrix<f64>>,
{
    let solve = |theta: &[f64]| -> Option<(DMatrix<f64>, DVector<f64>)> {
        let a = design(theta).ok()?;
        let x = linear_parameters(&a, y, nonneg)?;
        Some((a, x))
    };
    let residual = |theta: &[f64]| -> Vec<f64> {
        match solve(theta) {
            Some((a, x)) => (a * x - y).iter().copied().collect(),
            None => vec![f64::NAN; y.len()],
        }
    };

    let (nonlinear, report) = if start.is_empty() {
        (Vec::new(), ConvergenceReport::direct(criterion))
    } else {
        let out = levenberg_marquardt(&residual, start, bounds, criterion)?;
        (out.x, out.report)
    };
    let (_, linear) = solve(&nonlinear)
        .ok_or_else(|| DeerError::numerical("linear parameters could not be solved"))?;
    Ok(SeparableOutcome {
        nonlinear,
        linear: linear.iter().copied().collect(),
        report,
    })
}

fn linear_parameters(a: &DMatrix<f64>, y: &DVector<f64>, nonneg: bool) -> Option<DVector<f64>> {
    if nonneg {
        let ata = a.transpose() * a;
        let aty = a.transpose() * y;
        Some(nnls(NnlsSolver::Fnnls, &ata, &aty, Convergence::default()).x)
    } else {
        solve_least_squares(a, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KernelOptions;
    use crate::kernel::build_kernel;
    use crate::math::linspace;
    use crate::models::{BasisShape, Mixture};

    #[test]
    fn recovers_single_gaussian() {
        let t = linspace(0.0, 3.0, 200);
        let r = linspace(2.0, 6.0, 120);
        let k = build_kernel(&t, &r, &[], &KernelOptions::default()).unwrap();
        let truth = BasisShape::Gaussian.evaluate(&r, &[3.8, 0.6]);
        let v: Vec<f64> = (&k * DVector::from_vec(truth.clone())).iter().copied().collect();

        let fit = fit_parametric(
            &k,
            &v,
            &r,
            &BasisShape::Gaussian,
            Some(&[3.3, 0.9]),
            None,
            &ParametricOptions::default(),
        )
        .unwrap();
        assert!(!fit.clipped);
        assert!((fit.params[0] - 3.8).abs() < 1e-6);
        assert!((fit.params[1] - 0.6).abs() < 1e-6);
        assert!(fit.warnings.is_empty());
    }

    #[test]
    fn out_of_bounds_start_is_clipped_and_flagged() {
        let t = linspace(0.0, 2.0, 80);
        let r = linspace(2.0, 5.0, 60);
        let k = build_kernel(&t, &r, &[], &KernelOptions::default()).unwrap();
        let truth = BasisShape::Gaussian.evaluate(&r, &[3.0, 0.5]);
        let v: Vec<f64> = (&k * DVector::from_vec(truth)).iter().copied().collect();

        let fit = fit_parametric(
            &k,
            &v,
            &r,
            &BasisShape::Gaussian,
            Some(&[30.0, 0.5]),
            None,
            &ParametricOptions::default(),
        )
        .unwrap();
        assert!(fit.clipped);
        assert!(matches!(
            fit.warnings.first(),
            Some(Warning::ParametersClipped { indices }) if indices == &vec![0]
        ));
    }

    #[test]
    fn rejects_inconsistent_inputs() {
        let k = DMatrix::zeros(3, 2);
        let opts = ParametricOptions::default();
        let g = BasisShape::Gaussian;
        assert!(fit_parametric(&k, &[1.0, 2.0], &[1.0, 2.0], &g, None, None, &opts).is_err());
        assert!(fit_parametric(&k, &[1.0; 3], &[1.0, 2.0], &g, Some(&[1.0]), None, &opts).is_err());
        let inverted = [(2.0, 1.0), (0.0, 1.0)];
        let out = fit_parametric(&k, &[1.0; 3], &[1.0, 2.0], &g, None, Some(&inverted), &opts);
        assert!(out.is_err());
    }

    #[test]
    fn amplitudes_are_solved_exactly() {
        let t = linspace(0.0, 2.5, 150);
        let r = linspace(2.0, 6.0, 100);
        let k = build_kernel(&t, &r, &[], &KernelOptions::default()).unwrap();
        let mix = Mixture::new(BasisShape::Gaussian, 1);
        let truth = mix.evaluate(&r, &[3.5, 0.7, 0.8]);
        let v: Vec<f64> = (&k * DVector::from_vec(truth)).iter().copied().collect();

        // A wildly wrong amplitude start does not matter.
        let start = [3.5, 0.7, 50.0];
        let fit = fit_parametric(&k, &v, &r, &mix, Some(&start), None, &Default::default())
            .unwrap();
        assert!((fit.params[2] - 0.8).abs() < 1e-8);
        assert!(fit.residual_norm < 1e-8);
        assert_eq!(fit.covariance.shape(), (3, 3));
    }

    #[test]
    fn bounded_amplitudes_are_searched_jointly() {
        let t = linspace(0.0, 2.5, 150);
        let r = linspace(2.0, 6.0, 100);
        let k = build_kernel(&t, &r, &[], &KernelOptions::default()).unwrap();
        let mix = Mixture::new(BasisShape::Gaussian, 1);
        let truth = mix.evaluate(&r, &[3.5, 0.7, 0.8]);
        let v: Vec<f64> = (&k * DVector::from_vec(truth)).iter().copied().collect();

        let bounds = [(2.0, 6.0), (0.1, 2.0), (0.0, 2.0)];
        let start = [3.2, 0.9, 0.5];
        let opts = ParametricOptions::default();
        let fit = fit_parametric(&k, &v, &r, &mix, Some(&start), Some(&bounds), &opts).unwrap();
        assert!((fit.params[0] - 3.5).abs() < 1e-5);
        assert!((fit.params[2] - 0.8).abs() < 1e-5);
    }
}
