//! Bounded Levenberg–Marquardt for small nonlinear least-squares problems.
//!
//! Minimises `½‖f(x)‖²` subject to box bounds. Steps are computed from the
//! damped normal equations with Marquardt's diagonal scaling and projected
//! back onto the box. The Jacobian is approximated by finite differences
//! (`finitediff`) that never step outside the box.

use finitediff::FiniteDiff;
use nalgebra::{DMatrix, DVector};

use crate::domain::{Convergence, ConvergenceReport};
use crate::error::{DeerError, DeerResult};
use crate::math::linalg::{cholesky_solve, solve_least_squares};

/// Initial damping relative to the largest diagonal entry of `JᵀJ`.
const TAU: f64 = 1e-3;
/// Damping beyond which the search is considered stalled.
const MAX_DAMPING: f64 = 1e16;
/// Room a parameter needs on both sides of the box for a central step.
const FD_MARGIN: f64 = 1e-5;

/// Result of a bounded least-squares solve.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub x: Vec<f64>,
    /// Residual vector `f(x)` at the solution.
    pub residual: Vec<f64>,
    /// Jacobian at the solution.
    pub jacobian: DMatrix<f64>,
    pub report: ConvergenceReport,
}

/// Project `x` onto the box.
pub fn project(x: &mut [f64], bounds: &[(f64, f64)]) {
    for (v, &(lo, hi)) in x.iter_mut().zip(bounds) {
        *v = v.clamp(lo, hi);
    }
}

/// Finite-difference Jacobian of `f` at `x`, one row per residual and one
/// column per parameter.
///
/// Central differences when every parameter has room on both sides of the
/// box. Otherwise forward differences taken from a base point pulled just
/// inside any upper bound, so no evaluation leaves the box.
pub fn numerical_jacobian<F>(f: &F, x: &[f64], bounds: &[(f64, f64)]) -> DMatrix<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    if x.is_empty() {
        return DMatrix::zeros(f(x).len(), 0);
    }
    let g = |p: &Vec<f64>| f(p);
    let interior = x
        .iter()
        .zip(bounds)
        .all(|(&v, &(lo, hi))| v - lo >= FD_MARGIN && hi - v >= FD_MARGIN);
    // finitediff returns one inner vector per parameter.
    let columns = if interior {
        x.to_vec().central_jacobian(&g)
    } else {
        let base: Vec<f64> = x
            .iter()
            .zip(bounds)
            .map(|(&v, &(lo, hi))| v.min(hi - FD_MARGIN).max(lo))
            .collect();
        base.forward_jacobian(&g)
    };
    let m = columns[0].len();
    DMatrix::from_fn(m, x.len(), |i, j| columns[j][i])
}

/// Minimise `½‖f(x)‖²` over the box `bounds`, starting from `x0`.
///
/// `x0` is projected onto the box first. Stops when the relative decrease of
/// the cost or the relative step falls below `criterion.tol`, or after
/// `criterion.max_iter` Jacobian evaluations.
pub fn levenberg_marquardt<F>(
    f: F,
    x0: &[f64],
    bounds: &[(f64, f64)],
    criterion: Convergence,
) -> DeerResult<LmOutcome>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    if bounds.len() != x0.len() {
        return Err(DeerError::invalid(format!(
            "{} bounds given for {} parameters",
            bounds.len(),
            x0.len()
        )));
    }
    let mut x = x0.to_vec();
    project(&mut x, bounds);
    let mut fx = f(&x);
    if fx.iter().any(|v| !v.is_finite()) {
        return Err(DeerError::numerical("residual is not finite at the start point"));
    }
    let mut cost = half_sq_norm(&fx);

    let mut jac = numerical_jacobian(&f, &x, bounds);
    let mut mu = TAU
        * (jac.transpose() * &jac)
            .diagonal()
            .iter()
            .copied()
            .fold(0.0_f64, f64::max)
            .max(f64::MIN_POSITIVE);
    let mut nu = 2.0;
    let mut iterations = 0;
    let mut converged = false;
    let mut last_change = f64::INFINITY;

    while iterations < criterion.max_iter {
        iterations += 1;
        if cost == 0.0 {
            converged = true;
            last_change = 0.0;
            break;
        }
        let jtj = jac.transpose() * &jac;
        let grad = jac.transpose() * DVector::from_column_slice(&fx);
        let scale: Vec<f64> = jtj.diagonal().iter().map(|d| d.max(1e-12)).collect();

        // Inner loop: raise the damping until a step decreases the cost.
        let mut accepted = None;
        while mu < MAX_DAMPING {
            let mut damped = jtj.clone();
            for i in 0..scale.len() {
                damped[(i, i)] += mu * scale[i];
            }
            let rhs = -&grad;
            let Some(delta) =
                cholesky_solve(&damped, &rhs).or_else(|| solve_least_squares(&damped, &rhs))
            else {
                mu *= nu;
                nu *= 2.0;
                continue;
            };

            let mut trial: Vec<f64> = x.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
            project(&mut trial, bounds);
            let f_trial = f(&trial);
            let cost_trial = if f_trial.iter().all(|v| v.is_finite()) {
                half_sq_norm(&f_trial)
            } else {
                f64::INFINITY
            };

            if cost_trial < cost {
                let step =
                    DVector::from_iterator(x.len(), trial.iter().zip(&x).map(|(a, b)| a - b));
                let predicted = -(grad.dot(&step) + 0.5 * step.dot(&(&jtj * &step)));
                let gain = if predicted > 0.0 {
                    (cost - cost_trial) / predicted
                } else {
                    0.0
                };
                mu *= (1.0 - (2.0 * gain - 1.0).powi(3)).max(1.0 / 3.0);
                nu = 2.0;
                accepted = Some((trial, f_trial, cost_trial, step.norm()));
                break;
            }
            mu *= nu;
            nu *= 2.0;
        }

        let Some((trial, f_trial, cost_trial, step_norm)) = accepted else {
            // No decreasing step at any damping: a (constrained) minimum.
            converged = true;
            last_change = 0.0;
            break;
        };

        last_change = (cost - cost_trial) / cost;
        let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        x = trial;
        fx = f_trial;
        cost = cost_trial;
        jac = numerical_jacobian(&f, &x, bounds);

        if last_change < criterion.tol || step_norm <= criterion.tol * (criterion.tol + x_norm) {
            converged = true;
            break;
        }
    }

    Ok(LmOutcome {
        x,
        residual: fx,
        jacobian: jac,
        report: ConvergenceReport {
            criterion,
            iterations,
            converged,
            last_change,
        },
    })
}

fn half_sq_norm(v: &[f64]) -> f64 {
    0.5 * v.iter().map(|x| x * x).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREE: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);

    #[test]
    fn fits_exponential_decay() {
        let t: Vec<f64> = (0..40).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = t.iter().map(|&ti| 2.5 * (-1.3 * ti).exp()).collect();
        let f = |p: &[f64]| -> Vec<f64> {
            t.iter()
                .zip(&y)
                .map(|(&ti, &yi)| p[0] * (-p[1] * ti).exp() - yi)
                .collect()
        };
        let criterion = Convergence::new(1e-12, 200);
        let out = levenberg_marquardt(f, &[1.0, 0.5], &[FREE, FREE], criterion).unwrap();
        assert!(out.report.converged);
        assert!((out.x[0] - 2.5).abs() < 1e-7);
        assert!((out.x[1] - 1.3).abs() < 1e-7);
    }

    #[test]
    fn respects_active_bound() {
        // Unconstrained optimum at x = 3, bound at 2.
        let f = |p: &[f64]| vec![p[0] - 3.0, 0.1 * (p[0] - 3.0)];
        let bounds = [(f64::NEG_INFINITY, 2.0)];
        let out = levenberg_marquardt(f, &[0.0], &bounds, Convergence::default()).unwrap();
        assert!((out.x[0] - 2.0).abs() < 1e-12);
        assert!(out.report.converged);
    }

    #[test]
    fn start_is_projected() {
        let f = |p: &[f64]| vec![p[0] - 0.5];
        let out = levenberg_marquardt(f, &[10.0], &[(0.0, 1.0)], Convergence::default()).unwrap();
        assert!((out.x[0] - 0.5).abs() < 1e-8);
    }

    #[test]
    fn jacobian_matches_analytic_derivative() {
        let f = |p: &[f64]| vec![p[0].sin() * p[1], p[1] * p[1]];
        let x = [0.7, 1.5];
        let j = numerical_jacobian(&f, &x, &[FREE, FREE]);
        assert_eq!(j.shape(), (2, 2));
        assert!((j[(0, 0)] - 0.7_f64.cos() * 1.5).abs() < 1e-6);
        assert!((j[(0, 1)] - 0.7_f64.sin()).abs() < 1e-6);
        assert!((j[(1, 1)] - 3.0).abs() < 1e-6);
        assert_eq!(j[(1, 0)], 0.0);
    }

    #[test]
    fn jacobian_never_evaluates_outside_the_box() {
        let highest = std::cell::Cell::new(f64::NEG_INFINITY);
        let f = |p: &[f64]| {
            highest.set(highest.get().max(p[0]));
            vec![p[0] * p[0], 2.0 * p[1]]
        };
        let j = numerical_jacobian(&f, &[1.0, 0.0], &[(0.0, 1.0), FREE]);
        assert!(highest.get() <= 1.0);
        assert!((j[(0, 0)] - 2.0).abs() < 1e-4);
        assert!((j[(1, 1)] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_bounds_are_rejected() {
        let f = |p: &[f64]| vec![p[0]];
        assert!(levenberg_marquardt(f, &[1.0, 2.0], &[FREE], Convergence::default()).is_err());
    }
}
