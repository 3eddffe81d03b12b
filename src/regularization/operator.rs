//! Finite-difference penalty operators.
//!
//! The operator of order `d` applies the `d`-th forward difference to a
//! distribution sampled on `n` points. Rows whose stencil would leave the
//! grid are dropped, so the matrix is `(n − d) × n`. Entries are the signed
//! binomial coefficients and are not scaled by the grid spacing.
//!
//! Total-variation and Huber penalties are handled by lagged-diffusivity
//! reweighting: row `i` of `L` is scaled by `√wᵢ`, with weights taken from
//! the previous solution, until the solution stops changing.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::domain::Penalty;
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{cholesky_solve, regularized_normal_equations, solve_least_squares};

/// Relative change of the solution that ends the reweighting.
const REWEIGHT_TOL: f64 = 1e-3;
const REWEIGHT_MAX_ITER: usize = 100;
/// Smoothing of `|x|` in the total-variation weights.
const TV_SMOOTHING: f64 = 1e-16;

/// Build the order-`order` difference operator for the grid `r`.
pub fn build_penalty_matrix(r: &[f64], order: usize) -> DeerResult<DMatrix<f64>> {
    ensure_finite("r", r)?;
    let n = r.len();
    if order >= n {
        return Err(DeerError::invalid(format!(
            "penalty order {order} needs more than {n} grid points"
        )));
    }

    let stencil = difference_stencil(order);
    let rows = n - order;
    let mut l = DMatrix::zeros(rows, n);
    for i in 0..rows {
        for (k, &c) in stencil.iter().enumerate() {
            l[(i, i + k)] = c;
        }
    }
    Ok(l)
}

/// Reweighted operator `W^{1/2} L` for the penalty at regularization
/// parameter `alpha`.
///
/// The quadratic problem `‖KP − V‖² + α²‖W^{1/2} L P‖²` shares its
/// stationary point with the non-quadratic one. Weights are
/// `1/√((LP)² + ε)` for total variation and `1/√(1 + (LP/η)²)` for Huber;
/// they start from the unconstrained Tikhonov solution. Tikhonov returns `L`
/// unchanged.
pub fn reweighted_penalty(
    k: &DMatrix<f64>,
    v: &[f64],
    l: &DMatrix<f64>,
    alpha: f64,
    penalty: Penalty,
) -> DeerResult<DMatrix<f64>> {
    penalty.validate()?;
    if penalty == Penalty::Tikhonov {
        return Ok(l.clone());
    }
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), k.nrows())?;
    ensure_len("penalty columns", l.ncols(), k.ncols())?;

    let vv = DVector::from_column_slice(v);
    let solve = |lw: &DMatrix<f64>| -> DeerResult<DVector<f64>> {
        let (a, ktv) = regularized_normal_equations(k, &vv, lw, alpha);
        cholesky_solve(&a, &ktv)
            .or_else(|| solve_least_squares(&a, &ktv))
            .ok_or_else(|| DeerError::numerical("reweighted penalty system is singular"))
    };

    let mut lw = l.clone();
    let mut p = solve(&lw)?;
    for iteration in 1..=REWEIGHT_MAX_ITER {
        let lp = l * &p;
        lw = l.clone();
        for (i, mut row) in lw.row_iter_mut().enumerate() {
            row *= penalty_weight(penalty, lp[i]).sqrt();
        }
        let next = solve(&lw)?;
        let change = (&next - &p).norm() / next.norm().max(f64::MIN_POSITIVE);
        p = next;
        if change < REWEIGHT_TOL {
            debug!("{penalty:?} reweighting converged after {iteration} iterations");
            return Ok(lw);
        }
    }
    debug!("{penalty:?} reweighting stopped after {REWEIGHT_MAX_ITER} iterations");
    Ok(lw)
}

fn penalty_weight(penalty: Penalty, x: f64) -> f64 {
    match penalty {
        Penalty::Tikhonov => 1.0,
        Penalty::Tv => 1.0 / (x * x + TV_SMOOTHING).sqrt(),
        Penalty::Huber { threshold } => 1.0 / (1.0 + (x / threshold).powi(2)).sqrt(),
    }
}

/// `(-1)^(d-k) · C(d, k)` for `k = 0..=d`.
fn difference_stencil(order: usize) -> Vec<f64> {
    let mut coeffs = vec![1.0_f64; order + 1];
    for k in 1..=order {
        coeffs[k] = coeffs[k - 1] * (order + 1 - k) as f64 / k as f64;
    }
    coeffs
        .into_iter()
        .enumerate()
        .map(|(k, c)| if (order - k) % 2 == 0 { c } else { -c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencils_are_signed_binomials() {
        assert_eq!(difference_stencil(0), vec![1.0]);
        assert_eq!(difference_stencil(1), vec![-1.0, 1.0]);
        assert_eq!(difference_stencil(2), vec![1.0, -2.0, 1.0]);
        assert_eq!(difference_stencil(3), vec![-1.0, 3.0, -3.0, 1.0]);
    }

    #[test]
    fn second_order_operator_shape_and_rows() {
        let r: Vec<f64> = (0..6).map(|i| 2.0 + 0.1 * i as f64).collect();
        let l = build_penalty_matrix(&r, 2).unwrap();
        assert_eq!(l.shape(), (4, 6));
        assert_eq!(
            l.row(1).iter().copied().collect::<Vec<_>>(),
            vec![0.0, 1.0, -2.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn order_zero_is_identity() {
        let l = build_penalty_matrix(&[1.0, 2.0, 3.0], 0).unwrap();
        assert_eq!(l, DMatrix::identity(3, 3));
    }

    #[test]
    fn annihilates_low_order_polynomials() {
        let r: Vec<f64> = (0..20).map(|i| 1.5 + 0.2 * i as f64).collect();
        let line: Vec<f64> = r.iter().map(|x| 3.0 * x - 1.0).collect();
        let l = build_penalty_matrix(&r, 2).unwrap();
        let out = l * nalgebra::DVector::from_vec(line);
        assert!(out.amax() < 1e-12);
    }

    fn smoothing_problem() -> (DMatrix<f64>, Vec<f64>, DMatrix<f64>) {
        let r: Vec<f64> = (0..30).map(|i| 2.0 + 0.1 * i as f64).collect();
        let k = DMatrix::from_fn(40, 30, |i, j| (-((i as f64) * 0.05 * r[j]).powi(2)).exp());
        let v: Vec<f64> = (0..40).map(|i| (-(i as f64) / 15.0).exp()).collect();
        (k, v, build_penalty_matrix(&r, 1).unwrap())
    }

    #[test]
    fn tikhonov_and_wide_huber_keep_the_operator() {
        let (k, v, l) = smoothing_problem();
        assert_eq!(reweighted_penalty(&k, &v, &l, 0.1, Penalty::Tikhonov).unwrap(), l);
        let wide = Penalty::Huber { threshold: 1e12 };
        let lw = reweighted_penalty(&k, &v, &l, 0.1, wide).unwrap();
        assert!((lw - &l).amax() < 1e-12);
    }

    #[test]
    fn huber_weights_never_exceed_one() {
        let (k, v, l) = smoothing_problem();
        let lw = reweighted_penalty(&k, &v, &l, 0.1, Penalty::Huber { threshold: 1e-3 }).unwrap();
        for (a, b) in lw.iter().zip(l.iter()) {
            assert!(a.abs() <= b.abs() + 1e-15);
        }
        assert!((&lw - &l).amax() > 0.0);
    }

    #[test]
    fn non_positive_huber_threshold_is_rejected() {
        let (k, v, l) = smoothing_problem();
        let bad = Penalty::Huber { threshold: 0.0 };
        assert!(reweighted_penalty(&k, &v, &l, 0.1, bad).is_err());
    }

    #[test]
    fn rejects_too_high_order() {
        assert!(build_penalty_matrix(&[1.0, 2.0], 2).is_err());
        assert!(build_penalty_matrix(&[], 0).is_err());
    }
}
