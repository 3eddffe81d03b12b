//! Dense linear algebra helpers on top of nalgebra.
//!
//! The fitting code repeatedly solves small symmetric positive (semi)definite
//! systems of the form
//!
//! ```text
//! (KᵀK + α² LᵀL) P = KᵀV
//! ```
//!
//! Implementation choices:
//! - Cholesky for the regularized normal equations (SPD whenever α > 0 and
//!   `K` and `L` share no null space).
//! - SVD for tall, possibly rank-deficient least-squares problems
//!   (nalgebra's `QR::solve` is intended for square systems).
//! - Pseudo-inverses with a relative singular-value cutoff when a
//!   covariance matrix has to be formed from a singular information matrix.

use nalgebra::{DMatrix, DVector};

/// Relative singular value below which a direction counts as null.
pub const RANK_RTOL: f64 = 1e-12;

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-12, 1e-10, 1e-8] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Solve `A x = b` for symmetric positive definite `A`.
pub fn cholesky_solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let chol = a.clone().cholesky()?;
    let x = chol.solve(b);
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Inverse of a symmetric positive definite matrix, falling back to the
/// pseudo-inverse when the Cholesky factorization fails.
pub fn spd_inverse(a: &DMatrix<f64>) -> DMatrix<f64> {
    match a.clone().cholesky() {
        Some(chol) => chol.inverse(),
        None => pseudo_inverse(a, RANK_RTOL),
    }
}

/// Moore–Penrose pseudo-inverse with a relative singular value cutoff.
pub fn pseudo_inverse(a: &DMatrix<f64>, rtol: f64) -> DMatrix<f64> {
    let svd = a.clone().svd(true, true);
    let smax = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    let cutoff = (smax * rtol).max(f64::MIN_POSITIVE);
    let (Some(u), Some(v_t)) = (svd.u.as_ref(), svd.v_t.as_ref()) else {
        return DMatrix::zeros(a.ncols(), a.nrows());
    };

    let k = svd.singular_values.len();
    let mut out = DMatrix::zeros(a.ncols(), a.nrows());
    for idx in 0..k {
        let s = svd.singular_values[idx];
        if s <= cutoff {
            continue;
        }
        let vi = v_t.row(idx).transpose();
        let ui = u.column(idx);
        out += (vi * ui.transpose()) / s;
    }
    out
}

/// Number of singular values above `rtol` times the largest one.
pub fn numerical_rank(a: &DMatrix<f64>, rtol: f64) -> usize {
    let sv = a.clone().singular_values();
    let smax = sv.iter().copied().fold(0.0_f64, f64::max);
    if smax == 0.0 {
        return 0;
    }
    sv.iter().filter(|&&s| s > smax * rtol).count()
}

/// Normal-equation components of the Tikhonov problem:
/// `(KᵀK + α² LᵀL, KᵀV)`.
pub fn regularized_normal_equations(
    k: &DMatrix<f64>,
    v: &DVector<f64>,
    l: &DMatrix<f64>,
    alpha: f64,
) -> (DMatrix<f64>, DVector<f64>) {
    let ktk = k.transpose() * k;
    let ltl = l.transpose() * l;
    (ktk + ltl * (alpha * alpha), k.transpose() * v)
}

/// Symmetrize in place, `(A + Aᵀ)/2`.
pub fn symmetrize(a: &mut DMatrix<f64>) {
    let n = a.nrows().min(a.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let m = 0.5 * (a[(i, j)] + a[(j, i)]);
            a[(i, j)] = m;
            a[(j, i)] = m;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn cholesky_matches_direct_solution() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 2.0]);
        let x = cholesky_solve(&a, &b).unwrap();
        let back = &a * &x;
        assert!((back - b).norm() < 1e-12);
    }

    #[test]
    fn pseudo_inverse_of_rank_one_matrix() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let p = pseudo_inverse(&a, RANK_RTOL);
        // A⁺ = A / 4 for this matrix.
        for v in p.iter() {
            assert!((v - 0.25).abs() < 1e-12);
        }
        assert_eq!(numerical_rank(&a, RANK_RTOL), 1);
    }

    #[test]
    fn spd_inverse_roundtrip() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 0.5, 0.0, 0.5, 2.0]);
        let inv = spd_inverse(&a);
        let id = &a * inv;
        assert!((id - DMatrix::identity(3, 3)).norm() < 1e-12);
    }
}
