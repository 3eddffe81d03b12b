//! Non-negative least squares on normal-equation components.
//!
//! Both solvers take `AtA = KᵀK + α²LᵀL` and `Atb = KᵀV` and solve
//!
//! ```text
//! minimize ½ xᵀ AtA x − Atbᵀ x   subject to   x ≥ 0
//! ```
//!
//! which is the regularized problem `‖Kx − V‖² + α²‖Lx‖²` up to a constant.
//! Working on the `m × m` normal equations keeps every iteration independent
//! of the signal length.

use nalgebra::{DMatrix, DVector};

use crate::domain::{Convergence, ConvergenceReport, NnlsSolver};
use crate::math::linalg::{cholesky_solve, solve_least_squares};

/// Result of an NNLS solve.
#[derive(Debug, Clone)]
pub struct NnlsOutcome {
    pub x: DVector<f64>,
    pub report: ConvergenceReport,
}

/// Dispatch to the selected NNLS algorithm.
pub fn nnls(
    solver: NnlsSolver,
    ata: &DMatrix<f64>,
    atb: &DVector<f64>,
    criterion: Convergence,
) -> NnlsOutcome {
    match solver {
        NnlsSolver::Fnnls => fnnls(ata, atb, criterion),
        NnlsSolver::Bpp => nnls_bpp(ata, atb, criterion),
    }
}

/// Fast NNLS (Bro & de Jong, 1997), an accelerated Lawson–Hanson active set
/// method.
///
/// Terminates only at a KKT point: no inactive variable has a gradient
/// component above the tolerance. A variable that re-enters and is removed
/// again without moving `x` is blocked until `x` changes; if only blocked
/// violators remain the solve stops unconverged.
pub fn fnnls(ata: &DMatrix<f64>, atb: &DVector<f64>, criterion: Convergence) -> NnlsOutcome {
    let n = atb.len();
    let tol = kkt_tolerance(ata);

    let mut passive = vec![false; n];
    let mut blocked = vec![false; n];
    let mut x = DVector::<f64>::zeros(n);
    let mut w = atb - ata * &x;
    let mut f_old = 0.0;
    let mut last_change = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < criterion.max_iter {
        // Most violating inactive variable.
        let candidate = (0..n)
            .filter(|&i| !passive[i] && !blocked[i] && w[i] > tol)
            .max_by(|&a, &b| w[a].partial_cmp(&w[b]).unwrap_or(std::cmp::Ordering::Equal));
        let Some(t) = candidate else {
            converged = !(0..n).any(|i| !passive[i] && w[i] > tol);
            break;
        };
        iterations += 1;
        passive[t] = true;

        let mut s = solve_passive(ata, atb, &passive);

        // Inner loop: step back towards feasibility until all passive
        // components of the trial solution are positive.
        let mut inner = 0;
        while (0..n).any(|i| passive[i] && s[i] <= tol) && inner < criterion.max_iter {
            inner += 1;
            let mut step = f64::INFINITY;
            for i in 0..n {
                if passive[i] && s[i] <= tol {
                    let denom = x[i] - s[i];
                    if denom > 0.0 {
                        step = step.min(x[i] / denom);
                    }
                }
            }
            if !step.is_finite() {
                step = 0.0;
            }
            x += (&s - &x) * step;
            for i in 0..n {
                if passive[i] && x[i].abs() <= tol {
                    passive[i] = false;
                }
            }
            s = solve_passive(ata, atb, &passive);
        }

        if passive[t] {
            blocked.fill(false);
        } else if s == x {
            blocked[t] = true;
        }
        x = s;
        w = atb - ata * &x;

        let f_new = objective(ata, atb, &x);
        last_change = relative_change(f_old, f_new);
        f_old = f_new;
    }

    clip_negative(&mut x);
    NnlsOutcome {
        x,
        report: ConvergenceReport {
            criterion,
            iterations,
            converged,
            last_change,
        },
    }
}

/// Block principal pivoting (Kim & Park, 2011).
///
/// Exchanges whole blocks of infeasible variables between the passive and
/// active sets, with Murty's single-exchange rule as a backup against
/// cycling.
pub fn nnls_bpp(ata: &DMatrix<f64>, atb: &DVector<f64>, criterion: Convergence) -> NnlsOutcome {
    let n = atb.len();
    let tol = kkt_tolerance(ata);

    let mut passive = vec![false; n];
    let mut x = DVector::<f64>::zeros(n);
    let mut y = -atb.clone();
    let mut backup = 3;
    let mut best_infeasible = n + 1;
    let mut f_old = 0.0;
    let mut last_change = f64::INFINITY;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < criterion.max_iter {
        let infeasible: Vec<usize> = (0..n)
            .filter(|&i| (passive[i] && x[i] < -tol) || (!passive[i] && y[i] < -tol))
            .collect();
        if infeasible.is_empty() {
            converged = true;
            break;
        }
        iterations += 1;

        if infeasible.len() < best_infeasible {
            best_infeasible = infeasible.len();
            backup = 3;
            for &i in &infeasible {
                passive[i] = !passive[i];
            }
        } else if backup >= 1 {
            backup -= 1;
            for &i in &infeasible {
                passive[i] = !passive[i];
            }
        } else if let Some(&i) = infeasible.last() {
            passive[i] = !passive[i];
        }

        x = solve_passive(ata, atb, &passive);
        y = ata * &x - atb;
        for i in 0..n {
            if passive[i] {
                y[i] = 0.0;
            }
        }

        let f_new = objective(ata, atb, &x);
        last_change = relative_change(f_old, f_new);
        f_old = f_new;
    }

    clip_negative(&mut x);
    NnlsOutcome {
        x,
        report: ConvergenceReport {
            criterion,
            iterations,
            converged,
            last_change,
        },
    }
}

/// Solve the unconstrained sub-problem restricted to the passive set;
/// inactive components are zero.
fn solve_passive(ata: &DMatrix<f64>, atb: &DVector<f64>, passive: &[bool]) -> DVector<f64> {
    let idx: Vec<usize> = (0..passive.len()).filter(|&i| passive[i]).collect();
    let mut out = DVector::zeros(passive.len());
    if idx.is_empty() {
        return out;
    }

    let sub_a = ata.select_rows(&idx).select_columns(&idx);
    let sub_b = atb.select_rows(&idx);
    let sol = cholesky_solve(&sub_a, &sub_b).or_else(|| solve_least_squares(&sub_a, &sub_b));
    if let Some(sol) = sol {
        for (k, &i) in idx.iter().enumerate() {
            out[i] = sol[k];
        }
    }
    out
}

fn objective(ata: &DMatrix<f64>, atb: &DVector<f64>, x: &DVector<f64>) -> f64 {
    0.5 * x.dot(&(ata * x)) - atb.dot(x)
}

fn relative_change(old: f64, new: f64) -> f64 {
    (new - old).abs() / new.abs().max(old.abs()).max(f64::MIN_POSITIVE)
}

fn kkt_tolerance(ata: &DMatrix<f64>) -> f64 {
    // ‖A‖₁: maximum absolute column sum.
    let norm1 = ata
        .column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);
    10.0 * f64::EPSILON * norm1 * ata.nrows().max(1) as f64
}

/// Remove round-off negatives left by the passive-set solves.
fn clip_negative(x: &mut DVector<f64>) {
    for v in x.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}
