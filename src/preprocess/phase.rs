//! Phase correction of complex dipolar signals.
//!
//! A quadrature-detected signal `V` carries an unknown receiver phase. The
//! corrected signal is `V · e^{iφ}` where `φ` minimises the norm of the
//! imaginary part (optionally minus a constant offset) over the tail of the
//! trace, where the dipolar modulation has mostly decayed. A signal rotated
//! by `θ` is therefore corrected by `φ = −θ (mod 2π)`.

use argmin::core::{CostFunction, Error, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use log::debug;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

use crate::domain::{Convergence, ConvergenceReport};
use crate::error::{DeerError, DeerResult};

/// Options of [`correct_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PhaseOptions {
    /// Apply this phase (radians) instead of fitting one.
    pub phase: Option<f64>,
    /// Imaginary offset; fixed unless `fit_offset` is set, in which case it
    /// is the start value.
    pub offset: Option<f64>,
    pub fit_offset: bool,
}

/// Phase-corrected signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseCorrection {
    pub real: Vec<f64>,
    pub imag: Vec<f64>,
    /// Applied phase in `[0, 2π)`.
    pub phase: f64,
    pub offset: f64,
    pub convergence: ConvergenceReport,
}

/// Imaginary misfit over the trace tail, with the phase and/or the offset
/// taken from the parameter vector (phase first).
struct ImagMisfit<'a> {
    tail: &'a [Complex64],
    phase: Option<f64>,
    offset: Option<f64>,
}

impl CostFunction for ImagMisfit<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        let mut free = x.iter().copied();
        let phase = self.phase.or_else(|| free.next()).unwrap_or(0.0);
        let offset = self.offset.or_else(|| free.next()).unwrap_or(0.0);
        Ok(imag_misfit(self.tail, phase, offset))
    }
}

/// Find and apply the phase that moves the signal into the real channel.
///
/// If the corrected real part sums to a negative value the signal is
/// negated and `φ` shifted by `π`, so the returned real part is positive
/// on balance.
pub fn correct_phase(v: &[Complex64], options: &PhaseOptions) -> DeerResult<PhaseCorrection> {
    if v.is_empty() {
        return Err(DeerError::invalid("signal is empty"));
    }
    if let Some(i) = v.iter().position(|z| !(z.re.is_finite() && z.im.is_finite())) {
        return Err(DeerError::invalid(format!("signal[{i}] is not finite ({})", v[i])));
    }
    if let Some(phase) = options.phase.filter(|p| !p.is_finite()) {
        return Err(DeerError::invalid(format!("phase {phase} is not finite")));
    }
    if let Some(offset) = options.offset.filter(|o| !o.is_finite()) {
        return Err(DeerError::invalid(format!("offset {offset} is not finite")));
    }

    let tail = &v[v.len() / 8..];
    let criterion = Convergence::new(1e-12, 2_000);

    let (mut phase, mut offset, convergence) = match (options.phase, options.fit_offset) {
        (Some(phase), false) => {
            let offset = options.offset.unwrap_or(0.0);
            (phase, offset, ConvergenceReport::direct(criterion))
        }
        (Some(phase), true) => {
            let start = options.offset.unwrap_or_else(|| imag_mean(tail, phase));
            let problem = ImagMisfit {
                tail,
                phase: Some(phase),
                offset: None,
            };
            let (x, report) = minimise(problem, &[start], criterion)?;
            (phase, x[0], report)
        }
        (None, false) => {
            let offset = options.offset.unwrap_or(0.0);
            let problem = ImagMisfit {
                tail,
                phase: None,
                offset: Some(offset),
            };
            let (x, report) = minimise(problem, &[-mean_angle(tail)], criterion)?;
            (x[0], offset, report)
        }
        (None, true) => {
            let seed = -mean_angle(tail);
            let start = options.offset.unwrap_or_else(|| imag_mean(tail, seed));
            let problem = ImagMisfit {
                tail,
                phase: None,
                offset: None,
            };
            let (x, report) = minimise(problem, &[seed, start], criterion)?;
            (x[0], x[1], report)
        }
    };

    let rotation = Complex64::from_polar(1.0, phase);
    let mut corrected: Vec<Complex64> = v.iter().map(|z| z * rotation).collect();
    if corrected.iter().map(|z| z.re).sum::<f64>() < 0.0 {
        corrected.iter_mut().for_each(|z| *z = -*z);
        phase += PI;
        offset = -offset;
    }
    let phase = phase.rem_euclid(TAU);
    debug!("phase correction: phase = {phase:.6} rad, offset = {offset:.3e}");

    Ok(PhaseCorrection {
        real: corrected.iter().map(|z| z.re).collect(),
        imag: corrected.iter().map(|z| z.im).collect(),
        phase,
        offset,
        convergence,
    })
}

/// Nelder–Mead from `start`, stopping once the spread of the simplex costs
/// drops below `criterion.tol`.
fn minimise(
    problem: ImagMisfit<'_>,
    start: &[f64],
    criterion: Convergence,
) -> DeerResult<(Vec<f64>, ConvergenceReport)> {
    let mut simplex = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[i] += if start[i] != 0.0 { 0.05 * start[i] } else { 2.5e-4 };
        simplex.push(vertex);
    }
    let solver = NelderMead::new(simplex).with_sd_tolerance(criterion.tol)?;
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(criterion.max_iter as u64))
        .run()?;
    let state = result.state();
    let x = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| DeerError::numerical("phase search returned no parameters"))?;
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    let report = ConvergenceReport {
        criterion,
        iterations: state.get_iter() as usize,
        converged,
        last_change: if converged { 0.0 } else { f64::INFINITY },
    };
    Ok((x, report))
}

/// `‖Im(V e^{iφ}) − offset‖` over `v`.
fn imag_misfit(v: &[Complex64], phase: f64, offset: f64) -> f64 {
    let rotation = Complex64::from_polar(1.0, phase);
    v.iter()
        .map(|z| {
            let d = (z * rotation).im - offset;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn imag_mean(v: &[Complex64], phase: f64) -> f64 {
    let rotation = Complex64::from_polar(1.0, phase);
    v.iter().map(|z| (z * rotation).im).sum::<f64>() / v.len() as f64
}

fn mean_angle(v: &[Complex64]) -> f64 {
    v.iter().map(|z| z.arg()).sum::<f64>() / v.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angular_distance(a: f64, b: f64) -> f64 {
        let d = (a - b).rem_euclid(TAU);
        d.min(TAU - d)
    }

    fn rotated(signal: &[f64], phase: f64, offset: f64) -> Vec<Complex64> {
        let rot = Complex64::from_polar(1.0, phase);
        signal
            .iter()
            .map(|&s| Complex64::new(s, offset) * rot)
            .collect()
    }

    fn decay() -> Vec<f64> {
        (0..200).map(|i| 0.3 + 0.7 * (-(i as f64) / 40.0).exp()).collect()
    }

    #[test]
    fn recovers_applied_rotation() {
        let s = decay();
        let v = rotated(&s, 0.9, 0.0);
        let out = correct_phase(&v, &PhaseOptions::default()).unwrap();
        assert!(out.convergence.converged);
        // Undoing a rotation by 0.9 takes 2π − 0.9.
        assert!(angular_distance(out.phase, TAU - 0.9) < 1e-6);
        assert!((out.phase - 5.383185307179586).abs() < 1e-6);
        for (a, b) in out.real.iter().zip(&s) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!(out.imag.iter().all(|x| x.abs() < 1e-6));
    }

    #[test]
    fn negative_real_part_is_flipped() {
        let s: Vec<f64> = decay().iter().map(|x| -x).collect();
        let v = rotated(&s, 0.4, 0.0);
        let out = correct_phase(&v, &PhaseOptions::default()).unwrap();
        assert!(angular_distance(out.phase, PI - 0.4) < 1e-6);
        assert!(out.real.iter().sum::<f64>() > 0.0);
    }

    #[test]
    fn fixed_phase_is_applied_directly() {
        let s = decay();
        let v = rotated(&s, 1.2, 0.0);
        let opts = PhaseOptions {
            phase: Some(-1.2),
            ..PhaseOptions::default()
        };
        let out = correct_phase(&v, &opts).unwrap();
        assert_eq!(out.convergence.iterations, 1);
        assert!((out.phase - (TAU - 1.2)).abs() < 1e-12);
        assert!((out.real[0] - s[0]).abs() < 1e-12);
    }

    #[test]
    fn fits_imaginary_offset() {
        let s = decay();
        let v = rotated(&s, 0.5, 0.02);
        let opts = PhaseOptions {
            phase: Some(-0.5),
            fit_offset: true,
            ..PhaseOptions::default()
        };
        let out = correct_phase(&v, &opts).unwrap();
        assert!((out.offset - 0.02).abs() < 1e-6);
    }

    #[test]
    fn fits_phase_and_offset_together() {
        let s = decay();
        let v = rotated(&s, -0.7, 0.01);
        let opts = PhaseOptions {
            fit_offset: true,
            ..PhaseOptions::default()
        };
        let out = correct_phase(&v, &opts).unwrap();
        assert!(angular_distance(out.phase, 0.7) < 1e-4);
        assert!((out.offset - 0.01).abs() < 1e-4);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(correct_phase(&[], &PhaseOptions::default()).is_err());
        let v = vec![Complex64::new(f64::NAN, 0.0); 4];
        assert!(correct_phase(&v, &PhaseOptions::default()).is_err());
    }
}
