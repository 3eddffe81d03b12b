//! Orientation-averaged dipolar kernel of a single pathway.
//!
//! For two spins at distance `r` the dipolar angular frequency is
//!
//! ```text
//! ω(r) = (μ0 / 2) μB² g1 g2 / (h r³)
//! ```
//!
//! and the powder-averaged oscillation over `z = cos θ` is
//!
//! ```text
//! K(t, r) = ∫₀¹ cos(ω(r) t (1 − 3z²)) dz
//! ```
//!
//! Units: `t` in µs, `r` in nm, `ω` in rad/µs.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::domain::{KernelMethod, KernelOptions, Pathway};
use crate::math::fresnel;

/// Bohr magneton (J/T).
const MU_B: f64 = 9.274_010_078_3e-24;
/// Vacuum permeability (T·m/A).
const MU_0: f64 = 1.256_637_062_12e-6;
/// Planck constant (J·s).
const PLANCK: f64 = 6.626_070_15e-34;

/// Below this `|ω t|` the kernel is evaluated by its Taylor expansion.
const SMALL_PHASE: f64 = 1e-6;

/// Dipolar angular frequency constant `ω(r)·r³` in rad/µs·nm³.
pub fn dipolar_constant(g: [f64; 2]) -> f64 {
    // Hz·m³ -> MHz·nm³ is a factor 1e27 · 1e-6.
    (MU_0 / 2.0) * MU_B * MU_B * g[0] * g[1] / PLANCK * 1e21
}

/// Dipolar angular frequency at distance `r` (nm), in rad/µs.
pub fn dipolar_frequency(r: f64, g: [f64; 2]) -> f64 {
    dipolar_constant(g) / (r * r * r)
}

/// Closed-form powder average as a function of the phase `x = ω t`.
///
/// `K = √(π/(6|x|)) [cos|x| C(√(6|x|/π)) + sin|x| S(√(6|x|/π))]`, an even
/// function of `x` with `K(0) = 1`.
pub fn fresnel_kernel_value(x: f64) -> f64 {
    let x = x.abs();
    if x < SMALL_PHASE {
        // ∫₀¹ (1 − 3z²)² dz / 2 = 2/5
        return 1.0 - 0.4 * x * x;
    }
    let z = (6.0 * x / PI).sqrt();
    let (c, s) = fresnel(z);
    (c * x.cos() + s * x.sin()) / z
}

/// Midpoint quadrature of the powder average over `knots` orientations.
///
/// With an excitation bandwidth `Δω`, each orientation is weighted by
/// `exp(−(ω(1−3z²))²/Δω²)`; the result is then the excited fraction rather
/// than a kernel normalized to one at `t = 0`.
pub fn grid_kernel_value(omega: f64, t: f64, knots: usize, bandwidth: Option<f64>) -> f64 {
    let knots = knots.max(1);
    let h = 1.0 / knots as f64;
    let mut acc = 0.0;
    for i in 0..knots {
        let z = (i as f64 + 0.5) * h;
        let w = omega * (1.0 - 3.0 * z * z);
        let weight = match bandwidth {
            Some(bw) if bw > 0.0 => (-(w * w) / (bw * bw)).exp(),
            _ => 1.0,
        };
        acc += weight * (w * t).cos();
    }
    acc * h
}

impl Pathway {
    /// Unit-amplitude kernel of this pathway at already shifted times
    /// `t − T0`; the harmonic order scales the effective dipolar frequency.
    ///
    /// Rows follow `time_shifted`, columns follow `r`. No grid-spacing
    /// weight is applied here.
    pub fn elementary_kernel(
        &self,
        time_shifted: &[f64],
        r: &[f64],
        options: &KernelOptions,
    ) -> DMatrix<f64> {
        let n = self.harmonic.max(1) as f64;
        let omegas: Vec<f64> = r.iter().map(|&ri| dipolar_frequency(ri, options.g)).collect();

        // Columns are independent; evaluate them in parallel.
        let columns: Vec<Vec<f64>> = omegas
            .par_iter()
            .map(|&omega| {
                time_shifted
                    .iter()
                    .map(|&ts| match options.method {
                        KernelMethod::Fresnel => fresnel_kernel_value(omega * n * ts),
                        KernelMethod::Grid {
                            knots,
                            excitation_bandwidth,
                        } => grid_kernel_value(omega, n * ts, knots, excitation_bandwidth),
                    })
                    .collect()
            })
            .collect();

        DMatrix::from_fn(time_shifted.len(), r.len(), |i, j| columns[j][i])
    }
}
