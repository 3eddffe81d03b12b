use std::f64::consts::TAU;

use approx::assert_abs_diff_eq;
use dipolar_fit::domain::KernelOptions;
use dipolar_fit::kernel::build_kernel;
use dipolar_fit::math::linspace;
use dipolar_fit::models::{BasisShape, DistributionModel};
use dipolar_fit::preprocess::{
    PhaseOptions, SpectrumMode, SpectrumOptions, Window, correct_phase, spectrum, spectrum_values,
};
use nalgebra::DVector;
use rustfft::num_complex::Complex64;

fn dipolar_signal(t: &[f64]) -> Vec<f64> {
    let r = linspace(2.0, 6.0, 80);
    let k = build_kernel(t, &r, &[], &KernelOptions::default()).unwrap();
    let p = BasisShape::Gaussian.evaluate(&r, &[3.5, 0.4]);
    (&k * DVector::from_vec(p)).iter().map(|x| 0.3 + 0.7 * x).collect()
}

#[test]
fn spectrum_values_match_full_spectrum() {
    let t = linspace(-0.1, 3.0, 256);
    let v = dipolar_signal(&t);
    for mode in [
        SpectrumMode::Magnitude,
        SpectrumMode::Absolute,
        SpectrumMode::Real,
        SpectrumMode::Imaginary,
    ] {
        for window in [Window::Hamming, Window::Hann, Window::None] {
            let opts = SpectrumOptions {
                points: None,
                window,
                mode,
            };
            let full = spectrum(&t, &v, &opts).unwrap();
            let values = spectrum_values(&t, &v, &opts).unwrap();
            assert_eq!(full.values.len(), 512);
            for (a, b) in full.values.iter().zip(&values) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
            }
        }
    }
}

#[test]
fn phase_round_trip() {
    let t = linspace(0.0, 3.0, 200);
    let v = dipolar_signal(&t);
    for applied in [0.3, 2.3, -1.0] {
        let rotated: Vec<Complex64> = v
            .iter()
            .map(|&x| Complex64::new(x, 0.0) * Complex64::from_polar(1.0, applied))
            .collect();
        let out = correct_phase(&rotated, &PhaseOptions::default()).unwrap();
        // The correcting phase undoes the rotation.
        let diff = (out.phase + applied).rem_euclid(TAU);
        assert!(diff.min(TAU - diff) < 1e-6, "applied {applied}, got {}", out.phase);
        for (a, b) in out.real.iter().zip(&v) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }
}
