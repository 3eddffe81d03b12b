//! Multi-pathway kernel construction.
//!
//! The kernel maps a distance distribution on `r` to a dipolar signal on `t`:
//!
//! ```text
//! K(t, r) = [(1 − Σλ) + Σ_p λ_p K_p(n_p (t − T0_p), r)] · B(t) · Δr
//! ```
//!
//! With no pathways a single fully modulated pathway at `T0 = 0` is used.

use log::debug;
use nalgebra::DMatrix;

use crate::domain::{KernelOptions, Pathway};
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{ensure_increasing, mean_spacing};

/// Build the dipolar kernel without a background factor.
pub fn build_kernel(
    t: &[f64],
    r: &[f64],
    pathways: &[Pathway],
    options: &KernelOptions,
) -> DeerResult<DMatrix<f64>> {
    build_kernel_with_background(t, r, pathways, None, options)
}

/// Build the dipolar kernel, multiplying each row by `background[i]` when a
/// background is supplied.
pub fn build_kernel_with_background(
    t: &[f64],
    r: &[f64],
    pathways: &[Pathway],
    background: Option<&[f64]>,
    options: &KernelOptions,
) -> DeerResult<DMatrix<f64>> {
    validate_axes(t, r)?;
    if let Some(b) = background {
        ensure_finite("background", b)?;
        ensure_len("background", b.len(), t.len())?;
    }
    let pathways = effective_pathways(pathways);
    for p in &pathways {
        p.validate(options.allow_negative_amplitudes)?;
    }

    let unmodulated = 1.0 - pathways.iter().map(|p| p.amplitude).sum::<f64>();
    let mut kernel = DMatrix::from_element(t.len(), r.len(), unmodulated);
    for p in pathways.iter().filter(|p| p.amplitude != 0.0) {
        let shifted: Vec<f64> = t.iter().map(|&ti| ti - p.zero_time).collect();
        kernel += p.elementary_kernel(&shifted, r, options) * p.amplitude;
    }

    if let Some(b) = background {
        for (i, mut row) in kernel.row_iter_mut().enumerate() {
            row *= b[i];
        }
    }
    if options.integrate {
        kernel *= mean_spacing(r);
    }

    debug!(
        "built {}x{} kernel from {} pathway(s), unmodulated fraction {unmodulated:.4}",
        t.len(),
        r.len(),
        pathways.len()
    );
    Ok(kernel)
}

/// Multi-pathway background `B(t) = Π_p basis(n_p (t − T0_p), λ_p)`.
///
/// `basis` receives the shifted, harmonic-scaled time axis and the pathway
/// amplitude and returns that pathway's background contribution.
pub fn multipathway_background<F>(
    t: &[f64],
    pathways: &[Pathway],
    basis: F,
) -> DeerResult<Vec<f64>>
where
    F: Fn(&[f64], f64) -> Vec<f64>,
{
    ensure_finite("t", t)?;
    let pathways = effective_pathways(pathways);
    let mut background = vec![1.0; t.len()];
    for p in &pathways {
        p.validate(true)?;
        let n = p.harmonic as f64;
        let shifted: Vec<f64> = t.iter().map(|&ti| n * (ti - p.zero_time)).collect();
        let factor = basis(&shifted, p.amplitude);
        ensure_len("background basis output", factor.len(), t.len())?;
        ensure_finite("background basis output", &factor)?;
        for (b, f) in background.iter_mut().zip(factor) {
            *b *= f;
        }
    }
    Ok(background)
}

fn effective_pathways(pathways: &[Pathway]) -> Vec<Pathway> {
    if pathways.is_empty() {
        vec![Pathway::unit()]
    } else {
        pathways.to_vec()
    }
}

fn validate_axes(t: &[f64], r: &[f64]) -> DeerResult<()> {
    ensure_finite("t", t)?;
    ensure_finite("r", r)?;
    if let Some(i) = r.iter().position(|&v| v <= 0.0) {
        return Err(DeerError::invalid(format!(
            "r[{i}] = {} is not strictly positive",
            r[i]
        )));
    }
    ensure_increasing("t", t)?;
    ensure_increasing("r", r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::linspace;

    fn axes() -> (Vec<f64>, Vec<f64>) {
        (linspace(-0.2, 3.0, 120), linspace(1.5, 6.0, 60))
    }

    #[test]
    fn empty_pathways_equal_unit_pathway() {
        let (t, r) = axes();
        let options = KernelOptions::default();
        let a = build_kernel(&t, &r, &[], &options).unwrap();
        let b = build_kernel(&t, &r, &[Pathway::unit()], &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_modulation_gives_constant_kernel() {
        let (t, r) = axes();
        let options = KernelOptions {
            integrate: false,
            ..KernelOptions::default()
        };
        let k = build_kernel(&t, &r, &[Pathway::new(0.0, 0.0)], &options).unwrap();
        assert!(k.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn integration_weight_is_mean_spacing() {
        let (t, r) = axes();
        let raw = build_kernel(
            &t,
            &r,
            &[],
            &KernelOptions {
                integrate: false,
                ..KernelOptions::default()
            },
        )
        .unwrap();
        let weighted = build_kernel(&t, &r, &[], &KernelOptions::default()).unwrap();
        let dr = mean_spacing(&r);
        assert!((raw * dr - weighted).amax() < 1e-15);
    }

    #[test]
    fn background_scales_rows() {
        let (t, r) = axes();
        let options = KernelOptions::default();
        let b: Vec<f64> = t.iter().map(|&ti| (-0.3 * ti.abs()).exp()).collect();
        let plain = build_kernel(&t, &r, &[], &options).unwrap();
        let with_bg = build_kernel_with_background(&t, &r, &[], Some(&b), &options).unwrap();
        for i in 0..t.len() {
            for j in 0..r.len() {
                assert!((plain[(i, j)] * b[i] - with_bg[(i, j)]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        let options = KernelOptions::default();
        assert!(build_kernel(&[], &[2.0], &[], &options).is_err());
        assert!(build_kernel(&[0.0], &[0.0, 1.0], &[], &options).is_err());
        assert!(build_kernel(&[0.0], &[2.0, 1.0], &[], &options).is_err());
        assert!(build_kernel(&[f64::NAN], &[2.0], &[], &options).is_err());
        assert!(build_kernel(&[0.0], &[2.0], &[Pathway::new(1.3, 0.0)], &options).is_err());

        let permissive = KernelOptions {
            allow_negative_amplitudes: true,
            ..options
        };
        assert!(build_kernel(&[0.0], &[2.0], &[Pathway::new(-0.2, 0.0)], &permissive).is_ok());
    }

    #[test]
    fn multipathway_background_multiplies_pathways() {
        let t = linspace(0.0, 2.0, 21);
        let pathways = [Pathway::new(0.5, 0.0), Pathway::new(0.2, 0.4).with_harmonic(2)];
        let decay = |ts: &[f64], lam: f64| -> Vec<f64> {
            ts.iter().map(|&x| (-0.1 * lam * x.abs()).exp()).collect()
        };
        let b = multipathway_background(&t, &pathways, decay).unwrap();
        for (i, &ti) in t.iter().enumerate() {
            let expected =
                (-0.05 * ti.abs()).exp() * (-0.02 * (2.0 * (ti - 0.4)).abs()).exp();
            assert!((b[i] - expected).abs() < 1e-14);
        }
    }
}
