//! Dipolar frequency spectrum of a time-domain signal.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::math::{ensure_increasing, mean_spacing};

/// Apodization window, applied one-sided so it starts at 1 at the first
/// time point and decays towards the end of the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    #[default]
    Hamming,
    Hann,
    None,
}

/// Which part of the complex spectrum to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpectrumMode {
    /// `|z|`
    #[default]
    Magnitude,
    /// `|Re z|`
    Absolute,
    Real,
    Imaginary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpectrumOptions {
    /// Length after zero-filling; `None` means twice the signal length.
    pub points: Option<usize>,
    pub window: Window,
    pub mode: SpectrumMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    /// Frequency axis in MHz.
    pub frequencies: Vec<f64>,
    pub values: Vec<f64>,
}

/// Spectrum of `v` sampled at `t` (µs), with its frequency axis.
pub fn spectrum(t: &[f64], v: &[f64], options: &SpectrumOptions) -> DeerResult<Spectrum> {
    let values = spectrum_values(t, v, options)?;
    let m = values.len();
    let dt = mean_spacing(t);
    let half = (m / 2) as f64;
    let frequencies = (0..m).map(|k| (k as f64 - half) / (m as f64 * dt)).collect();
    Ok(Spectrum { frequencies, values })
}

/// Spectrum values only; identical to `spectrum(..).values`.
pub fn spectrum_values(t: &[f64], v: &[f64], options: &SpectrumOptions) -> DeerResult<Vec<f64>> {
    ensure_finite("t", t)?;
    ensure_finite("signal", v)?;
    ensure_len("signal", v.len(), t.len())?;
    ensure_increasing("t", t)?;
    if t.len() < 2 {
        return Err(DeerError::invalid("spectrum needs at least 2 time points"));
    }
    let n = v.len();
    let m = options.points.unwrap_or(2 * n);
    if m < n {
        return Err(DeerError::invalid(format!(
            "zero-filled length {m} is shorter than the signal ({n})"
        )));
    }

    let mut buffer: Vec<Complex64> = v
        .iter()
        .zip(window(options.window, n))
        .map(|(&x, w)| Complex64::new(x * w, 0.0))
        .collect();
    buffer.resize(m, Complex64::new(0.0, 0.0));

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(m);
    fft.process(&mut buffer);

    // Shift so that zero frequency sits at index m / 2.
    let half = m / 2;
    let values = (0..m)
        .map(|i| buffer[(i + m - half) % m])
        .map(|z| match options.mode {
            SpectrumMode::Magnitude => z.norm(),
            SpectrumMode::Absolute => z.re.abs(),
            SpectrumMode::Real => z.re,
            SpectrumMode::Imaginary => z.im,
        })
        .collect();
    Ok(values)
}

/// Second half of a symmetric window of length `2n`.
fn window(kind: Window, n: usize) -> Vec<f64> {
    let len = (2 * n - 1) as f64;
    (n..2 * n)
        .map(|i| {
            let c = (2.0 * PI * i as f64 / len).cos();
            match kind {
                Window::Hamming => 0.54 - 0.46 * c,
                Window::Hann => 0.5 - 0.5 * c,
                Window::None => 1.0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::linspace;

    #[test]
    fn windows_start_near_one_and_decay() {
        let w = window(Window::Hamming, 64);
        assert!(w[0] > 0.99);
        assert!((w[63] - 0.08).abs() < 1e-12);
        assert!(w.windows(2).all(|p| p[1] <= p[0]));
        assert!(window(Window::None, 5).iter().all(|&x| x == 1.0));
    }

    #[test]
    fn frequency_axis_is_centred() {
        let t = linspace(0.0, 0.99, 100);
        let s = spectrum(&t, &vec![1.0; 100], &SpectrumOptions::default()).unwrap();
        assert_eq!(s.frequencies.len(), 200);
        assert!((s.frequencies[0] + 50.0).abs() < 1e-9);
        assert!(s.frequencies[100].abs() < 1e-12);
        assert!(*s.frequencies.last().unwrap() < 50.0);
    }

    #[test]
    fn cosine_peaks_at_its_frequency() {
        let t = linspace(0.0, 2.555, 512);
        let v: Vec<f64> = t.iter().map(|&x| (2.0 * PI * 10.0 * x).cos()).collect();
        let opts = SpectrumOptions {
            points: Some(1024),
            window: Window::None,
            mode: SpectrumMode::Magnitude,
        };
        let s = spectrum(&t, &v, &opts).unwrap();
        let (imax, _) = s.values[512..]
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &x)| if x > acc.1 { (i, x) } else { acc });
        assert!((s.frequencies[512 + imax] - 10.0).abs() < 0.5);
    }

    #[test]
    fn rejects_short_zero_fill() {
        let t = linspace(0.0, 1.0, 10);
        let opts = SpectrumOptions {
            points: Some(5),
            ..SpectrumOptions::default()
        };
        assert!(spectrum_values(&t, &[0.0; 10], &opts).is_err());
    }
}
