//! Axis helpers: log-spaced sweeps, linear grids and trapezoidal integration.

use crate::error::{DeerError, DeerResult};

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> DeerResult<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(DeerError::invalid(format!(
            "invalid log range: min={min}, max={max} (must be finite, >0, and max>min)"
        )));
    }
    if steps < 2 {
        return Err(DeerError::invalid("log range needs at least 2 steps"));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

/// `steps` evenly spaced points between `start` and `end` (inclusive).
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let h = (end - start) / (steps as f64 - 1.0);
            (0..steps).map(|i| start + h * i as f64).collect()
        }
    }
}

/// Trapezoidal integral of `y` over `x`.
pub fn trapz(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(yw, xw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

/// Mean spacing of a grid, 1 for a single point.
pub fn mean_spacing(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 1.0;
    }
    (x[x.len() - 1] - x[0]) / (x.len() - 1) as f64
}

/// Check that a grid is strictly increasing.
pub fn ensure_increasing(name: &str, x: &[f64]) -> DeerResult<()> {
    if let Some(i) = x.windows(2).position(|w| w[1] <= w[0]) {
        return Err(DeerError::invalid(format!(
            "{name} must be strictly increasing (violated at index {})",
            i + 1
        )));
    }
    Ok(())
}
