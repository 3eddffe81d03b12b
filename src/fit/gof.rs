//! Goodness-of-fit statistics.

use crate::domain::GoodnessOfFit;
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};

/// Statistics of a fit with `n_params` effective parameters (`tr H` for a
/// regularized fit) and known noise level `noise_std`.
pub fn goodness_of_fit(
    v: &[f64],
    fitted: &[f64],
    n_params: f64,
    noise_std: f64,
) -> DeerResult<GoodnessOfFit> {
    ensure_finite("signal", v)?;
    ensure_len("fitted signal", fitted.len(), v.len())?;
    if !(noise_std.is_finite() && noise_std > 0.0) {
        return Err(DeerError::invalid(format!(
            "noise level {noise_std} must be positive and finite"
        )));
    }

    let n = v.len() as f64;
    let sse: f64 = v.iter().zip(fitted).map(|(a, b)| (a - b).powi(2)).sum();
    let mean = v.iter().sum::<f64>() / n;
    let sst: f64 = v.iter().map(|a| (a - mean).powi(2)).sum();
    let dof = n - n_params;
    let k = n_params;

    let aic = n * (sse / n).ln() + 2.0 * k;
    Ok(GoodnessOfFit {
        chi2red: sse / (noise_std * noise_std) / dof,
        r2: if sst > 0.0 { 1.0 - sse / sst } else { f64::NAN },
        rmsd: (sse / n).sqrt(),
        aic,
        aicc: aic + 2.0 * k * (k + 1.0) / (n - k - 1.0),
        bic: n * (sse / n).ln() + k * n.ln(),
        dof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_fit_statistics() {
        let v = [1.0, 0.5, 0.2, 0.1];
        let g = goodness_of_fit(&v, &v, 1.0, 0.01).unwrap();
        assert_eq!(g.rmsd, 0.0);
        assert_eq!(g.r2, 1.0);
        assert_eq!(g.chi2red, 0.0);
        assert_eq!(g.dof, 3.0);
    }

    #[test]
    fn chi2red_is_one_when_residuals_match_noise() {
        let v = [1.0, 1.0, 1.0, 1.0];
        let fitted = [1.1, 0.9, 1.1, 0.9];
        let g = goodness_of_fit(&v, &fitted, 0.0, 0.1).unwrap();
        assert!((g.chi2red - 1.0).abs() < 1e-12);
        assert!((g.rmsd - 0.1).abs() < 1e-12);
        assert!(g.bic > g.aic - 1e-12);
    }

    #[test]
    fn rejects_invalid_noise() {
        assert!(goodness_of_fit(&[1.0], &[1.0], 0.0, 0.0).is_err());
    }
}
