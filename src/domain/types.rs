//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be:
//!
//! - passed around in-memory during fitting
//! - loaded from a caller's JSON configuration
//! - attached to results for later inspection

use serde::{Deserialize, Serialize};

use crate::error::{DeerError, DeerResult};

/// Free-electron g-value.
pub const G_FREE: f64 = 2.002_319_304_362_56;

/// A single dipolar pathway.
///
/// A collection of pathways forms a multi-pathway model. Amplitudes need not
/// sum to one; the unmodulated fraction is `1 - Σλ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pathway {
    /// Modulation amplitude `λ`, normally in `[0, 1]`.
    pub amplitude: f64,
    /// Zero-time `T0` (µs) at which the pathway's dipolar evolution refocuses.
    pub zero_time: f64,
    /// Harmonic order `n`; scales the effective dipolar frequency.
    #[serde(default = "default_harmonic")]
    pub harmonic: u32,
}

fn default_harmonic() -> u32 {
    1
}

impl Pathway {
    pub fn new(amplitude: f64, zero_time: f64) -> Self {
        Self {
            amplitude,
            zero_time,
            harmonic: 1,
        }
    }

    pub fn with_harmonic(mut self, harmonic: u32) -> Self {
        self.harmonic = harmonic;
        self
    }

    /// The fully modulated pathway refocusing at `t = 0`.
    pub fn unit() -> Self {
        Self::new(1.0, 0.0)
    }

    /// Check the pathway parameters.
    ///
    /// Negative amplitudes (or amplitudes above one) are accepted only when
    /// `allow_out_of_range` is set, e.g. for suppression tests.
    pub fn validate(&self, allow_out_of_range: bool) -> DeerResult<()> {
        if !self.amplitude.is_finite() {
            return Err(DeerError::invalid(format!(
                "pathway amplitude {} is not finite",
                self.amplitude
            )));
        }
        if !allow_out_of_range && !(0.0..=1.0).contains(&self.amplitude) {
            return Err(DeerError::invalid(format!(
                "pathway amplitude {} is outside [0, 1]",
                self.amplitude
            )));
        }
        if !self.zero_time.is_finite() {
            return Err(DeerError::invalid(format!(
                "pathway zero-time {} is not finite",
                self.zero_time
            )));
        }
        if self.harmonic == 0 {
            return Err(DeerError::invalid("pathway harmonic must be >= 1"));
        }
        Ok(())
    }
}

impl Default for Pathway {
    fn default() -> Self {
        Self::unit()
    }
}

/// How the orientation average of the dipolar kernel is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelMethod {
    /// Closed form in terms of Fresnel integrals.
    Fresnel,
    /// Midpoint quadrature over `cos θ ∈ [0, 1]`.
    Grid {
        knots: usize,
        /// Optional excitation bandwidth (rad/µs) limiting which
        /// orientations contribute.
        excitation_bandwidth: Option<f64>,
    },
}

impl KernelMethod {
    pub const DEFAULT_GRID_KNOTS: usize = 5001;

    pub fn grid() -> Self {
        Self::Grid {
            knots: Self::DEFAULT_GRID_KNOTS,
            excitation_bandwidth: None,
        }
    }
}

/// Options controlling kernel construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    pub method: KernelMethod,
    /// g-values of the two coupled spins.
    pub g: [f64; 2],
    /// Multiply by the distance-grid spacing so that `K·P ≈ ∫K P dr`.
    pub integrate: bool,
    /// Accept pathway amplitudes outside `[0, 1]`.
    pub allow_negative_amplitudes: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            method: KernelMethod::Fresnel,
            g: [G_FREE, G_FREE],
            integrate: true,
            allow_negative_amplitudes: false,
        }
    }
}

/// Criterion used to pick the regularization parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Akaike information criterion.
    Aic,
    /// Small-sample corrected AIC.
    Aicc,
    /// Bayesian information criterion.
    Bic,
    /// Generalized cross-validation.
    Gcv,
    /// Robust GCV.
    Rgcv,
    /// Strong robust GCV.
    Srgcv,
    /// Mallows' C_L.
    Mcl,
    /// L-curve maximum curvature.
    Lcurve,
    /// L-curve minimum radius.
    Lr,
}

impl SelectionMethod {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aic => "AIC",
            Self::Aicc => "AICc",
            Self::Bic => "BIC",
            Self::Gcv => "GCV",
            Self::Rgcv => "rGCV",
            Self::Srgcv => "srGCV",
            Self::Mcl => "Mallows C_L",
            Self::Lcurve => "L-curve (max curvature)",
            Self::Lr => "L-curve (min radius)",
        }
    }

    /// Whether the method needs a noise level estimate.
    pub fn needs_noise(self) -> bool {
        matches!(self, Self::Mcl)
    }
}

/// Active-set algorithm used for non-negative least squares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NnlsSolver {
    /// Bro & de Jong fast NNLS.
    Fnnls,
    /// Block principal pivoting.
    Bpp,
}

/// Penalty functional applied to `L P`.
///
/// Non-quadratic penalties are reduced to a weighted quadratic one
/// `‖W^{1/2} L P‖²` by iterative reweighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    /// `‖L P‖²`
    #[default]
    Tikhonov,
    /// Total variation `Σ |(L P)ᵢ|`.
    Tv,
    /// Pseudo-Huber `Σ η² (√(1 + ((L P)ᵢ/η)²) − 1)`, quadratic below the
    /// threshold `η` and linear above it.
    Huber { threshold: f64 },
}

impl Penalty {
    /// Default Huber threshold.
    pub const HUBER_THRESHOLD: f64 = 1.35;

    pub fn huber() -> Self {
        Self::Huber {
            threshold: Self::HUBER_THRESHOLD,
        }
    }

    pub fn validate(&self) -> DeerResult<()> {
        match *self {
            Self::Huber { threshold } if !(threshold.is_finite() && threshold > 0.0) => Err(
                DeerError::invalid(format!("Huber threshold {threshold} must be positive")),
            ),
            _ => Ok(()),
        }
    }
}

/// How the covariance of a regularized fit is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceMethod {
    /// `σ² A⁻¹ KᵀK A⁻¹`, `A = KᵀK + α²LᵀL`.
    Linearized,
    /// Heteroscedasticity-consistent HC1 sandwich on the augmented Jacobian.
    Hc1,
}

/// Log-spaced sweep of candidate regularization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaSweep {
    pub min: f64,
    pub max: f64,
    pub points: usize,
    /// Value used when the criterion has no interior minimum.
    /// `None` means the geometric centre of `[min, max]`.
    pub fallback: Option<f64>,
}

impl Default for AlphaSweep {
    fn default() -> Self {
        Self {
            min: 1e-6,
            max: 1e2,
            points: 61,
            fallback: None,
        }
    }
}

impl AlphaSweep {
    pub fn fallback_alpha(&self) -> f64 {
        self.fallback.unwrap_or_else(|| (self.min * self.max).sqrt())
    }
}

/// Options of a regularized (non-parametric) fit.
///
/// Every field has a default, so a caller can deserialize a partial JSON
/// object such as `{"method": "gcv", "nonneg": false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Derivative order of the penalty operator.
    pub order: usize,
    pub penalty: Penalty,
    pub method: SelectionMethod,
    pub nonneg: bool,
    /// Noise standard deviation; estimated from the signal when absent.
    pub noise_std: Option<f64>,
    /// Fixed regularization parameter; selected by `method` when absent.
    pub alpha: Option<f64>,
    pub solver: NnlsSolver,
    /// Divide the result by `∫P dr`.
    pub renormalize: bool,
    /// Osher–Bregman iterated regularization.
    pub obir: bool,
    pub covariance: CovarianceMethod,
    pub sweep: AlphaSweep,
    pub convergence: Convergence,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            order: 2,
            penalty: Penalty::Tikhonov,
            method: SelectionMethod::Aic,
            nonneg: true,
            noise_std: None,
            alpha: None,
            solver: NnlsSolver::Fnnls,
            renormalize: true,
            obir: false,
            covariance: CovarianceMethod::Linearized,
            sweep: AlphaSweep::default(),
            convergence: Convergence::default(),
        }
    }
}

/// Stopping criterion for an iterative solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    /// Relative change of the objective below which the solver stops.
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            tol: 1e-8,
            max_iter: 500,
        }
    }
}

impl Convergence {
    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self { tol, max_iter }
    }

    pub fn validate(&self) -> DeerResult<()> {
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(DeerError::invalid(format!(
                "convergence tolerance {} must be positive and finite",
                self.tol
            )));
        }
        if self.max_iter == 0 {
            return Err(DeerError::invalid("max_iter must be >= 1"));
        }
        Ok(())
    }
}

/// Outcome of an iterative solver, returned next to its result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub criterion: Convergence,
    pub iterations: usize,
    pub converged: bool,
    /// Last relative change of the objective.
    pub last_change: f64,
}

impl ConvergenceReport {
    /// Report for a direct (non-iterative) solve.
    pub fn direct(criterion: Convergence) -> Self {
        Self {
            criterion,
            iterations: 1,
            converged: true,
            last_change: 0.0,
        }
    }
}

/// Non-fatal conditions recorded in result metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Warning {
    /// The selection criterion was monotonic over the sweep; `fallback`
    /// was used instead.
    NoBracketedMinimum {
        method: SelectionMethod,
        fallback: f64,
    },
    /// An iterative stage stopped at its iteration cap.
    NotConverged { stage: String, iterations: usize },
    /// Parameters outside their bounds were clipped.
    ParametersClipped { indices: Vec<usize> },
}

/// Goodness-of-fit statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoodnessOfFit {
    /// Reduced chi-square, `χ²/dof` with `χ² = Σ(r/σ)²`.
    pub chi2red: f64,
    /// Coefficient of determination.
    pub r2: f64,
    /// Root mean square deviation.
    pub rmsd: f64,
    pub aic: f64,
    pub aicc: f64,
    pub bic: f64,
    /// Degrees of freedom, `N - effective number of parameters`.
    pub dof: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pathway_validation() {
        assert!(Pathway::new(0.5, 0.1).validate(false).is_ok());
        assert!(Pathway::new(-0.1, 0.0).validate(false).is_err());
        assert!(Pathway::new(-0.1, 0.0).validate(true).is_ok());
        assert!(Pathway::new(0.5, f64::INFINITY).validate(true).is_err());
        assert!(Pathway::new(0.5, 0.0).with_harmonic(0).validate(false).is_err());
    }

    #[test]
    fn sweep_fallback_is_geometric_centre() {
        let sweep = AlphaSweep::default();
        assert!((sweep.fallback_alpha() - 1e-2).abs() < 1e-15);
        let custom = AlphaSweep {
            fallback: Some(0.3),
            ..AlphaSweep::default()
        };
        assert_eq!(custom.fallback_alpha(), 0.3);
    }
}
