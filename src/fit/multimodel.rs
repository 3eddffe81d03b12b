//! Multi-component model fitting.
//!
//! For `n = 1..=max_components` a mixture of `n` copies of one basis shape is
//! fitted by separable least squares: the shape parameters (and any kernel
//! parameters) are optimised by Levenberg–Marquardt while the amplitudes are
//! solved exactly, under non-negativity, at every evaluation. The candidates
//! are then ranked by an information criterion (lowest wins, ties go to
//! fewer components).
//!
//! Several signals can be fitted together against one distribution. Their
//! kernels are either fixed or rebuilt from fitted kernel parameters (a
//! modulation depth, a background decay rate) through a [`KernelModel`].

use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{Convergence, ConvergenceReport, GoodnessOfFit};
use crate::error::{DeerError, DeerResult, ensure_finite, ensure_len};
use crate::fit::gof::goodness_of_fit;
use crate::fit::parametric::{ParametricOptions, separable_least_squares, validate_bounds};
use crate::math::{ensure_increasing, numerical_jacobian, symmetrize, trapz};
use crate::models::{BasisShape, DistributionModel, Mixture};
use crate::uncertainty::covariance::{CovarianceEstimate, gauss_newton_covariance};
use crate::uncertainty::noise::{NoiseEstimator, noise_level};

/// Information criterion used to rank mixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelCriterion {
    Aic,
    #[default]
    Aicc,
    Bic,
}

impl ModelCriterion {
    /// Score of a fit with `k` parameters and sum of squared residuals
    /// `sse` on `n` points.
    pub fn score(self, n: usize, sse: f64, k: usize) -> f64 {
        let n = n as f64;
        let k = k as f64;
        let base = n * (sse / n).ln();
        match self {
            Self::Aic => base + 2.0 * k,
            Self::Aicc => base + 2.0 * k + 2.0 * k * (k + 1.0) / (n - k - 1.0),
            Self::Bic => base + k * n.ln(),
        }
    }
}

/// Kernels of the fitted signals as a function of kernel parameters.
pub trait KernelModel: Sync {
    fn n_params(&self) -> usize;

    fn start(&self) -> Vec<f64>;

    /// Box bounds `(lower, upper)` per kernel parameter.
    fn bounds(&self) -> Vec<(f64, f64)>;

    /// One kernel per signal, in signal order.
    fn kernels(&self, params: &[f64]) -> DeerResult<Vec<DMatrix<f64>>>;
}

/// Where the kernels of a multi-model fit come from.
#[derive(Clone, Copy)]
pub enum KernelSource<'a> {
    /// One fixed kernel per signal.
    Fixed(&'a [&'a DMatrix<f64>]),
    /// Kernels rebuilt from fitted parameters.
    Model(&'a dyn KernelModel),
}

impl KernelSource<'_> {
    fn n_params(&self) -> usize {
        match self {
            Self::Fixed(_) => 0,
            Self::Model(m) => m.n_params(),
        }
    }

    fn start(&self) -> Vec<f64> {
        match self {
            Self::Fixed(_) => Vec::new(),
            Self::Model(m) => m.start(),
        }
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        match self {
            Self::Fixed(_) => Vec::new(),
            Self::Model(m) => m.bounds(),
        }
    }

    /// Call `f` with the kernels at `params`.
    fn with_kernels<T>(
        &self,
        params: &[f64],
        f: impl FnOnce(&[&DMatrix<f64>]) -> DeerResult<T>,
    ) -> DeerResult<T> {
        match self {
            Self::Fixed(ks) => f(ks),
            Self::Model(m) => {
                let owned = m.kernels(params)?;
                let refs: Vec<&DMatrix<f64>> = owned.iter().collect();
                f(&refs)
            }
        }
    }
}

/// Options of [`fit_multimodel_global`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiModelOptions {
    pub criterion: ModelCriterion,
    /// Per-component shape bounds; by default the centre spans the distance
    /// range and the remaining parameters use the shape's defaults.
    pub shape_bounds: Option<Vec<(f64, f64)>>,
    /// Relative weight of each signal; equal when absent.
    pub weights: Option<Vec<f64>>,
    /// Divide the selected distribution by its integral.
    pub renormalize: bool,
    /// Noise level per signal for the fit statistics; estimated from each
    /// signal when absent.
    pub noise_std: Option<f64>,
    pub convergence: Convergence,
}

impl Default for MultiModelOptions {
    fn default() -> Self {
        Self {
            criterion: ModelCriterion::default(),
            shape_bounds: None,
            weights: None,
            renormalize: true,
            noise_std: None,
            convergence: ParametricOptions::default().convergence,
        }
    }
}

/// One fitted mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiModelCandidate {
    pub components: usize,
    pub kernel_params: Vec<f64>,
    /// Shape parameters of every component, then amplitudes.
    pub params: Vec<f64>,
    /// Distribution before renormalization.
    pub p: Vec<f64>,
    pub residual_norm: f64,
    pub score: f64,
    pub convergence: ConvergenceReport,
}

/// Result of a multi-model fit.
#[derive(Debug, Clone)]
pub struct MultiModelFit {
    pub criterion: ModelCriterion,
    /// Index into `candidates` of the selected mixture.
    pub best: usize,
    pub candidates: Vec<MultiModelCandidate>,
    /// Selected distribution, renormalized when requested.
    pub p: Vec<f64>,
    /// `∫P dr` of the selected mixture before renormalization, 1 otherwise.
    pub scale: f64,
    /// Fitted signal per dataset.
    pub fitted: Vec<Vec<f64>>,
    /// Gauss–Newton covariance of the selected mixture's kernel parameters,
    /// shape parameters and amplitudes, in that order.
    pub covariance: DMatrix<f64>,
    /// Covariance of `p`, propagated from `covariance`.
    pub uncertainty: CovarianceEstimate,
    /// Goodness of fit per dataset.
    pub stats: Vec<GoodnessOfFit>,
}

impl MultiModelFit {
    pub fn selected(&self) -> &MultiModelCandidate {
        &self.candidates[self.best]
    }

    pub fn p(&self) -> &[f64] {
        &self.p
    }

    pub fn kernel_params(&self) -> &[f64] {
        &self.selected().kernel_params
    }
}

/// Fit mixtures of 1 to `max_components` basis components to one signal and
/// select the best by `criterion`.
///
/// `bounds` are per-component shape bounds; see
/// [`MultiModelOptions::shape_bounds`].
pub fn fit_multimodel(
    k: &DMatrix<f64>,
    v: &[f64],
    r: &[f64],
    basis: BasisShape,
    max_components: usize,
    criterion: ModelCriterion,
    bounds: Option<&[(f64, f64)]>,
) -> DeerResult<MultiModelFit> {
    let options = MultiModelOptions {
        criterion,
        shape_bounds: bounds.map(<[(f64, f64)]>::to_vec),
        ..MultiModelOptions::default()
    };
    fit_multimodel_global(&[v], KernelSource::Fixed(&[k]), r, basis, max_components, &options)
}

/// Fit mixtures of 1 to `max_components` basis components to several signals
/// sharing one distance distribution.
pub fn fit_multimodel_global(
    signals: &[&[f64]],
    kernels: KernelSource<'_>,
    r: &[f64],
    basis: BasisShape,
    max_components: usize,
    options: &MultiModelOptions,
) -> DeerResult<MultiModelFit> {
    if signals.is_empty() {
        return Err(DeerError::invalid("no signals given"));
    }
    for v in signals {
        ensure_finite("signal", v)?;
    }
    ensure_finite("r", r)?;
    ensure_increasing("r", r)?;
    options.convergence.validate()?;
    if max_components == 0 {
        return Err(DeerError::invalid("max_components must be >= 1"));
    }

    let weights = match &options.weights {
        Some(w) => {
            ensure_len("weights", w.len(), signals.len())?;
            if let Some(i) = w.iter().position(|x| !(x.is_finite() && *x > 0.0)) {
                return Err(DeerError::invalid(format!("weight {i} must be positive")));
            }
            w.clone()
        }
        None => vec![1.0; signals.len()],
    };
    let kernel_start = kernels.start();
    let kernel_bounds = kernels.bounds();
    ensure_len("kernel start", kernel_start.len(), kernels.n_params())?;
    ensure_len("kernel bounds", kernel_bounds.len(), kernels.n_params())?;
    ensure_finite_or_empty("kernel start", &kernel_start)?;
    validate_bounds(&kernel_bounds)?;
    let rows: Vec<usize> = signals.iter().map(|v| v.len()).collect();
    kernels.with_kernels(&kernel_start, |ks| {
        ensure_len("kernels", ks.len(), signals.len())?;
        for (kernel, &n) in ks.iter().zip(&rows) {
            if kernel.shape() != (n, r.len()) {
                return Err(DeerError::invalid(format!(
                    "kernel is {:?}, expected ({n}, {})",
                    kernel.shape(),
                    r.len()
                )));
            }
        }
        Ok(())
    })?;

    let shape_bounds = match &options.shape_bounds {
        Some(b) => {
            ensure_len("shape bounds", b.len(), basis.n_shape_params())?;
            validate_bounds(b)?;
            b.clone()
        }
        None => {
            let mut b = basis.default_bounds();
            b[0] = (r[0], r[r.len() - 1]);
            b
        }
    };

    let y = DVector::from_iterator(
        rows.iter().sum(),
        signals
            .iter()
            .zip(&weights)
            .flat_map(|(v, w)| v.iter().map(move |x| x * w.sqrt())),
    );
    let problem = Problem {
        kernels,
        r,
        rows: &rows,
        weights: &weights,
        y,
        convergence: options.convergence,
    };

    let candidates: Vec<DeerResult<MultiModelCandidate>> = (1..=max_components)
        .into_par_iter()
        .map(|n| {
            let mixture = Mixture::new(basis, n).with_shape_bounds(shape_bounds.clone());
            problem.fit_mixture(&mixture, options.criterion)
        })
        .collect();
    let candidates: Vec<MultiModelCandidate> =
        candidates.into_iter().collect::<DeerResult<_>>()?;

    // Deterministic selection: minimum score, ties go to fewer components.
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        if c.score < candidates[best].score {
            best = i;
        }
    }
    let chosen = &candidates[best];
    debug!(
        "multi-model fit selected {} component(s), score {:.3}",
        chosen.components, chosen.score
    );

    let mixture = Mixture::new(basis, chosen.components).with_shape_bounds(shape_bounds);
    let nk = kernels.n_params();
    let full: Vec<f64> = chosen
        .kernel_params
        .iter()
        .chain(&chosen.params)
        .copied()
        .collect();
    let mut full_bounds = kernel_bounds;
    full_bounds.extend(mixture.bounds());

    let residual = |x: &[f64]| problem.residual(x, &mixture);
    let res = residual(&full);
    let jac = numerical_jacobian(&residual, &full, &full_bounds);
    let covariance = gauss_newton_covariance(&jac, &res, None)?;

    let distribution = |x: &[f64]| mixture.evaluate(r, &x[nk..]);
    let jp = numerical_jacobian(&distribution, &full, &full_bounds);
    let mut cov_p = &jp * &covariance * jp.transpose();
    symmetrize(&mut cov_p);
    let mut uncertainty = CovarianceEstimate::new(DVector::from_column_slice(&chosen.p), cov_p)?
        .with_lower_bound(0.0);

    let pv = DVector::from_column_slice(&chosen.p);
    let fitted: Vec<Vec<f64>> = kernels.with_kernels(&chosen.kernel_params, |ks| {
        Ok(ks.iter().map(|k| (*k * &pv).iter().copied().collect()).collect())
    })?;
    let n_total = full.len() as f64;
    let stats = signals
        .iter()
        .zip(&fitted)
        .map(|(v, f)| {
            let noise = match options.noise_std {
                Some(s) => s,
                None => noise_level(v, NoiseEstimator::Derivative)?,
            };
            goodness_of_fit(v, f, n_total, noise)
        })
        .collect::<DeerResult<Vec<_>>>()?;

    let mut p = chosen.p.clone();
    let mut scale = 1.0;
    if options.renormalize {
        let area = trapz(&p, r);
        if area > 0.0 {
            p.iter_mut().for_each(|x| *x /= area);
            uncertainty = uncertainty.scaled(1.0 / area);
            scale = area;
        }
    }

    Ok(MultiModelFit {
        criterion: options.criterion,
        best,
        candidates,
        p,
        scale,
        fitted,
        covariance,
        uncertainty,
        stats,
    })
}

fn ensure_finite_or_empty(name: &str, values: &[f64]) -> DeerResult<()> {
    if values.is_empty() {
        Ok(())
    } else {
        ensure_finite(name, values)
    }
}

/// Stacked, weighted data shared by every candidate mixture.
struct Problem<'a> {
    kernels: KernelSource<'a>,
    r: &'a [f64],
    rows: &'a [usize],
    weights: &'a [f64],
    /// `[√w₁ V₁; √w₂ V₂; …]`
    y: DVector<f64>,
    convergence: Convergence,
}

impl Problem<'_> {
    /// Stacked design `[√w₁ K₁ Φ; √w₂ K₂ Φ; …]` for kernel parameters
    /// followed by shape parameters.
    fn design(&self, theta: &[f64], mixture: &Mixture) -> DeerResult<DMatrix<f64>> {
        let (kernel_params, shape) = theta.split_at(self.kernels.n_params());
        let columns = mixture.component_values(self.r, shape);
        let phi = DMatrix::from_fn(self.r.len(), columns.len(), |i, j| columns[j][i]);
        self.kernels.with_kernels(kernel_params, |ks| {
            ensure_len("kernels", ks.len(), self.rows.len())?;
            let mut out = DMatrix::zeros(self.y.len(), phi.ncols());
            let mut at = 0;
            for ((k, &n), &w) in ks.iter().zip(self.rows).zip(self.weights) {
                if k.shape() != (n, phi.nrows()) {
                    return Err(DeerError::invalid("kernel shape changed during the fit"));
                }
                out.rows_mut(at, n).copy_from(&(*k * &phi * w.sqrt()));
                at += n;
            }
            Ok(out)
        })
    }

    /// Weighted residual for kernel parameters, shape parameters and
    /// amplitudes.
    fn residual(&self, full: &[f64], mixture: &Mixture) -> Vec<f64> {
        let split = self.kernels.n_params() + mixture.amplitude_offset();
        match self.design(&full[..split], mixture) {
            Ok(a) => {
                let amplitudes = DVector::from_column_slice(&full[split..]);
                (a * amplitudes - &self.y).iter().copied().collect()
            }
            Err(_) => vec![f64::NAN; self.y.len()],
        }
    }

    fn fit_mixture(
        &self,
        mixture: &Mixture,
        criterion: ModelCriterion,
    ) -> DeerResult<MultiModelCandidate> {
        let nk = self.kernels.n_params();
        let offset = mixture.amplitude_offset();
        let mut start = self.kernels.start();
        start.extend_from_slice(&mixture.start()[..offset]);
        let mut bounds = self.kernels.bounds();
        bounds.extend_from_slice(&mixture.bounds()[..offset]);

        let out = separable_least_squares(
            |theta: &[f64]| self.design(theta, mixture),
            &self.y,
            &start,
            &bounds,
            true,
            self.convergence,
        )?;
        let (kernel_params, shape) = out.nonlinear.split_at(nk);
        let mut params = shape.to_vec();
        params.extend(&out.linear);
        let p = mixture.evaluate(self.r, &params);

        let full: Vec<f64> = kernel_params.iter().chain(&params).copied().collect();
        let sse: f64 = self.residual(&full, mixture).iter().map(|e| e * e).sum();
        Ok(MultiModelCandidate {
            components: mixture.components,
            kernel_params: kernel_params.to_vec(),
            score: criterion.score(self.y.len(), sse, full.len()),
            residual_norm: sse.sqrt(),
            params,
            p,
            convergence: out.report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_penalise_parameters() {
        let aic = ModelCriterion::Aic.score(100, 1.0, 3);
        let aicc = ModelCriterion::Aicc.score(100, 1.0, 3);
        let bic = ModelCriterion::Bic.score(100, 1.0, 3);
        assert!(aicc > aic);
        assert!(bic > aic);
        assert!(ModelCriterion::Aic.score(100, 1.0, 4) > aic);
    }

    #[test]
    fn rejects_zero_components() {
        let k = DMatrix::identity(3, 3);
        let r = [1.0, 2.0, 3.0];
        let g = BasisShape::Gaussian;
        let err = fit_multimodel(&k, &[1.0; 3], &r, g, 0, ModelCriterion::Aic, None);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_mismatched_datasets() {
        let k = DMatrix::identity(3, 3);
        let r = [1.0, 2.0, 3.0];
        let signals: [&[f64]; 2] = [&[1.0; 3], &[1.0; 3]];
        let options = MultiModelOptions::default();
        let g = BasisShape::Gaussian;
        // One kernel for two signals.
        let res = fit_multimodel_global(&signals, KernelSource::Fixed(&[&k]), &r, g, 1, &options);
        assert!(res.is_err());

        let weighted = MultiModelOptions {
            weights: Some(vec![1.0, -1.0]),
            ..MultiModelOptions::default()
        };
        let both = [&k, &k];
        let res = fit_multimodel_global(&signals, KernelSource::Fixed(&both), &r, g, 1, &weighted);
        assert!(res.is_err());
    }
}
