//! Parametric distance-distribution models.
//!
//! The parametric fitter only needs two primitive operations from a model:
//! - evaluate `P(r; θ)` on a distance grid
//! - report a default start point and box bounds for `θ`
//!
//! Models that are linear in their trailing parameters can also expose their
//! basis functions, which lets the fitter solve those parameters exactly.
//!
//! Built-in shapes are a closed enum; callers can plug in their own models by
//! implementing [`DistributionModel`].

use std::f64::consts::{LN_2, PI};

use serde::{Deserialize, Serialize};
use statrs::function::gamma::gamma;

/// Conversion factor between FWHM and standard deviation of a Gaussian.
fn fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / (2.0 * (2.0 * LN_2).sqrt())
}

/// A parametric distance distribution `P(r; θ)`.
pub trait DistributionModel: Send + Sync {
    fn n_params(&self) -> usize;

    /// Evaluate the distribution on `r`.
    fn evaluate(&self, r: &[f64], params: &[f64]) -> Vec<f64>;

    /// Default start point.
    fn start(&self) -> Vec<f64>;

    /// Box bounds `(lower, upper)` per parameter. Unbounded by default.
    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(f64::NEG_INFINITY, f64::INFINITY); self.n_params()]
    }

    fn param_names(&self) -> Vec<String> {
        (0..self.n_params()).map(|i| format!("p{i}")).collect()
    }

    /// Number of trailing parameters that enter `P` linearly, as
    /// `P = Σ aₖ φₖ(r; θ)`.
    fn n_linear(&self) -> usize {
        0
    }

    /// Basis functions `φₖ(r; θ)` for the leading nonlinear parameters `θ`,
    /// one vector per linear parameter.
    fn basis(&self, _r: &[f64], _nonlinear: &[f64]) -> Vec<Vec<f64>> {
        Vec::new()
    }
}

/// Built-in unit-area basis shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasisShape {
    /// `[center, fwhm]`
    Gaussian,
    /// `[center, fwhm, beta]`; `beta = 2` is Gaussian-like, large `beta`
    /// tends to a box.
    GenGaussian,
}

impl BasisShape {
    pub fn n_shape_params(self) -> usize {
        match self {
            Self::Gaussian => 2,
            Self::GenGaussian => 3,
        }
    }

    /// Shape value at a single distance.
    pub fn value(self, r: f64, params: &[f64]) -> f64 {
        match self {
            Self::Gaussian => {
                let sigma = fwhm_to_sigma(params[1]);
                let z = (r - params[0]) / sigma;
                (-0.5 * z * z).exp() / (sigma * (2.0 * PI).sqrt())
            }
            Self::GenGaussian => {
                let sigma = fwhm_to_sigma(params[1]);
                let beta = params[2];
                let z = ((r - params[0]) / sigma).abs();
                beta / (2.0 * sigma * gamma(1.0 / beta)) * (-z.powf(beta)).exp()
            }
        }
    }

    pub fn default_start(self) -> Vec<f64> {
        match self {
            Self::Gaussian => vec![3.5, 0.5],
            Self::GenGaussian => vec![3.5, 0.5, 5.0],
        }
    }

    pub fn default_bounds(self) -> Vec<(f64, f64)> {
        match self {
            Self::Gaussian => vec![(1.0, 20.0), (0.05, 5.0)],
            Self::GenGaussian => vec![(1.0, 20.0), (0.05, 5.0), (0.25, 15.0)],
        }
    }

    pub fn names(self) -> &'static [&'static str] {
        match self {
            Self::Gaussian => &["center", "fwhm"],
            Self::GenGaussian => &["center", "fwhm", "beta"],
        }
    }
}

impl DistributionModel for BasisShape {
    fn n_params(&self) -> usize {
        self.n_shape_params()
    }

    fn evaluate(&self, r: &[f64], params: &[f64]) -> Vec<f64> {
        r.iter().map(|&ri| self.value(ri, params)).collect()
    }

    fn start(&self) -> Vec<f64> {
        self.default_start()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.default_bounds()
    }

    fn param_names(&self) -> Vec<String> {
        self.names().iter().map(|s| s.to_string()).collect()
    }
}

/// Linear combination of `components` copies of one basis shape.
///
/// Parameter layout: shape parameters of every component first
/// (`[c1, w1, c2, w2, …]` for Gaussians), then one amplitude per component.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixture {
    pub shape: BasisShape,
    pub components: usize,
    /// Bounds for the shape parameters of each component; the shape's
    /// defaults when `None`.
    pub shape_bounds: Option<Vec<(f64, f64)>>,
}

impl Mixture {
    pub fn new(shape: BasisShape, components: usize) -> Self {
        Self {
            shape,
            components,
            shape_bounds: None,
        }
    }

    pub fn with_shape_bounds(mut self, bounds: Vec<(f64, f64)>) -> Self {
        self.shape_bounds = Some(bounds);
        self
    }

    fn component_bounds(&self) -> Vec<(f64, f64)> {
        self.shape_bounds
            .clone()
            .unwrap_or_else(|| self.shape.default_bounds())
    }

    /// Offset of the first amplitude in the parameter vector.
    pub fn amplitude_offset(&self) -> usize {
        self.components * self.shape.n_shape_params()
    }

    /// Unit-area shape of component `k`, one column per component.
    pub fn component_values(&self, r: &[f64], shape_params: &[f64]) -> Vec<Vec<f64>> {
        let m = self.shape.n_shape_params();
        (0..self.components)
            .map(|k| self.shape.evaluate(r, &shape_params[k * m..(k + 1) * m]))
            .collect()
    }
}

impl DistributionModel for Mixture {
    fn n_params(&self) -> usize {
        self.components * (self.shape.n_shape_params() + 1)
    }

    fn evaluate(&self, r: &[f64], params: &[f64]) -> Vec<f64> {
        let offset = self.amplitude_offset();
        let columns = self.component_values(r, &params[..offset]);
        let mut out = vec![0.0; r.len()];
        for (col, &amp) in columns.iter().zip(&params[offset..]) {
            for (o, v) in out.iter_mut().zip(col) {
                *o += amp * v;
            }
        }
        out
    }

    /// Centres spread evenly inside the centre bounds, remaining shape
    /// parameters at the shape's defaults, equal amplitudes.
    fn start(&self) -> Vec<f64> {
        let bounds = self.component_bounds();
        let defaults = self.shape.default_start();
        let n = self.components;
        let (lo, hi) = bounds[0];
        let mut out = Vec::with_capacity(self.n_params());
        for k in 0..n {
            out.push(lo + (hi - lo) * (k as f64 + 1.0) / (n as f64 + 1.0));
            for (j, &d) in defaults.iter().enumerate().skip(1) {
                out.push(d.clamp(bounds[j].0, bounds[j].1));
            }
        }
        out.extend(std::iter::repeat_n(1.0 / n.max(1) as f64, n));
        out
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        let shape = self.component_bounds();
        let mut out = Vec::with_capacity(self.n_params());
        for _ in 0..self.components {
            out.extend(shape.iter().copied());
        }
        out.extend(std::iter::repeat_n((0.0, f64::INFINITY), self.components));
        out
    }

    fn param_names(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.n_params());
        for k in 1..=self.components {
            out.extend(self.shape.names().iter().map(|s| format!("{s}{k}")));
        }
        out.extend((1..=self.components).map(|k| format!("amp{k}")));
        out
    }

    fn n_linear(&self) -> usize {
        self.components
    }

    fn basis(&self, r: &[f64], nonlinear: &[f64]) -> Vec<Vec<f64>> {
        self.component_values(r, nonlinear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{linspace, trapz};

    #[test]
    fn shapes_have_unit_area() {
        let r = linspace(0.0, 10.0, 4001);
        let g = BasisShape::Gaussian.evaluate(&r, &[4.0, 0.8]);
        assert!((trapz(&g, &r) - 1.0).abs() < 1e-8);
        let gg = BasisShape::GenGaussian.evaluate(&r, &[4.0, 0.8, 3.0]);
        assert!((trapz(&gg, &r) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gaussian_fwhm_is_full_width_at_half_maximum() {
        let peak = BasisShape::Gaussian.value(3.0, &[3.0, 0.6]);
        let half = BasisShape::Gaussian.value(3.3, &[3.0, 0.6]);
        assert!((half / peak - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mixture_is_weighted_sum_of_components() {
        let r = linspace(1.5, 6.0, 50);
        let mix = Mixture::new(BasisShape::Gaussian, 2);
        let theta = [2.0, 0.5, 3.0, 0.5, 0.4, 0.6];
        let p = mix.evaluate(&r, &theta);
        let a = BasisShape::Gaussian.evaluate(&r, &[2.0, 0.5]);
        let b = BasisShape::Gaussian.evaluate(&r, &[3.0, 0.5]);
        for i in 0..r.len() {
            assert!((p[i] - (0.4 * a[i] + 0.6 * b[i])).abs() < 1e-14);
        }
    }

    #[test]
    fn mixture_layout_and_start() {
        let mix = Mixture::new(BasisShape::Gaussian, 3)
            .with_shape_bounds(vec![(2.0, 6.0), (0.1, 1.5)]);
        assert_eq!(mix.n_params(), 9);
        assert_eq!(mix.amplitude_offset(), 6);
        let start = mix.start();
        assert_eq!(start.len(), 9);
        assert_eq!(&start[..6], &[3.0, 0.5, 4.0, 0.5, 5.0, 0.5]);
        assert!(start[6..].iter().all(|&a| (a - 1.0 / 3.0).abs() < 1e-15));
        assert_eq!(mix.bounds()[7], (0.0, f64::INFINITY));
        assert_eq!(mix.param_names()[2], "center2");
        assert_eq!(mix.n_linear(), 3);
        assert_eq!(BasisShape::Gaussian.n_linear(), 0);
    }
}
