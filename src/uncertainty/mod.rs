//! Uncertainty propagation: covariance estimates, noise levels and
//! bootstrap analysis.

pub mod bootstrap;
pub mod covariance;
pub mod noise;

pub use bootstrap::{BootstrapSummary, Resampling, bootstrap};
pub use covariance::{
    CovarianceEstimate, ScalarEstimate, distance_std, gauss_newton_covariance, hc1_covariance,
    mean_distance, propagate_uncertainty,
};
pub use noise::{NoiseEstimator, noise_level, overlap, white_gaussian_noise};
