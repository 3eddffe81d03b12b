//! `dipolar-fit` library crate.
//!
//! Forward-model kernels and regularized / parametric fitting of dipolar EPR
//! signals (DEER, RIDME, ...). Typical flow:
//!
//! - build the kernel `K` from the time and distance grids and the dipolar
//!   pathways ([`kernel::build_kernel`])
//! - build the penalty `L` ([`regularization::build_penalty_matrix`])
//! - fit a distance distribution ([`fit::fit_regularized`],
//!   [`fit::fit_parametric`] or [`fit::fit_multimodel`])
//! - read confidence bands from the fit's covariance estimate
//!
//! Units: time in µs, distance in nm, angular frequencies in rad/µs.

pub mod domain;
pub mod error;
pub mod fit;
pub mod kernel;
pub mod math;
pub mod models;
pub mod preprocess;
pub mod regularization;
pub mod report;
pub mod uncertainty;
