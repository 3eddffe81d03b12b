//! Distance-distribution fitting.
//!
//! Responsibilities:
//!
//! - regularized (non-parametric) fits, single and global
//! - parametric fits of a distribution model
//! - multi-component model fits ranked by an information criterion
//! - goodness-of-fit statistics shared by all of them

pub mod gof;
pub mod multimodel;
pub mod parametric;
pub mod regularized;

pub use gof::*;
pub use multimodel::*;
pub use parametric::*;
pub use regularized::*;
