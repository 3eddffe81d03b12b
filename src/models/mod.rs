//! Parametric distance-distribution models.
//!
//! Models are small, pure evaluators so that the fitting code can stay
//! generic over them.

pub mod model;

pub use model::*;
