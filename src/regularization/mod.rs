//! Regularization engine: penalty operators and α selection.

pub mod operator;
pub mod selection;

pub use operator::{build_penalty_matrix, reweighted_penalty};
pub use selection::{AlphaSelection, SelectionOptions, influence_traces, select_alpha};
