//! Domain types used throughout the crate.
//!
//! This module defines:
//!
//! - dipolar pathways and kernel options (`Pathway`, `KernelOptions`)
//! - configuration enums (`SelectionMethod`, `NnlsSolver`, `CovarianceMethod`)
//! - solver bookkeeping shared by every fit (`Convergence`, `Warning`)

pub mod types;

pub use types::*;
