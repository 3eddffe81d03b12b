//! Mathematical utilities: special functions, grids, dense linear algebra,
//! non-negative least squares and bounded Levenberg–Marquardt.

pub mod fresnel;
pub mod grid;
pub mod levenberg;
pub mod linalg;
pub mod nnls;

pub use fresnel::*;
pub use grid::*;
pub use levenberg::*;
pub use linalg::*;
pub use nnls::*;
