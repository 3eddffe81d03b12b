//! Signal preprocessing utilities that sit outside the fitting core:
//! phase correction of complex traces and the dipolar spectrum.

pub mod phase;
pub mod spectrum;

pub use phase::*;
pub use spectrum::*;
