//! Forward model: dipolar kernels for single and multiple pathways.

pub mod builder;
pub mod cache;
pub mod dipolar;

pub use builder::{build_kernel, build_kernel_with_background, multipathway_background};
pub use cache::{KernelCache, KernelKey};
pub use dipolar::{dipolar_constant, dipolar_frequency, fresnel_kernel_value, grid_kernel_value};
