//! Crate-wide error type.
//!
//! Only conditions the caller must act on are errors. Solver non-convergence
//! and regularization-parameter fallbacks are reported inside the result
//! structs instead (see [`crate::domain::Convergence`] and
//! [`crate::domain::Warning`]).

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type DeerResult<T> = Result<T, DeerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeerError {
    /// Malformed, empty or non-finite input. Never recovered internally.
    #[error("invalid input: {what}")]
    InvalidInput { what: String },

    /// The forward operator cannot be inverted and no regularization
    /// compensates for it.
    #[error("kernel is singular (rank {rank} of {size}) and no regularization was applied")]
    SingularKernel { rank: usize, size: usize },

    /// A decomposition failed on a matrix that passed validation.
    #[error("numerical failure: {what}")]
    Numerical { what: String },
}

impl DeerError {
    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput { what: what.into() }
    }

    pub fn numerical(what: impl Into<String>) -> Self {
        Self::Numerical { what: what.into() }
    }

    /// Short stable label, handy for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid-input",
            Self::SingularKernel { .. } => "singular-kernel",
            Self::Numerical { .. } => "numerical",
        }
    }
}

impl From<argmin::core::Error> for DeerError {
    fn from(err: argmin::core::Error) -> Self {
        Self::numerical(format!("optimizer failed: {err}"))
    }
}

/// Validate that a slice is non-empty and entirely finite.
pub(crate) fn ensure_finite(name: &str, values: &[f64]) -> DeerResult<()> {
    if values.is_empty() {
        return Err(DeerError::invalid(format!("{name} is empty")));
    }
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
        return Err(DeerError::invalid(format!(
            "{name}[{i}] is not finite ({})",
            values[i]
        )));
    }
    Ok(())
}

/// Validate that two lengths agree.
pub(crate) fn ensure_len(name: &str, got: usize, expected: usize) -> DeerResult<()> {
    if got != expected {
        return Err(DeerError::invalid(format!(
            "{name} has length {got}, expected {expected}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_finite_reports_position() {
        let err = ensure_finite("signal", &[1.0, f64::NAN]).unwrap_err();
        assert_eq!(err.kind(), "invalid-input");
        assert!(err.to_string().contains("signal[1]"));
    }

    #[test]
    fn ensure_finite_rejects_empty() {
        assert!(ensure_finite("r", &[]).is_err());
        assert!(ensure_finite("r", &[1.0]).is_ok());
    }

    #[test]
    fn singular_kernel_message_names_rank() {
        let err = DeerError::SingularKernel { rank: 3, size: 10 };
        assert!(err.to_string().contains("rank 3 of 10"));
    }
}
