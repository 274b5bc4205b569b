//! Error taxonomy for the fitting engine.
//!
//! Only caller bugs (`Input`) and I/O at the binary boundary are meant to reach
//! the top level. Numeric trouble inside a single peak fit (non-convergence,
//! exhausted budgets, ill-conditioned Hessians, failed root searches) is
//! recovered inside the fitters and reported through status fields instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    /// Mismatched lengths, bad units, malformed priors, invalid orders, ...
    #[error("invalid input: {0}")]
    Input(String),

    /// The Hessian at the optimum could not be inverted.
    #[error("Hessian is singular; covariance unavailable")]
    SingularHessian,

    #[error("numeric failure: {0}")]
    Numeric(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FitError {
    pub fn input(message: impl Into<String>) -> Self {
        FitError::Input(message.into())
    }

    /// Process exit code used by the `ecal` binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::Input(_) => 2,
            FitError::Io(_) | FitError::Json(_) => 3,
            FitError::SingularHessian | FitError::Numeric(_) => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, FitError>;

/// Wrap an I/O error with the operation and path that failed.
pub fn io_context(err: std::io::Error, context: String) -> FitError {
    FitError::Io(std::io::Error::new(err.kind(), format!("{context}: {err}")))
}
