//! Error types for derivar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error-controlled solves cannot be recorded on a tape")]
    UnsupportedAnnotation,

    #[error("no working tape is active")]
    NoWorkingTape,

    #[error("value kind mismatch: expected {expected}, got {got}")]
    KindMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("coefficient {0} is not bound to a value")]
    UnboundCoefficient(u64),

    #[error("coefficient {0} appears in the residual but was not registered")]
    UnregisteredCoefficient(u64),

    #[error("residual does not depend on the unknown")]
    DegenerateResidual,

    #[error("matrix is singular at pivot {0}")]
    SingularMatrix(usize),

    #[error("nonlinear solve did not converge after {iterations} iterations (residual {residual:e})")]
    NonConvergence { iterations: usize, residual: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;
