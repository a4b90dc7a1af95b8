//! This module defines the custom error types for the library.
//!
//! All failure conditions that can escape the solver are collected into a
//! single, comprehensive enum behind the opaque [`SolverError`] type.
//!
//! Using the [`thiserror`] crate allows us to create idiomatic error types with
//! minimal boilerplate. Note that [`faer::linalg::evd::EvdError`] does not
//! implement the standard [`std::error::Error`] trait, so we wrap it manually
//! to provide a compatible error type.
//!
//! The taxonomy follows the solver's propagation policy: recoverable numerical
//! events (subspace redundancy, rank-deficient reduced problems, failed Wolfe
//! conditions, unconverged roots) are repaired or reported through the error
//! vector and never appear here. Only arithmetic failure in the dense solver
//! and caller misuse escape as `SolverError`.

use thiserror::Error;

/// Represents all possible errors that can occur during an iterative solve.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct SolverError(#[from] pub(crate) SolverErrorKind);

/// Private enum containing the distinct kinds of errors.
/// This separation allows for a clean `Display` implementation via
/// [`thiserror`] while handling non-standard error types manually.
#[derive(Error, Debug, PartialEq)]
pub(crate) enum SolverErrorKind {
    /// The lengths of the parameter and action arrays passed to a driver call
    /// do not agree, or are smaller than the current working set.
    #[error("Mismatched input arrays: {param_count} parameter vectors but {action_count} action vectors.")]
    MismatchedInputs {
        param_count: usize,
        action_count: usize,
    },

    /// P-space vectors may only be installed before the first iteration.
    #[error("P-space vectors cannot be added after {iterations} iterations have already run.")]
    PSpaceAfterIteration { iterations: usize },

    /// The interpolated solution collapsed to the zero vector. The subspace
    /// coefficients no longer describe a usable trial vector.
    #[error("Interpolated solution for root {root} has zero norm.")]
    ZeroNormSolution { root: usize },

    /// A NaN or infinity was produced while solving the reduced problem.
    /// The offending reduced matrices are formatted into the message so the
    /// failure can be diagnosed post mortem.
    #[error("Non-finite value in the reduced {context} problem.\nsubspace matrix:\n{matrix}\nsubspace overlap:\n{overlap}")]
    NonFiniteReducedProblem {
        context: &'static str,
        matrix: String,
        overlap: String,
    },

    /// Indicates that an invalid input parameter was provided to a function.
    #[error("Invalid input parameter: {0}")]
    InputError(String),

    /// Wraps an error originating from [`faer`]'s eigendecomposition module.
    #[error("A numerical error occurred during the reduced eigendecomposition: {0:?}")]
    EvdError(faer::linalg::evd::EvdError),

    /// Wraps an error originating from [`faer`]'s singular value
    /// decomposition module.
    #[error("A numerical error occurred during the reduced SVD: {0:?}")]
    SvdError(faer::linalg::svd::SvdError),
}

// Manually implement PartialEq for the public error type.
// We compare the inner `SolverErrorKind`.
impl PartialEq for SolverError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
