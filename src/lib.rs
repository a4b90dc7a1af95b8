//! # Iterative Subspace Solver
//!
//! A Krylov-like subspace engine for large sparse problems whose state
//! vectors are manipulated only through an opaque interface: linear
//! eigenproblems (Davidson's method), linear equations with multiple
//! right-hand sides (optionally in augmented-Hessian form), quasi-Newton
//! optimisation (L-BFGS with cubic line search) and DIIS acceleration of
//! non-linear equations.
//!
//! The caller owns the matrix-vector product (or residual evaluation) and the
//! preconditioner; the solver owns the P/Q/R subspace bookkeeping, the small
//! reduced Rayleigh-Ritz problem, conditioning of the subspace against
//! redundancy, and the interpolation of the next trial vectors. Large vectors
//! are touched at most one at a time, through [`SolverVector`].

// Declare the modules that form the public API of the crate.
pub mod error;
pub mod options;
pub mod solver;
pub mod subspace;
pub mod vector;

mod optimize;
mod reduced;

// Re-export key types to the top level of the crate for easier access.
pub use error::SolverError;
pub use options::{Algorithm, Convergence, Options};
pub use solver::{IterativeSolver, Variant};
pub use vector::{PVector, PagedVector, SolverVector, StorageHint};
