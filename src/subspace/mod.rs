//! Subspace bookkeeping: the P and Q containers and the assembled reduced
//! matrices they project into.
//!
//! The solver's subspace is a disjoint union of three ordered segments. The
//! P-space holds fixed, user-specified sparse basis vectors; the Q-space holds
//! the compressed history of past iterates together with their action images;
//! the R-space is the set of trial vectors handed in by the current call and
//! lives only in the driver. The [`data`] module assembles the dense reduced
//! operator and overlap over P ⊕ Q ⊕ R and owns the redundancy test used for
//! conditioning.

pub mod data;
pub mod pspace;
pub mod qspace;

pub use data::{Dimensions, SubspaceData};
pub use pspace::PSpace;
pub use qspace::QSpace;
