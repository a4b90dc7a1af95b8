//! Solver configuration.
//!
//! Every tunable recognised by the iteration driver lives in [`Options`],
//! which can be filled directly or through the string-keyed
//! [`Options::set`] surface that external-language bindings use. Unknown keys
//! and unparsable values are reported as [`SolverError`] input errors rather
//! than being silently dropped.

use crate::error::{SolverError, SolverErrorKind};

/// Which quantity the per-root error vector reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Convergence {
    /// Norm of the interpolated residual (the default).
    #[default]
    Residual,
    /// Norm of the step from the incoming trial vector to the interpolated
    /// solution.
    Step,
    /// Predicted value change: `|⟨step|residual⟩|`.
    Energy,
}

/// Quasi-Newton algorithm used by the optimisation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Limited-memory BFGS over the Q-space curvature pairs.
    #[default]
    LBfgs,
    /// No quasi-Newton update: `end_iteration` leaves the solution unchanged.
    Null,
}

/// All driver tunables with their defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size of the full vector space. Informational; the opaque vector
    /// interface never needs it, but bindings do.
    pub n_dimension: usize,
    /// Number of simultaneous solutions / eigenpairs sought. Zero means
    /// "deduce from the first `add_vector` call".
    pub n_roots: usize,
    /// Convergence threshold on the per-root error.
    pub thresh: f64,
    /// Optional convergence threshold on the change of the objective value
    /// between accepted iterates (optimisation variant only).
    pub thresh_value: Option<f64>,
    /// Hard iteration cap, enforced by the caller's loop.
    pub max_iterations: usize,
    /// 0 silent, 1 one line per iteration, >= 2 matrices and conditioning
    /// diagnostics.
    pub verbosity: u32,
    /// Whether the reduced operator may be assumed self-adjoint.
    pub hermitian: bool,
    /// Whether Q vectors built by difference are orthogonalised against the
    /// new iterate.
    pub orthogonalise_q: bool,
    /// Scale of the augmented-Hessian embedding for linear equations; zero
    /// solves the unmodified equations.
    pub augmented_hessian: f64,
    /// Truncation threshold for singular values in the reduced solvers,
    /// relative to the largest singular value.
    pub svd_threshold: f64,
    /// Redundancy-eviction trigger on the smallest singular value of the
    /// subspace tester.
    pub singularity_threshold: f64,
    /// Maximum number of Q-space entries; `None` defaults to
    /// `max(n_roots, 16)`.
    pub max_q: Option<usize>,
    /// Quasi-Newton algorithm (optimisation variant).
    pub algorithm: Algorithm,
    /// Seek a minimum (`true`) or a maximum (`false`).
    pub minimize: bool,
    /// Which quantity the error vector reports.
    pub convergence: Convergence,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            n_dimension: 0,
            n_roots: 0,
            thresh: 1e-8,
            thresh_value: None,
            max_iterations: 1000,
            verbosity: 0,
            hermitian: false,
            orthogonalise_q: true,
            augmented_hessian: 0.0,
            svd_threshold: 1e-15,
            singularity_threshold: 1e-5,
            max_q: None,
            algorithm: Algorithm::LBfgs,
            minimize: true,
            convergence: Convergence::Residual,
        }
    }
}

impl Options {
    /// The effective Q-space cap.
    pub fn effective_max_q(&self) -> usize {
        self.max_q.unwrap_or_else(|| self.n_roots.max(16))
    }

    /// Sets an option from its string key and value, the surface exposed to
    /// external-language bindings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SolverError> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SolverError> {
            value.parse().map_err(|_| {
                SolverError(SolverErrorKind::InputError(format!(
                    "cannot parse value {value:?} for option {key:?}"
                )))
            })
        }

        match key {
            "nDimension" => self.n_dimension = parse(key, value)?,
            "nRoots" => self.n_roots = parse(key, value)?,
            "thresh" => self.thresh = parse(key, value)?,
            "thresh_value" => self.thresh_value = Some(parse(key, value)?),
            "maxIterations" => self.max_iterations = parse(key, value)?,
            "verbosity" => self.verbosity = parse(key, value)?,
            "hermitian" => self.hermitian = parse(key, value)?,
            "orthogonalise_Q" => self.orthogonalise_q = parse(key, value)?,
            "augmented_hessian" => self.augmented_hessian = parse(key, value)?,
            "svdThreshold" => self.svd_threshold = parse(key, value)?,
            "singularity_threshold" => self.singularity_threshold = parse(key, value)?,
            "maxQ" => self.max_q = Some(parse(key, value)?),
            "algorithm" => {
                self.algorithm = match value {
                    "L-BFGS" => Algorithm::LBfgs,
                    "null" => Algorithm::Null,
                    _ => {
                        return Err(SolverError(SolverErrorKind::InputError(format!(
                            "unknown algorithm {value:?}; expected \"L-BFGS\" or \"null\""
                        ))))
                    }
                }
            }
            "minimize" => self.minimize = parse(key, value)?,
            "convergence" => {
                self.convergence = match value {
                    "residual" => Convergence::Residual,
                    "step" => Convergence::Step,
                    "energy" => Convergence::Energy,
                    _ => {
                        return Err(SolverError(SolverErrorKind::InputError(format!(
                            "unknown convergence measure {value:?}"
                        ))))
                    }
                }
            }
            _ => {
                return Err(SolverError(SolverErrorKind::InputError(format!(
                    "unknown option {key:?}"
                ))))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let opts = Options::default();
        assert_eq!(opts.thresh, 1e-8);
        assert_eq!(opts.svd_threshold, 1e-15);
        assert_eq!(opts.singularity_threshold, 1e-5);
        assert_eq!(opts.effective_max_q(), 16);
        assert_eq!(opts.convergence, Convergence::Residual);
    }

    #[test]
    fn test_max_q_tracks_roots() {
        let mut opts = Options::default();
        opts.n_roots = 20;
        assert_eq!(opts.effective_max_q(), 20);
        opts.max_q = Some(4);
        assert_eq!(opts.effective_max_q(), 4);
    }

    #[test]
    fn test_string_surface_round_trip() {
        let mut opts = Options::default();
        opts.set("nRoots", "3").unwrap();
        opts.set("thresh", "1e-10").unwrap();
        opts.set("algorithm", "null").unwrap();
        opts.set("convergence", "step").unwrap();
        assert_eq!(opts.n_roots, 3);
        assert_eq!(opts.thresh, 1e-10);
        assert_eq!(opts.algorithm, Algorithm::Null);
        assert_eq!(opts.convergence, Convergence::Step);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut opts = Options::default();
        assert!(opts.set("nope", "1").is_err());
        assert!(opts.set("algorithm", "BFGS").is_err());
    }
}
