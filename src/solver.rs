//! The iteration driver: one call per outer iteration, shared by all four
//! solver variants.
//!
//! The calling program sets up its own iterative loop, and in each iteration
//!
//! - evaluates the action of the operator on the current trial vectors
//!   (linear), or the value and gradient at the current point (non-linear);
//! - calls [`IterativeSolver::add_vector`] (or
//!   [`IterativeSolver::add_value`]), which absorbs the trial vectors into the
//!   subspace, solves the reduced problem, and overwrites the inputs with the
//!   interpolated solution and residual;
//! - applies its preconditioner to the returned residual;
//! - calls [`IterativeSolver::end_iteration`], which reports and answers
//!   whether every root has converged.
//!
//! The driver is single-threaded and cooperative: it holds no locks, spawns
//! nothing, and every observable pause is a return to the caller. A solver
//! instance must not be shared between concurrent solves.
//!
//! Numerical recovery (redundant-subspace eviction, SVD truncation, failed
//! Wolfe steps) happens internally; only arithmetic failure in the dense
//! solver and caller misuse surface as [`SolverError`].

use std::collections::BTreeMap;

use faer::{c64, Mat};

use crate::error::{SolverError, SolverErrorKind};
use crate::optimize::OptimizeState;
use crate::options::{Convergence, Options};
use crate::reduced::{solve_diis, solve_generalised_eigenproblem, solve_linear_equations};
use crate::subspace::data::{propose_singularity_deletion, RBlocks};
use crate::subspace::{PSpace, QSpace, SubspaceData};
use crate::vector::{PVector, SolverVector, StorageHint};

/// Error value assigned to every root while the subspace is being repaired;
/// it keeps a partially rebuilt iteration from reporting convergence.
const INVALIDATED_ERROR: f64 = 1e20;

/// The outer problem class a solver instance was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Lowest eigenpairs of `H x = λ x` by Davidson's method.
    LinearEigensystem,
    /// Linear equations `H x = b`, optionally in augmented-Hessian form.
    LinearEquations,
    /// Non-linear minimisation by line-searched L-BFGS.
    Optimize,
    /// Non-linear equations accelerated by DIIS.
    Diis,
}

/// The iterative subspace engine.
///
/// Construct one instance per problem through [`linear_eigensystem`],
/// [`linear_equations`], [`optimize`] or [`diis`], then drive it as described
/// in the [module documentation](self).
///
/// [`linear_eigensystem`]: IterativeSolver::linear_eigensystem
/// [`linear_equations`]: IterativeSolver::linear_equations
/// [`optimize`]: IterativeSolver::optimize
/// [`diis`]: IterativeSolver::diis
pub struct IterativeSolver<V: SolverVector> {
    pub(crate) opts: Options,
    pub(crate) variant: Variant,
    /// Whether the action images are linear in the trial vectors.
    pub(crate) linear: bool,
    /// Whether the residual is `A x − λ x` and solutions are kept normalised.
    pub(crate) residual_eigen: bool,
    /// Whether the residual subtracts a right-hand side.
    pub(crate) residual_rhs: bool,
    /// Whether the reduced operator is built from action-action overlaps.
    pub(crate) subspace_matrix_res_res: bool,
    pub(crate) exclude_r_from_redundancy_test: bool,
    pub(crate) nullify_solution_before_update: bool,
    pub(crate) pspace: PSpace,
    pub(crate) qspace: QSpace<V>,
    pub(crate) rhs: Vec<V>,
    pub(crate) data: SubspaceData,
    pub(crate) rblocks: RBlocks,
    /// Columns combine the subspace basis into the next trial solutions.
    pub(crate) interpolation: Mat<f64>,
    pub(crate) eigenvalues: Vec<c64>,
    pub(crate) update_shift: Vec<f64>,
    pub(crate) working_set: Vec<usize>,
    /// Q-space keys of frozen converged solutions, by root.
    pub(crate) q_solutions: BTreeMap<usize, usize>,
    pub(crate) errors: Vec<f64>,
    pub(crate) values: Vec<f64>,
    pub(crate) value_print_name: String,
    /// Interpolated solutions of the previous call, one per working root.
    pub(crate) last_d: Vec<V>,
    pub(crate) last_hd: Vec<V>,
    /// Copies of the trial vectors of the current call.
    pub(crate) current_r: Vec<V>,
    pub(crate) current_v: Vec<V>,
    pub(crate) iterations: usize,
    pub(crate) optimize: Option<OptimizeState<V>>,
}

impl<V: SolverVector> IterativeSolver<V> {
    fn with_variant(variant: Variant, opts: Options, rhs: Vec<V>) -> Self {
        let res_res = variant == Variant::Diis;
        Self {
            linear: matches!(
                variant,
                Variant::LinearEigensystem | Variant::LinearEquations
            ),
            residual_eigen: variant == Variant::LinearEigensystem,
            residual_rhs: variant == Variant::LinearEquations,
            subspace_matrix_res_res: res_res,
            exclude_r_from_redundancy_test: matches!(variant, Variant::Optimize | Variant::Diis),
            nullify_solution_before_update: false,
            pspace: PSpace::default(),
            qspace: QSpace::new(res_res),
            rhs,
            data: SubspaceData::default(),
            rblocks: RBlocks::default(),
            interpolation: Mat::zeros(0, 0),
            eigenvalues: Vec::new(),
            update_shift: Vec::new(),
            working_set: Vec::new(),
            q_solutions: BTreeMap::new(),
            errors: Vec::new(),
            values: Vec::new(),
            value_print_name: "value".into(),
            last_d: Vec::new(),
            last_hd: Vec::new(),
            current_r: Vec::new(),
            current_v: Vec::new(),
            iterations: 0,
            optimize: (variant == Variant::Optimize).then(OptimizeState::new),
            opts,
            variant,
        }
    }

    /// A solver for the lowest eigenpairs of `H x = λ x`, Davidson's method
    /// (preconditioned Lanczos).
    pub fn linear_eigensystem(opts: Options) -> Self {
        Self::with_variant(Variant::LinearEigensystem, opts, Vec::new())
    }

    /// A solver for the linear equations `H x = b`, one equation per
    /// right-hand side. The right-hand sides are copied to slow storage;
    /// `augmented_hessian` in `opts` selects the damped embedding.
    pub fn linear_equations(rhs: &[V], mut opts: Options) -> Self {
        if opts.n_roots == 0 {
            opts.n_roots = rhs.len();
        }
        let rhs = rhs
            .iter()
            .map(|b| b.clone_with_hint(StorageHint::Distributed))
            .collect();
        Self::with_variant(Variant::LinearEquations, opts, rhs)
    }

    /// A quasi-Newton optimiser for a scalar function with gradient.
    pub fn optimize(mut opts: Options) -> Self {
        opts.n_roots = 1;
        opts.hermitian = false;
        opts.orthogonalise_q = false;
        // The subspace may go a little redundant without harming the
        // curvature pairs; only the Q-space cap triggers eviction.
        opts.singularity_threshold = 0.0;
        Self::with_variant(Variant::Optimize, opts, Vec::new())
    }

    /// A DIIS accelerator for non-linear equations.
    pub fn diis(mut opts: Options) -> Self {
        opts.n_roots = 1;
        opts.orthogonalise_q = false;
        opts.singularity_threshold = opts.svd_threshold;
        Self::with_variant(Variant::Diis, opts, Vec::new())
    }

    /// Which problem class this instance solves.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// The configuration in effect.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Sets an option from its string key, for external-language bindings.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), SolverError> {
        self.opts.set(key, value)
    }

    /// Sets the convergence threshold.
    pub fn set_thresholds(&mut self, thresh: f64) {
        self.opts.thresh = thresh;
    }

    /// Title used for the objective value in progress reports.
    pub fn set_value_print_name(&mut self, name: impl Into<String>) {
        self.value_print_name = name.into();
    }

    /// How many iterations have run.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Error of each root at the last iteration.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// The roots currently being tracked.
    pub fn working_set(&self) -> &[usize] {
        &self.working_set
    }

    /// Real parts of the reduced-problem eigenvalues, one per requested root.
    pub fn eigenvalues(&self) -> Vec<f64> {
        self.eigenvalues
            .iter()
            .take(self.opts.n_roots)
            .map(|z| z.re)
            .collect()
    }

    /// Eigenvalues belonging to the working set.
    pub fn working_set_eigenvalues(&self) -> Vec<f64> {
        self.working_set
            .iter()
            .filter_map(|&root| self.eigenvalues.get(root).map(|z| z.re))
            .collect()
    }

    /// Level shifts `-(1+ε)·λ` a Davidson preconditioner should apply, one
    /// per root.
    pub fn update_shift(&self) -> &[f64] {
        &self.update_shift
    }

    /// Size of the P space.
    pub fn dimension_p(&self) -> usize {
        self.pspace.size()
    }

    /// Current number of Q-space entries.
    pub fn dimension_q(&self) -> usize {
        self.qspace.size()
    }

    /// Objective values of the accepted iterates (optimisation variant).
    pub fn values(&self) -> Vec<f64> {
        let sign = if self.opts.minimize { 1.0 } else { -1.0 };
        self.values.iter().map(|v| sign * v).collect()
    }

    /// Absorbs the current trial vectors and proposes improved ones.
    ///
    /// `parameters` and `action` carry one entry per root; on entry the
    /// leading entries (one per working root) hold the trial vectors and
    /// their action images, on exit every entry holds the interpolated
    /// solution and its residual. For linear problems `parameters_p`, when
    /// given, receives the P-space part of each solution.
    ///
    /// Returns the size of the working set: the number of roots still
    /// unconverged, zero when the solve is complete.
    pub fn add_vector(
        &mut self,
        parameters: &mut [V],
        action: &mut [V],
        mut parameters_p: Option<&mut Vec<Vec<f64>>>,
    ) -> Result<usize, SolverError> {
        if self.opts.n_roots == 0 {
            self.opts.n_roots = parameters.len();
        }
        if parameters.len() != action.len() {
            return Err(SolverError(SolverErrorKind::MismatchedInputs {
                param_count: parameters.len(),
                action_count: action.len(),
            }));
        }
        if self.qspace.size() == 0 && self.working_set.is_empty() && self.iterations == 0 {
            self.working_set = (0..parameters.len()).collect();
        }
        if self.working_set.is_empty() {
            return Ok(0);
        }
        if parameters.len() < self.working_set.len() {
            return Err(SolverError(SolverErrorKind::InputError(format!(
                "{} trial vectors supplied for {} working roots",
                parameters.len(),
                self.working_set.len()
            ))));
        }
        if self.opts.n_roots > parameters.len() {
            return Err(SolverError(SolverErrorKind::InputError(format!(
                "buffer of {} vectors is smaller than the number of roots {}",
                parameters.len(),
                self.opts.n_roots
            ))));
        }
        self.iterations += 1;

        let n_work = self.working_set.len();
        self.current_r.clear();
        self.current_v.clear();
        for k in 0..n_work {
            let norm_sq = parameters[k].dot(&parameters[k]);
            if !norm_sq.is_finite() {
                return Err(SolverError(SolverErrorKind::InputError(format!(
                    "trial vector {k} has non-finite norm"
                ))));
            }
            if self.residual_eigen && (norm_sq - 1.0).abs() > 1e-3 {
                // A preconditioner responding to near-degeneracy can hand
                // back a very long vector; bring it back to unit length and
                // keep the action image consistent.
                if norm_sq == 0.0 {
                    return Err(SolverError(SolverErrorKind::InputError(format!(
                        "trial vector {k} is zero"
                    ))));
                }
                let factor = 1.0 / norm_sq.sqrt();
                parameters[k].scal(factor);
                action[k].scal(factor);
            }
            self.current_r
                .push(parameters[k].clone_with_hint(StorageHint::Offline));
            self.current_v
                .push(action[k].clone_with_hint(StorageHint::Offline));
        }

        // Promote the previous iterates into the Q space by the difference
        // policy.
        if !self.last_d.is_empty() {
            debug_assert_eq!(self.last_d.len(), n_work);
            for k in 0..n_work {
                self.qspace.add_difference(
                    &parameters[k],
                    &action[k],
                    &self.last_d[k],
                    &self.last_hd[k],
                    &self.rhs,
                    &self.pspace,
                    self.opts.orthogonalise_q,
                );
            }
            self.last_d.clear();
            self.last_hd.clear();
        }

        self.rblocks = RBlocks::compute(
            &parameters[..n_work],
            &action[..n_work],
            &self.qspace,
            &self.pspace,
            &self.rhs,
            self.subspace_matrix_res_res,
            self.opts.hermitian,
        );
        self.build_subspace()?;
        self.solve_reduced_problem()?;

        // Every root re-enters the working set for interpolation; converged
        // ones are pruned again below.
        let previous_working_set = std::mem::take(&mut self.working_set);
        self.working_set = (0..self.opts.n_roots).collect();
        let ws = self.working_set.clone();
        self.errors.resize(self.opts.n_roots, 0.0);

        if self.linear {
            self.do_interpolation(
                &ws,
                parameters,
                action,
                parameters_p.as_mut().map(|p| &mut **p),
                false,
            )?;
        }
        // Residual norms first; for non-linear variants the action still
        // holds the raw gradient here, which is exactly the error wanted.
        for (k, &root) in ws.iter().enumerate() {
            self.errors[root] = action[k].dot(&action[k]).sqrt();
        }
        if self.linear && self.opts.convergence != Convergence::Residual {
            // Step-based measures exist only for the roots that supplied a
            // trial vector this call; frozen roots keep their residual norm.
            for (k_old, &root) in previous_working_set.iter().enumerate() {
                let mut step = parameters[root].clone_with_hint(StorageHint::InMemory);
                step.axpy(-1.0, &self.current_r[k_old]);
                self.errors[root] = match self.opts.convergence {
                    Convergence::Step => step.dot(&step).sqrt(),
                    _ => step.dot(&action[root]).abs(),
                };
            }
        }

        // Re-interpolate action images (not residuals) so that converged
        // solutions are frozen as consistent (x, A x) pairs.
        self.do_interpolation(&ws, parameters, action, None, true)?;

        self.last_d.clear();
        self.last_hd.clear();
        let mut k = 0;
        while k < self.working_set.len() {
            let root = self.working_set[k];
            let converged = self.linear && self.errors[root] < self.opts.thresh;
            if converged && !self.q_solutions.contains_key(&root) {
                if self.opts.verbosity > 1 {
                    log::debug!(
                        "freezing converged root {root} into the Q space at position {}",
                        self.qspace.size()
                    );
                }
                let key = self
                    .qspace
                    .add(&parameters[k], &action[k], &self.rhs, &self.pspace);
                self.q_solutions.insert(root, key);
            }
            if converged {
                let n_ws = self.working_set.len();
                parameters[k..n_ws].rotate_left(1);
                action[k..n_ws].rotate_left(1);
                self.working_set.remove(k);
            } else {
                self.last_d
                    .push(parameters[k].clone_with_hint(StorageHint::Offline));
                self.last_hd
                    .push(action[k].clone_with_hint(StorageHint::Offline));
                k += 1;
            }
        }
        debug_assert_eq!(self.last_d.len(), self.working_set.len());

        // Re-establish the residual for the surviving working set.
        let ws = self.working_set.clone();
        self.do_interpolation(
            &ws,
            parameters,
            action,
            parameters_p.as_mut().map(|p| &mut **p),
            false,
        )?;

        if self.nullify_solution_before_update {
            // The caller rebuilds the solution entirely from the
            // preconditioned residual; hand back zero and remember the raw
            // iterate for the next difference pair.
            self.last_d.clear();
            self.last_hd.clear();
            for k in 0..self.working_set.len() {
                parameters[k].scal(0.0);
                self.last_d
                    .push(self.current_r[k].clone_with_hint(StorageHint::Offline));
                self.last_hd
                    .push(self.current_v[k].clone_with_hint(StorageHint::Offline));
            }
        }
        Ok(self.working_set.len())
    }

    /// Absorbs the current point, objective value and gradient (optimisation
    /// variant). See [`add_vector`](Self::add_vector) for the vector
    /// contract.
    pub fn add_value(
        &mut self,
        parameters: &mut V,
        value: f64,
        action: &mut V,
    ) -> Result<usize, SolverError> {
        let stored = if self.opts.minimize { value } else { -value };
        self.values.push(stored);
        self.add_vector(
            std::slice::from_mut(parameters),
            std::slice::from_mut(action),
            None,
        )
    }

    /// Installs P-space vectors. Must precede the first
    /// [`add_vector`](Self::add_vector); `pp` is the operator projected onto
    /// the (existing + new, new) P set with the existing-plus-new index
    /// running fastest.
    ///
    /// On exit `parameters` holds the interpolated solutions, `action` their
    /// Q-space residual contributions (the P-space action must be added by
    /// the caller), and `parameters_p` the P-space coefficients.
    pub fn add_p(
        &mut self,
        pvectors: Vec<PVector>,
        pp: &[f64],
        parameters: &mut [V],
        action: &mut [V],
        parameters_p: &mut Vec<Vec<f64>>,
    ) -> Result<usize, SolverError> {
        if self.iterations > 0 {
            return Err(SolverError(SolverErrorKind::PSpaceAfterIteration {
                iterations: self.iterations,
            }));
        }
        if parameters.len() != action.len() {
            return Err(SolverError(SolverErrorKind::MismatchedInputs {
                param_count: parameters.len(),
                action_count: action.len(),
            }));
        }
        if self.opts.n_roots == 0 {
            self.opts.n_roots = parameters.len();
        }
        if self.opts.n_roots > parameters.len() {
            return Err(SolverError(SolverErrorKind::InputError(format!(
                "buffer of {} vectors is smaller than the number of roots {}",
                parameters.len(),
                self.opts.n_roots
            ))));
        }
        self.pspace.add(pvectors, pp, &self.rhs)?;
        self.qspace.refresh_p(&self.pspace);
        if self.working_set.is_empty() {
            self.working_set = (0..self.opts.n_roots).collect();
        }
        self.current_r.clear();
        self.current_v.clear();
        self.rblocks = RBlocks::default();
        self.build_subspace()?;
        self.solve_reduced_problem()?;
        let ws = self.working_set.clone();
        self.do_interpolation(&ws, parameters, action, Some(parameters_p), false)?;
        Ok(parameters.len())
    }

    /// Finalises the iteration: completes the quasi-Newton update for the
    /// optimisation variant, reports progress, and answers whether every root
    /// has converged.
    pub fn end_iteration(
        &mut self,
        solution: &mut [V],
        _residual: &[V],
    ) -> Result<bool, SolverError> {
        if self.variant == Variant::Optimize {
            self.end_iteration_optimize(solution)?;
        }
        self.report();
        let mut converged = !self.errors.is_empty()
            && self
                .errors
                .iter()
                .fold(f64::NEG_INFINITY, |acc, &e| acc.max(e))
                < self.opts.thresh;
        if self.variant == Variant::Optimize {
            if let Some(thresh_value) = self.opts.thresh_value {
                if self.values.len() >= 2 {
                    let delta = self.values[self.values.len() - 1]
                        - self.values[self.values.len() - 2];
                    if delta.abs() < thresh_value {
                        converged = true;
                    }
                }
            }
        }
        Ok(converged)
    }

    /// Recomputes the stored interpolated solution and residual for the given
    /// roots, without advancing the iteration.
    pub fn solution(
        &self,
        roots: &[usize],
        parameters: &mut [V],
        residual: &mut [V],
    ) -> Result<(), SolverError> {
        self.do_interpolation(roots, parameters, residual, None, false)
    }

    /// Ranks full-vector indices the P-space lacks by how much adding them
    /// would reduce the residual. Purely advisory; deduplicated over roots,
    /// at most `maximum_number` entries, scores above `threshold` only.
    pub fn suggest_p(
        &self,
        solution: &[V],
        residual: &[V],
        maximum_number: usize,
        threshold: f64,
    ) -> Vec<usize> {
        let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
        for k in 0..solution.len().min(residual.len()) {
            let active = self.errors.len() <= k || self.errors[k] >= self.opts.thresh;
            if !active {
                continue;
            }
            for (index, score) in solution[k].select(&residual[k], maximum_number, threshold) {
                merged
                    .entry(index)
                    .and_modify(|s| *s = s.max(score))
                    .or_insert(score);
            }
        }
        let mut ranked: Vec<(usize, f64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(maximum_number);
        ranked.into_iter().map(|(index, _)| index).collect()
    }

    /// Writes the per-iteration progress line, gated on verbosity.
    pub fn report(&self) {
        if self.opts.verbosity == 0 {
            return;
        }
        let mut line = format!("iteration {}[{}]", self.iterations, self.working_set.len());
        if self.pspace.size() > 0 {
            line.push_str(&format!(", P={}", self.pspace.size()));
        }
        if let Some(state) = &self.optimize {
            if state.linesearch_steplength != 0.0 {
                line.push_str(&format!(
                    ", line search step = {}",
                    state.linesearch_steplength
                ));
            }
        }
        if let Some(&value) = self.values.last() {
            let sign = if self.opts.minimize { 1.0 } else { -1.0 };
            line.push_str(&format!(", {} = {}", self.value_print_name, sign * value));
        }
        if !self.errors.is_empty() {
            let (worst, error) = self
                .errors
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |acc, (i, &e)| {
                    if e > acc.1 {
                        (i, e)
                    } else {
                        acc
                    }
                });
            if self.opts.n_roots > 1 {
                line.push_str(&format!(", error[{worst}] = {error:e}"));
            } else {
                line.push_str(&format!(", error = {error:e}"));
            }
        }
        if self.variant == Variant::LinearEigensystem && !self.eigenvalues.is_empty() {
            line.push_str(", eigenvalues:");
            for e in self.eigenvalues() {
                line.push_str(&format!(" {e}"));
            }
        }
        log::info!("{line}");
    }

    /// Assembles the reduced matrices, evicting redundant Q vectors until the
    /// subspace passes the conditioning test.
    fn build_subspace(&mut self) -> Result<(), SolverError> {
        let max_q = self.opts.effective_max_q();
        loop {
            self.data = SubspaceData::assemble(
                &self.pspace,
                &self.qspace,
                &self.rblocks,
                self.rhs.len(),
                self.subspace_matrix_res_res,
            );
            let dims = self.data.dims;
            if dims.nq == 0 {
                break;
            }
            let frozen: Vec<usize> = self.q_solutions.values().copied().collect();
            let candidates: Vec<usize> = (0..dims.nq)
                .filter(|&a| !frozen.contains(&self.qspace.key(a)))
                .map(|a| dims.o_q() + a)
                .collect();
            let tester = if self.residual_eigen {
                self.data.s.as_ref()
            } else {
                self.data.h.as_ref()
            };
            let tested = if self.exclude_r_from_redundancy_test {
                dims.nx() - dims.nr
            } else {
                dims.nx()
            };
            // Over the Q-space cap the test is made so lax that eviction
            // proceeds until the cap is honoured again.
            let threshold = if dims.nq > max_q {
                1e6
            } else {
                self.opts.singularity_threshold
            };
            match propose_singularity_deletion(tester, tested, &candidates, threshold)? {
                Some(index) => {
                    let a = index - dims.o_q();
                    if self.opts.verbosity > 1 {
                        log::debug!("evicting redundant Q vector {a} (subspace index {index})");
                    }
                    self.qspace.remove(a);
                    self.rblocks.evict_q(a);
                    self.errors = vec![INVALIDATED_ERROR; self.opts.n_roots];
                }
                None => {
                    // The singular-vector test names no candidate when the
                    // most-singular direction lies outside the Q block. The
                    // cap still binds: take the oldest non-frozen entry.
                    if dims.nq > max_q {
                        if let Some(&index) = candidates.first() {
                            let a = index - dims.o_q();
                            if self.opts.verbosity > 1 {
                                log::debug!(
                                    "Q space over its cap of {max_q} with no redundancy candidate; evicting oldest entry {a}"
                                );
                            }
                            self.qspace.remove(a);
                            self.rblocks.evict_q(a);
                            self.errors = vec![INVALIDATED_ERROR; self.opts.n_roots];
                            continue;
                        }
                    }
                    break;
                }
            }
        }
        if self.opts.verbosity > 1 {
            let dims = self.data.dims;
            log::debug!(
                "subspace dimensions nP={}, nQ={}, nR={}",
                dims.np,
                dims.nq,
                dims.nr
            );
            log::trace!(
                "subspace matrix\n{:?}\nsubspace overlap\n{:?}",
                self.data.h,
                self.data.s
            );
        }
        Ok(())
    }

    /// Solves the reduced problem of the active variant and fills the
    /// interpolation matrix.
    fn solve_reduced_problem(&mut self) -> Result<(), SolverError> {
        let eps = f64::EPSILON;
        match self.variant {
            Variant::LinearEigensystem => {
                let reduced = solve_generalised_eigenproblem(
                    self.data.h.as_ref(),
                    self.data.s.as_ref(),
                    self.opts.hermitian,
                    self.opts.svd_threshold,
                    self.opts.verbosity,
                )?;
                let nx = self.data.dims.nx();
                let rank = reduced.eigenvectors.ncols();
                // Zero-padded beyond the retained rank; a root falling in the
                // padding produces a zero-norm solution, which is fatal.
                self.interpolation = Mat::from_fn(nx, self.opts.n_roots, |i, j| {
                    if j < rank {
                        reduced.eigenvectors.as_ref()[(i, j)].re
                    } else {
                        0.0
                    }
                });
                self.eigenvalues = reduced.eigenvalues;
                self.update_shift = (0..self.opts.n_roots)
                    .map(|root| {
                        -(1.0 + eps) * self.eigenvalues.get(root).map_or(0.0, |z| z.re)
                    })
                    .collect();
            }
            Variant::LinearEquations => {
                let (interpolation, eigenvalues) = solve_linear_equations(
                    self.data.h.as_ref(),
                    self.data.s.as_ref(),
                    self.data.rhs.as_ref(),
                    self.opts.augmented_hessian,
                    self.opts.hermitian,
                    self.opts.svd_threshold,
                    self.opts.verbosity,
                )?;
                self.interpolation = interpolation;
                self.update_shift = eigenvalues.iter().map(|z| -(1.0 + eps) * z.re).collect();
                self.eigenvalues = eigenvalues;
            }
            Variant::Optimize => self.solve_reduced_optimize()?,
            Variant::Diis => {
                if self.opts.n_roots > 1 {
                    return Err(SolverError(SolverErrorKind::InputError(
                        "DIIS does not handle multiple solutions".into(),
                    )));
                }
                self.update_shift = vec![-(1.0 + eps) * self.data.h.as_ref()[(0, 0)]];
                self.interpolation = solve_diis(
                    self.data.h.as_ref(),
                    self.opts.svd_threshold,
                    self.opts.verbosity,
                )?;
            }
        }
        Ok(())
    }

    /// Combines the P, Q and R segments into the interpolated solution and
    /// residual for each requested root.
    ///
    /// With `action_only` the residual output is the plain action image and
    /// the P contribution is omitted; otherwise the eigenvalue and
    /// right-hand-side terms complete the residual.
    pub(crate) fn do_interpolation(
        &self,
        roots: &[usize],
        solution: &mut [V],
        residual: &mut [V],
        mut solution_p: Option<&mut Vec<Vec<f64>>>,
        action_only: bool,
    ) -> Result<(), SolverError> {
        if solution.len() < roots.len() || residual.len() < roots.len() {
            return Err(SolverError(SolverErrorKind::MismatchedInputs {
                param_count: solution.len(),
                action_count: residual.len(),
            }));
        }
        let np = self.pspace.size();
        let nr = self.current_r.len();
        // Guard against Q vectors added since the reduced problem was
        // solved: only the rows the interpolation knows about participate.
        let nq = self.interpolation.nrows().saturating_sub(np + nr);
        debug_assert!(nq <= self.qspace.size());
        let o_q = np;
        let o_r = np + nq;
        if let Some(sp) = solution_p.as_mut() {
            sp.resize(roots.len(), Vec::new());
            for coefficients in sp.iter_mut() {
                coefficients.clear();
                coefficients.resize(np, 0.0);
            }
        }
        for k in 0..roots.len() {
            solution[k].scal(0.0);
            residual[k].scal(0.0);
        }
        for (k, &root) in roots.iter().enumerate() {
            if root >= self.interpolation.ncols() {
                return Err(SolverError(SolverErrorKind::ZeroNormSolution { root }));
            }
            for l in 0..np {
                let coefficient = self.interpolation.as_ref()[(l, root)];
                if let Some(sp) = solution_p.as_mut() {
                    sp[k][l] = coefficient;
                }
                if !action_only {
                    solution[k].axpy_sparse(coefficient, self.pspace.vector(l));
                }
            }
            for q in 0..nq {
                let coefficient = self.interpolation.as_ref()[(o_q + q, root)];
                solution[k].axpy(coefficient, self.qspace.param(q));
                residual[k].axpy(coefficient, self.qspace.action_vec(q));
            }
            for r in 0..nr {
                let coefficient = self.interpolation.as_ref()[(o_r + r, root)];
                solution[k].axpy(coefficient, &self.current_r[r]);
                residual[k].axpy(coefficient, &self.current_v[r]);
            }
            if self.residual_eigen {
                let norm_sq = solution[k].dot(&solution[k]);
                if !(norm_sq > 0.0) {
                    return Err(SolverError(SolverErrorKind::ZeroNormSolution { root }));
                }
                let factor = 1.0 / norm_sq.sqrt();
                solution[k].scal(factor);
                residual[k].scal(factor);
            }
            if !action_only
                && (self.residual_eigen
                    || (self.residual_rhs && self.opts.augmented_hessian > 0.0))
            {
                if let Some(eigenvalue) = self.eigenvalues.get(root) {
                    residual[k].axpy(-eigenvalue.re, &solution[k]);
                }
            }
            if !action_only && self.residual_rhs {
                residual[k].axpy(-1.0, &self.rhs[root]);
            }
        }
        Ok(())
    }
}
