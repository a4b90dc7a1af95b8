//! The optimisation variant: cubic line search with Wolfe acceptance and the
//! L-BFGS quasi-Newton update.
//!
//! The Q-space doubles as the L-BFGS memory. Each accepted iterate contributes
//! a curvature pair through the difference policy of
//! [`QSpace::add_difference`](crate::subspace::QSpace::add_difference): the
//! stored parameter is `s/‖s‖` and the stored action is `y/‖s‖`, so the
//! cached action matrix holds the `⟨s|y⟩` products the recursion needs, and
//! `1/scale_factor` recovers the raw step length.
//!
//! The two-loop recursion is split around the caller's preconditioner. The
//! reduced solve runs the first loop and leaves its coefficients in the
//! interpolation matrix, so the residual handed back by `add_vector` is the
//! partially transformed gradient. The caller applies its preconditioner (the
//! `H₀` of L-BFGS) to that, and `end_iteration` completes the second loop and
//! re-anchors the step at the best point seen so far.
//!
//! When the latest step fails both Wolfe conditions, the quasi-Newton update
//! is postponed: the cubic interpolant over the last accepted point and the
//! current iterate proposes a new step length along the same direction, which
//! `end_iteration` applies directly.

use crate::error::{SolverError, SolverErrorKind};
use crate::options::Algorithm;
use crate::reduced::cubic_minimum;
use crate::solver::IterativeSolver;
use crate::vector::{SolverVector, StorageHint};
use faer::Mat;

/// Line-search bookkeeping for the optimisation variant.
pub(crate) struct OptimizeState<V> {
    /// Whether the curvature condition is applied in its strong form.
    pub strong_wolfe: bool,
    /// Sufficient-decrease parameter `c₁`.
    pub wolfe_1: f64,
    /// Curvature parameter `c₂`.
    pub wolfe_2: f64,
    /// A predicted step within this distance of 1 is accepted as is.
    pub linesearch_tolerance: f64,
    /// Cap on extrapolating steps, as a multiple of the current step.
    pub linesearch_grow_factor: f64,
    /// The pending line-search step length; zero means quasi-Newton mode.
    pub linesearch_steplength: f64,
    /// Best accepted point so far.
    pub best: Option<BestPoint<V>>,
}

/// Snapshot of the best iterate: parameters, gradient and objective value.
pub(crate) struct BestPoint<V> {
    pub param: V,
    pub gradient: V,
    pub value: f64,
}

fn optimize_state_missing() -> SolverError {
    SolverError(SolverErrorKind::InputError(
        "optimisation state is only available on the optimisation variant".into(),
    ))
}

impl<V> OptimizeState<V> {
    pub fn new() -> Self {
        Self {
            strong_wolfe: true,
            // Recommended values, Nocedal and Wright p. 142.
            wolfe_1: 1e-4,
            wolfe_2: 0.9,
            linesearch_tolerance: 0.2,
            linesearch_grow_factor: 3.0,
            linesearch_steplength: 0.0,
            best: None,
        }
    }
}

impl<V: SolverVector> IterativeSolver<V> {
    /// Reduced "solve" of the optimisation variant: decide between accepting
    /// the iterate (and running the first L-BFGS loop) and issuing a new
    /// line-search step.
    pub(crate) fn solve_reduced_optimize(&mut self) -> Result<(), SolverError> {
        let n = self.qspace.size();
        // Objective values are stored minimisation-oriented; directional
        // gradients get the same orientation through this sign.
        let sign = if self.opts.minimize { 1.0 } else { -1.0 };
        let f1 = *self
            .values
            .last()
            .ok_or_else(|| {
                SolverError(SolverErrorKind::InputError(
                    "the optimisation variant requires add_value, not add_vector".into(),
                ))
            })?;

        if n > 0 {
            let state = self.optimize.as_ref().ok_or_else(optimize_state_missing)?;
            let best = state.best.as_ref().ok_or_else(|| {
                SolverError(SolverErrorKind::InputError(
                    "line-search state missing a best point".into(),
                ))
            })?;
            let step = 1.0 / self.qspace.scale_factor(n - 1);
            let f0 = best.value;
            let g1 = sign * step * self.rblocks.h_qr[n - 1][0];
            let g0 = sign * step * best.gradient.dot(self.qspace.param(n - 1));
            let wolfe_1 = f1 <= f0 + state.wolfe_1 * g0;
            let wolfe_2 = if state.strong_wolfe {
                g1 >= state.wolfe_2 * g0
            } else {
                g1.abs() <= state.wolfe_2 * g0.abs()
            };
            if self.opts.verbosity > 1 {
                log::debug!(
                    "line search: step={step}, f0={f0}, f1={f1}, g0={g0}, g1={g1}, Wolfe1={wolfe_1}, Wolfe2={wolfe_2}"
                );
            }
            if !(g1 < self.opts.thresh || (wolfe_1 && wolfe_2)) {
                let mut interpolated = cubic_minimum(f0, f1, g0, g1);
                if let Some((alpha, _)) = interpolated {
                    // Not bracketed: the interpolant points away from the
                    // minimum.
                    if (g0 > 0.0 && g1 > 0.0 && alpha > 0.0)
                        || (g0 < 0.0 && g1 < 0.0 && alpha < 1.0)
                    {
                        interpolated = None;
                    }
                }
                let grow = state.linesearch_grow_factor;
                let (alpha, accept_within_tolerance) = match interpolated {
                    None => {
                        if self.opts.verbosity > 1 {
                            log::debug!(
                                "cubic interpolation found no valid minimum; taking step {grow}"
                            );
                        }
                        (grow, false)
                    }
                    Some((alpha, f_predicted)) if alpha > grow => {
                        if self.opts.verbosity > 1 {
                            log::debug!(
                                "rejecting interpolated minimum {f_predicted} at alpha={alpha}; clamping step to {grow}"
                            );
                        }
                        (grow, false)
                    }
                    Some((alpha, _)) if (alpha - 1.0).abs() < state.linesearch_tolerance => {
                        // Within spitting distance of the unit step already.
                        (alpha, true)
                    }
                    Some((alpha, f_predicted)) => {
                        if self.opts.verbosity > 1 {
                            log::debug!(
                                "cubic interpolant has minimum {f_predicted} at alpha={alpha} (absolute step {})",
                                (alpha - 1.0) * step
                            );
                        }
                        (alpha, false)
                    }
                };
                if !accept_within_tolerance {
                    // Issue a line-search step along the last direction: the
                    // interpolation selects the current trial vector and
                    // end_iteration applies the step from the best point.
                    let mut interpolation = Mat::<f64>::zeros(n + 1, 1);
                    interpolation.as_mut()[(n, 0)] = 1.0;
                    self.interpolation = interpolation;
                    let new_best = if f1 <= f0 {
                        Some(BestPoint {
                            param: self.current_r[0].clone_with_hint(StorageHint::Offline),
                            gradient: self.current_v[0].clone_with_hint(StorageHint::Offline),
                            value: f1,
                        })
                    } else {
                        None
                    };
                    let state = self.optimize.as_mut().ok_or_else(optimize_state_missing)?;
                    state.linesearch_steplength = (alpha - 1.0) * step;
                    if let Some(best) = new_best {
                        state.best = Some(best);
                    }
                    self.nullify_solution_before_update = false;
                    return Ok(());
                }
            }
        }

        // Accept the iterate: record it as the best point, run the first
        // L-BFGS loop, and ask the caller for a fresh preconditioned update.
        let mut interpolation = Mat::<f64>::zeros(n + 1, 1);
        interpolation.as_mut()[(n, 0)] = 1.0;
        if self.opts.algorithm == Algorithm::LBfgs {
            let mut minus_alpha = vec![0.0; n];
            for a in (0..n).rev() {
                let mut coeff = -self.rblocks.h_qr[a][0];
                for b in (a + 1)..n {
                    coeff -= minus_alpha[b] * self.qspace.action(a, b);
                }
                coeff /= self.qspace.action(a, a);
                minus_alpha[a] = coeff;
            }
            for a in 0..n {
                interpolation.as_mut()[(a, 0)] = minus_alpha[a];
            }
        }
        self.interpolation = interpolation;
        self.nullify_solution_before_update = true;
        let best = BestPoint {
            param: self.current_r[0].clone_with_hint(StorageHint::Offline),
            gradient: self.current_v[0].clone_with_hint(StorageHint::Offline),
            value: f1,
        };
        let state = self.optimize.as_mut().ok_or_else(optimize_state_missing)?;
        state.linesearch_steplength = 0.0;
        state.best = Some(best);
        Ok(())
    }

    /// Finalises the iteration for the optimisation variant: either apply the
    /// pending line-search step, or complete the L-BFGS recursion on the
    /// caller's preconditioned update.
    pub(crate) fn end_iteration_optimize(
        &mut self,
        solution: &mut [V],
    ) -> Result<(), SolverError> {
        if self.q_solutions.contains_key(&0) || solution.is_empty() {
            return Ok(());
        }
        let Some(state) = self.optimize.as_ref() else {
            return Ok(());
        };
        if state.linesearch_steplength != 0.0 {
            let steplength = state.linesearch_steplength;
            let Some(best) = state.best.as_ref() else {
                return Err(SolverError(SolverErrorKind::InputError(
                    "line-search state missing a best point".into(),
                )));
            };
            let n = self.qspace.size();
            if n == 0 {
                return Err(SolverError(SolverErrorKind::InputError(
                    "line-search step pending without a search direction".into(),
                )));
            }
            solution[0].scal(0.0);
            solution[0].axpy(1.0, &best.param);
            solution[0].axpy(steplength, self.qspace.param(n - 1));
            // The rejected iterate's value and direction leave the history;
            // the next add_value supplies their replacements.
            self.values.pop();
            self.qspace.remove(n - 1);
        } else if self.opts.algorithm == Algorithm::LBfgs && self.interpolation.nrows() > 0 {
            // Second loop of the recursion, on top of the caller's
            // preconditioned gradient already in `solution`.
            let n = self.qspace.size();
            for a in 0..n {
                let factor = self.interpolation.as_ref()[(a, 0)]
                    - self.qspace.action_vec(a).dot(&solution[0]) / self.qspace.action(a, a);
                solution[0].axpy(factor, self.qspace.param(a));
            }
            if let Some(best) = self.optimize.as_ref().and_then(|s| s.best.as_ref()) {
                solution[0].axpy(1.0, &best.param);
            }
        }
        Ok(())
    }
}
