//! The Q-space: compressed history of past iterates.
//!
//! Each entry pairs a parameter vector with its action image, and caches every
//! interaction the subspace assembly needs: the Q ⊗ Q metric and action
//! blocks, the interactions with the P-space, and the projections onto the
//! right-hand sides. Caching here is what keeps the per-iteration cost down to
//! the R-involving blocks only.
//!
//! Entries are created by one of two policies:
//!
//! - [`QSpace::add`] stores the vector pair as given. Used to freeze converged
//!   solutions into the history.
//! - [`QSpace::add_difference`] stores the normalised difference of two
//!   consecutive iterates, optionally orthogonalised against the newer one.
//!   The difference basis is what quasi-Newton methods need: the stored pair
//!   is `(s/‖s‖, y/‖s‖)` with `s = x_k − x_{k−1}`, `y = A s` (linear) or
//!   `g_k − g_{k−1}` (non-linear).
//!
//! Every entry carries a stable key so the driver can recognise frozen
//! solutions after unrelated entries have been evicted.

use crate::subspace::pspace::PSpace;
use crate::vector::{SolverVector, StorageHint};

/// Smallest difference norm that still produces a usable Q entry. Below this
/// the iterates are numerically identical and the entry is skipped.
const DIFFERENCE_BREAKDOWN: f64 = 1e-100;

struct QEntry<V> {
    key: usize,
    param: V,
    action: V,
    /// `1/‖d‖` for difference entries, 1 for direct entries.
    scale: f64,
    /// `⟨q | b_r⟩` per right-hand side.
    rhs: Vec<f64>,
    /// `⟨q | p_i⟩` per P vector.
    metric_p: Vec<f64>,
    /// `⟨A(q) | p_i⟩` per P vector.
    action_p: Vec<f64>,
}

/// Container of history vectors and their cached reduced-space blocks.
pub struct QSpace<V> {
    entries: Vec<QEntry<V>>,
    /// `metric[a][b] = ⟨q_a | q_b⟩`.
    metric: Vec<Vec<f64>>,
    /// `action[a][b] = ⟨q_a | A(q_b)⟩`, or `⟨A(q_a) | A(q_b)⟩` in
    /// residual-residual mode.
    action: Vec<Vec<f64>>,
    res_res: bool,
    next_key: usize,
}

impl<V: SolverVector> QSpace<V> {
    /// Creates an empty history. `res_res` selects the residual-residual
    /// subspace-matrix convention used by DIIS.
    pub fn new(res_res: bool) -> Self {
        Self {
            entries: Vec::new(),
            metric: Vec::new(),
            action: Vec::new(),
            res_res,
            next_key: 0,
        }
    }

    /// Number of stored entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// The `a`-th parameter vector.
    pub fn param(&self, a: usize) -> &V {
        &self.entries[a].param
    }

    /// The `a`-th action vector.
    pub fn action_vec(&self, a: usize) -> &V {
        &self.entries[a].action
    }

    /// Cached metric entry `⟨q_a | q_b⟩`.
    pub fn metric(&self, a: usize, b: usize) -> f64 {
        self.metric[a][b]
    }

    /// Cached action entry `⟨q_a | A(q_b)⟩`.
    pub fn action(&self, a: usize, b: usize) -> f64 {
        self.action[a][b]
    }

    /// Projections of entry `a` onto the right-hand sides.
    pub fn rhs(&self, a: usize) -> &[f64] {
        &self.entries[a].rhs
    }

    /// Cached `⟨q_a | p_i⟩` row.
    pub fn metric_p(&self, a: usize) -> &[f64] {
        &self.entries[a].metric_p
    }

    /// Cached `⟨A(q_a) | p_i⟩` row.
    pub fn action_p(&self, a: usize) -> &[f64] {
        &self.entries[a].action_p
    }

    /// The normalisation factor applied when entry `a` was stored; the
    /// original step length of a difference entry is `1 / scale_factor(a)`.
    pub fn scale_factor(&self, a: usize) -> f64 {
        self.entries[a].scale
    }

    /// Stable key of entry `a`.
    pub fn key(&self, a: usize) -> usize {
        self.entries[a].key
    }

    /// Stores `(param, action)` as given and returns the new entry's key.
    pub fn add(&mut self, param: &V, action: &V, rhs: &[V], pspace: &PSpace) -> usize {
        let param = param.clone_with_hint(StorageHint::Distributed);
        let action = action.clone_with_hint(StorageHint::Distributed);
        self.push_entry(param, action, 1.0, rhs, pspace)
    }

    /// Stores the normalised difference between consecutive iterates.
    ///
    /// With `orthogonalise` the difference is first made orthogonal to the
    /// newer iterate, the same projection being applied to the action pair to
    /// keep it consistent. Returns the new key, or `None` when the iterates
    /// are numerically identical.
    #[allow(clippy::too_many_arguments)]
    pub fn add_difference(
        &mut self,
        new: &V,
        new_action: &V,
        old: &V,
        old_action: &V,
        rhs: &[V],
        pspace: &PSpace,
        orthogonalise: bool,
    ) -> Option<usize> {
        let mut d = new.clone_with_hint(StorageHint::Distributed);
        d.axpy(-1.0, old);
        let mut hd = new_action.clone_with_hint(StorageHint::Distributed);
        hd.axpy(-1.0, old_action);
        if orthogonalise {
            let nn = new.dot(new);
            if nn > 0.0 {
                let coeff = new.dot(&d) / nn;
                d.axpy(-coeff, new);
                hd.axpy(-coeff, new_action);
            }
        }
        let norm2 = d.dot(&d);
        if !(norm2 > DIFFERENCE_BREAKDOWN) {
            return None;
        }
        let scale = 1.0 / norm2.sqrt();
        d.scal(scale);
        hd.scal(scale);
        Some(self.push_entry(d, hd, scale, rhs, pspace))
    }

    fn push_entry(&mut self, param: V, action: V, scale: f64, rhs: &[V], pspace: &PSpace) -> usize {
        let n = self.entries.len();
        // Interactions of the new entry with the existing ones, both
        // orientations since the operator need not be self-adjoint.
        let mut metric_row = Vec::with_capacity(n + 1);
        let mut action_row = Vec::with_capacity(n + 1);
        for b in 0..n {
            metric_row.push(param.dot(&self.entries[b].param));
            action_row.push(if self.res_res {
                action.dot(&self.entries[b].action)
            } else {
                param.dot(&self.entries[b].action)
            });
        }
        metric_row.push(param.dot(&param));
        action_row.push(if self.res_res {
            action.dot(&action)
        } else {
            param.dot(&action)
        });
        for b in 0..n {
            self.metric[b].push(self.entries[b].param.dot(&param));
            self.action[b].push(if self.res_res {
                self.entries[b].action.dot(&action)
            } else {
                self.entries[b].param.dot(&action)
            });
        }
        self.metric.push(metric_row);
        self.action.push(action_row);

        let key = self.next_key;
        let entry = QEntry {
            key,
            rhs: rhs.iter().map(|b| param.dot(b)).collect(),
            metric_p: (0..pspace.size())
                .map(|i| param.dot_sparse(pspace.vector(i)))
                .collect(),
            action_p: (0..pspace.size())
                .map(|i| action.dot_sparse(pspace.vector(i)))
                .collect(),
            param,
            action,
            scale,
        };
        self.next_key += 1;
        self.entries.push(entry);
        key
    }

    /// Removes entry `a` and its cached rows and columns.
    pub fn remove(&mut self, a: usize) {
        self.entries.remove(a);
        self.metric.remove(a);
        self.action.remove(a);
        for row in &mut self.metric {
            row.remove(a);
        }
        for row in &mut self.action {
            row.remove(a);
        }
    }

    /// Rebuilds the cached P interactions of every entry. Called after the
    /// P-space has grown.
    pub fn refresh_p(&mut self, pspace: &PSpace) {
        for entry in &mut self.entries {
            entry.metric_p = (0..pspace.size())
                .map(|i| entry.param.dot_sparse(pspace.vector(i)))
                .collect();
            entry.action_p = (0..pspace.size())
                .map(|i| entry.action.dot_sparse(pspace.vector(i)))
                .collect();
        }
    }
}
