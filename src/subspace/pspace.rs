//! The P-space: fixed, sparse "exact" basis vectors.
//!
//! P vectors are coefficient maps over the full-vector index domain. They are
//! installed once, before iteration starts, together with the dense projection
//! of the operator onto the combined old-and-new P set. The overlap block is
//! computed here from the maps themselves; the action block is supplied by the
//! client, because only the client can apply the operator.

use crate::error::{SolverError, SolverErrorKind};
use crate::vector::{sparse_dot, PVector, SolverVector};
use faer::Mat;

/// Container for the P-space basis and its cached reduced-space blocks.
#[derive(Debug)]
pub struct PSpace {
    vectors: Vec<PVector>,
    /// `⟨p_i | A p_j⟩`, client-supplied.
    action: Mat<f64>,
    /// `⟨p_i | p_j⟩`, computed from the coefficient maps.
    overlap: Mat<f64>,
    /// `⟨p_i | b_r⟩`, one column per right-hand side.
    rhs: Mat<f64>,
}

impl Default for PSpace {
    fn default() -> Self {
        Self {
            vectors: Vec::new(),
            action: Mat::zeros(0, 0),
            overlap: Mat::zeros(0, 0),
            rhs: Mat::zeros(0, 0),
        }
    }
}

impl PSpace {
    /// Number of P vectors currently installed.
    pub fn size(&self) -> usize {
        self.vectors.len()
    }

    /// The `i`-th sparse basis vector.
    pub fn vector(&self, i: usize) -> &PVector {
        &self.vectors[i]
    }

    /// Reduced-operator entry `⟨p_i | A p_j⟩`.
    pub fn action(&self, i: usize, j: usize) -> f64 {
        self.action.as_ref()[(i, j)]
    }

    /// Overlap entry `⟨p_i | p_j⟩`.
    pub fn overlap(&self, i: usize, j: usize) -> f64 {
        self.overlap.as_ref()[(i, j)]
    }

    /// Right-hand-side projection `⟨p_i | b_r⟩`.
    pub fn rhs(&self, i: usize, r: usize) -> f64 {
        self.rhs.as_ref()[(i, r)]
    }

    /// Installs a batch of P vectors.
    ///
    /// `pp` is the operator projected onto the (existing + new, new) P set,
    /// flattened with the existing-plus-new index running fastest, exactly as
    /// the external boundary delivers it.
    pub fn add<V: SolverVector>(
        &mut self,
        new: Vec<PVector>,
        pp: &[f64],
        rhs: &[V],
    ) -> Result<(), SolverError> {
        let old_np = self.vectors.len();
        let total = old_np + new.len();
        if pp.len() != new.len() * total {
            return Err(SolverError(SolverErrorKind::InputError(format!(
                "P-space action block has {} entries; expected {} x {} = {}",
                pp.len(),
                new.len(),
                total,
                new.len() * total
            ))));
        }
        self.vectors.extend(new);

        // Grow the cached blocks, keeping the old P-only entries.
        let mut action = Mat::<f64>::zeros(total, total);
        let mut overlap = Mat::<f64>::zeros(total, total);
        for i in 0..old_np {
            for j in 0..old_np {
                action.as_mut()[(i, j)] = self.action.as_ref()[(i, j)];
                overlap.as_mut()[(i, j)] = self.overlap.as_ref()[(i, j)];
            }
        }
        for n in 0..total - old_np {
            for i in 0..total {
                let v = pp[n * total + i];
                action.as_mut()[(old_np + n, i)] = v;
                action.as_mut()[(i, old_np + n)] = v;
            }
        }
        for n in old_np..total {
            for i in 0..total {
                let ov = sparse_dot(&self.vectors[n], &self.vectors[i]);
                overlap.as_mut()[(n, i)] = ov;
                overlap.as_mut()[(i, n)] = ov;
            }
        }
        self.action = action;
        self.overlap = overlap;

        let mut rhs_block = Mat::<f64>::zeros(total, rhs.len());
        for (r, b) in rhs.iter().enumerate() {
            for i in 0..total {
                rhs_block.as_mut()[(i, r)] = b.dot_sparse(&self.vectors[i]);
            }
        }
        self.rhs = rhs_block;
        Ok(())
    }
}
