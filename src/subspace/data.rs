//! Assembly of the dense reduced matrices over P ⊕ Q ⊕ R, and the
//! singular-value redundancy test used by the conditioning step.
//!
//! Cost discipline: the P-only and Q-only blocks come straight from the
//! containers' caches; only the R-involving blocks are measured afresh each
//! iteration, and those measurements live in [`RBlocks`] so that evicting a Q
//! vector never forces a re-read of the client's large vectors.

use crate::error::{SolverError, SolverErrorKind};
use crate::subspace::pspace::PSpace;
use crate::subspace::qspace::QSpace;
use crate::vector::SolverVector;
use faer::{Mat, MatRef};

/// Sizes and offsets of the three segments of the reduced space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimensions {
    pub np: usize,
    pub nq: usize,
    pub nr: usize,
}

impl Dimensions {
    /// Total reduced dimension.
    pub fn nx(&self) -> usize {
        self.np + self.nq + self.nr
    }

    /// Offset of the P segment.
    pub fn o_p(&self) -> usize {
        0
    }

    /// Offset of the Q segment.
    pub fn o_q(&self) -> usize {
        self.np
    }

    /// Offset of the R segment.
    pub fn o_r(&self) -> usize {
        self.np + self.nq
    }
}

/// Interactions involving the current trial vectors, measured once per call.
///
/// Indexing conventions: `s_qr[a][m]` couples Q entry `a` with trial `m`;
/// `s_pr[p][m]` couples P vector `p` with trial `m`; `rhs_r[m][r]` couples
/// trial `m` with right-hand side `r`.
#[derive(Debug, Default)]
pub(crate) struct RBlocks {
    /// `⟨r_m | r_n⟩`.
    pub s_rr: Vec<Vec<f64>>,
    /// `⟨r_m | A r_n⟩` (or `⟨A r_m | A r_n⟩` in residual-residual mode).
    pub h_rr: Vec<Vec<f64>>,
    /// `⟨q_a | r_m⟩`.
    pub s_qr: Vec<Vec<f64>>,
    /// `⟨q_a | A r_m⟩`.
    pub h_qr: Vec<Vec<f64>>,
    /// `⟨r_m | A q_a⟩`.
    pub h_rq: Vec<Vec<f64>>,
    /// `⟨p | r_m⟩`.
    pub s_pr: Vec<Vec<f64>>,
    /// `⟨p | A r_m⟩`.
    pub h_pr: Vec<Vec<f64>>,
    /// `⟨r_m | b_r⟩`.
    pub rhs_r: Vec<Vec<f64>>,
}

impl RBlocks {
    /// Measures every R-involving interaction for the trial vectors in
    /// `params` / `actions`.
    #[allow(clippy::too_many_arguments)]
    pub fn compute<V: SolverVector>(
        params: &[V],
        actions: &[V],
        qspace: &QSpace<V>,
        pspace: &PSpace,
        rhs: &[V],
        res_res: bool,
        hermitian: bool,
    ) -> Self {
        let nr = params.len();
        let nq = qspace.size();
        let np = pspace.size();

        let mut blocks = RBlocks::default();
        for a in 0..nq {
            let mut s_row = Vec::with_capacity(nr);
            let mut h_row = Vec::with_capacity(nr);
            let mut h_rev = Vec::with_capacity(nr);
            for m in 0..nr {
                s_row.push(params[m].dot(qspace.param(a)));
                let h_qr = if res_res {
                    actions[m].dot(qspace.action_vec(a))
                } else {
                    actions[m].dot(qspace.param(a))
                };
                h_row.push(h_qr);
                h_rev.push(if hermitian {
                    h_qr
                } else if res_res {
                    actions[m].dot(qspace.action_vec(a))
                } else {
                    params[m].dot(qspace.action_vec(a))
                });
            }
            blocks.s_qr.push(s_row);
            blocks.h_qr.push(h_row);
            blocks.h_rq.push(h_rev);
        }
        for p in 0..np {
            let pv = pspace.vector(p);
            blocks
                .s_pr
                .push((0..nr).map(|m| params[m].dot_sparse(pv)).collect());
            blocks
                .h_pr
                .push((0..nr).map(|m| actions[m].dot_sparse(pv)).collect());
        }
        for m in 0..nr {
            blocks
                .rhs_r
                .push(rhs.iter().map(|b| params[m].dot(b)).collect());
            let mut s_row = Vec::with_capacity(nr);
            let mut h_row = Vec::with_capacity(nr);
            for n in 0..nr {
                s_row.push(params[m].dot(&params[n]));
                h_row.push(if res_res {
                    actions[m].dot(&actions[n])
                } else {
                    params[m].dot(&actions[n])
                });
            }
            blocks.s_rr.push(s_row);
            blocks.h_rr.push(h_row);
        }
        blocks
    }

    /// Number of trial vectors measured.
    pub fn nr(&self) -> usize {
        self.s_rr.len()
    }

    /// Drops the cached interactions of evicted Q entry `a`, keeping the
    /// remaining rows aligned with the container.
    pub fn evict_q(&mut self, a: usize) {
        self.s_qr.remove(a);
        self.h_qr.remove(a);
        self.h_rq.remove(a);
    }
}

/// The dense reduced matrices over the combined subspace.
#[derive(Debug)]
pub struct SubspaceData {
    /// Reduced operator.
    pub h: Mat<f64>,
    /// Overlap (Gram) matrix.
    pub s: Mat<f64>,
    /// Right-hand-side projections, one column per equation.
    pub rhs: Mat<f64>,
    pub dims: Dimensions,
}

impl Default for SubspaceData {
    fn default() -> Self {
        Self {
            h: Mat::zeros(0, 0),
            s: Mat::zeros(0, 0),
            rhs: Mat::zeros(0, 0),
            dims: Dimensions::default(),
        }
    }
}

impl SubspaceData {
    /// Builds the reduced matrices from the containers' caches and the
    /// freshly measured R blocks.
    pub(crate) fn assemble<V: SolverVector>(
        pspace: &PSpace,
        qspace: &QSpace<V>,
        rblocks: &RBlocks,
        n_rhs: usize,
        res_res: bool,
    ) -> Self {
        let dims = Dimensions {
            np: pspace.size(),
            nq: qspace.size(),
            nr: rblocks.nr(),
        };
        let nx = dims.nx();
        let (o_q, o_r) = (dims.o_q(), dims.o_r());
        let mut h = Mat::<f64>::zeros(nx, nx);
        let mut s = Mat::<f64>::zeros(nx, nx);
        let mut rhs = Mat::<f64>::zeros(nx, n_rhs);

        for i in 0..dims.np {
            for j in 0..dims.np {
                h.as_mut()[(i, j)] = pspace.action(i, j);
                s.as_mut()[(i, j)] = pspace.overlap(i, j);
            }
            for r in 0..n_rhs {
                rhs.as_mut()[(i, r)] = pspace.rhs(i, r);
            }
        }
        for a in 0..dims.nq {
            for r in 0..n_rhs {
                rhs.as_mut()[(o_q + a, r)] = qspace.rhs(a)[r];
            }
            for b in 0..dims.nq {
                h.as_mut()[(o_q + b, o_q + a)] = qspace.action(b, a);
                s.as_mut()[(o_q + b, o_q + a)] = qspace.metric(b, a);
            }
            for i in 0..dims.np {
                h.as_mut()[(i, o_q + a)] = qspace.action_p(a)[i];
                h.as_mut()[(o_q + a, i)] = qspace.action_p(a)[i];
                s.as_mut()[(i, o_q + a)] = qspace.metric_p(a)[i];
                s.as_mut()[(o_q + a, i)] = qspace.metric_p(a)[i];
            }
            for m in 0..dims.nr {
                h.as_mut()[(o_r + m, o_q + a)] = rblocks.h_rq[a][m];
                h.as_mut()[(o_q + a, o_r + m)] = rblocks.h_qr[a][m];
                s.as_mut()[(o_r + m, o_q + a)] = rblocks.s_qr[a][m];
                s.as_mut()[(o_q + a, o_r + m)] = rblocks.s_qr[a][m];
            }
        }
        for i in 0..dims.np {
            for m in 0..dims.nr {
                h.as_mut()[(o_r + m, i)] = rblocks.h_pr[i][m];
                h.as_mut()[(i, o_r + m)] = rblocks.h_pr[i][m];
                s.as_mut()[(o_r + m, i)] = rblocks.s_pr[i][m];
                s.as_mut()[(i, o_r + m)] = rblocks.s_pr[i][m];
            }
        }
        for m in 0..dims.nr {
            for r in 0..n_rhs {
                rhs.as_mut()[(o_r + m, r)] = rblocks.rhs_r[m][r];
            }
            for n in 0..dims.nr {
                h.as_mut()[(o_r + m, o_r + n)] = rblocks.h_rr[m][n];
                s.as_mut()[(o_r + m, o_r + n)] = rblocks.s_rr[m][n];
            }
        }
        if res_res {
            s = h.clone();
        }
        Self { h, s, rhs, dims }
    }
}

/// Tests the leading `n × n` block of `tester` for redundancy.
///
/// Returns the subspace index of the vector to evict: the first of
/// `candidates` whose component in the most-singular right singular vector
/// exceeds `1e-3`, provided the smallest singular value falls below
/// `threshold`. Returns `None` when the subspace is well conditioned or no
/// candidate qualifies.
pub(crate) fn propose_singularity_deletion(
    tester: MatRef<'_, f64>,
    n: usize,
    candidates: &[usize],
    threshold: f64,
) -> Result<Option<usize>, SolverError> {
    if n == 0 {
        return Ok(None);
    }
    let block = tester.get(0..n, 0..n).to_owned();
    let svd = block
        .as_ref()
        .svd()
        .map_err(|e| SolverError(SolverErrorKind::SvdError(e)))?;
    // Singular values come out in non-increasing order, so the most singular
    // direction is the last one.
    let most_singular = n - 1;
    if svd.S()[most_singular] > threshold {
        return Ok(None);
    }
    let v = svd.V();
    for &k in candidates {
        if v[(k, most_singular)].abs() > 1e-3 {
            return Ok(Some(k));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    fn simple_spaces() -> (PSpace, QSpace<Vec<f64>>, Vec<Vec<f64>>) {
        let pspace = PSpace::default();
        let mut qspace = QSpace::new(false);
        let rhs: Vec<Vec<f64>> = vec![];
        qspace.add(&vec![1.0, 0.0, 0.0], &vec![2.0, 1.0, 0.0], &rhs, &pspace);
        (pspace, qspace, rhs)
    }

    #[test]
    fn test_assemble_dimensions_and_offsets() {
        let (pspace, qspace, rhs) = simple_spaces();
        let params = vec![vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        let actions = vec![vec![1.0, 2.0, 1.0], vec![0.0, 1.0, 2.0]];
        let rblocks = RBlocks::compute(&params, &actions, &qspace, &pspace, &rhs, false, true);
        let data = SubspaceData::assemble(&pspace, &qspace, &rblocks, 0, false);

        assert_eq!(data.dims, Dimensions { np: 0, nq: 1, nr: 2 });
        assert_eq!(data.dims.nx(), 3);
        assert_eq!(data.h.nrows(), 3);
        assert_eq!(data.s.ncols(), 3);
        // Q ⊗ Q metric from the container cache.
        assert_eq!(data.s.as_ref()[(0, 0)], 1.0);
        // ⟨q_0 | r_0⟩ = 0, ⟨r_0 | r_1⟩ = 0, ⟨r_0 | A r_1⟩ = (0,1,0)·(0,1,2).
        assert_eq!(data.s.as_ref()[(0, 1)], 0.0);
        assert_eq!(data.s.as_ref()[(1, 2)], 0.0);
        assert_eq!(data.h.as_ref()[(1, 2)], 1.0);
    }

    #[test]
    fn test_overlap_is_symmetric_for_symmetric_problem() {
        let (pspace, qspace, rhs) = simple_spaces();
        let params = vec![vec![0.5, 0.5, 0.0]];
        let actions = vec![vec![1.5, 1.5, 0.5]];
        let rblocks = RBlocks::compute(&params, &actions, &qspace, &pspace, &rhs, false, true);
        let data = SubspaceData::assemble(&pspace, &qspace, &rblocks, 0, false);
        let n = data.dims.nx();
        for i in 0..n {
            for j in 0..n {
                let diff = (data.s.as_ref()[(i, j)] - data.s.as_ref()[(j, i)]).abs();
                assert!(diff < 1e-12, "overlap not symmetric at ({i}, {j})");
            }
        }
    }

    #[test]
    fn test_redundant_direction_is_flagged() {
        // Two nearly parallel basis vectors make the Gram matrix singular.
        let gram = mat![[1.0, 0.999999999], [0.999999999, 1.0]];
        let proposal = propose_singularity_deletion(gram.as_ref(), 2, &[0, 1], 1e-5).unwrap();
        assert_eq!(proposal, Some(0));

        let healthy = mat![[1.0, 0.0], [0.0, 1.0]];
        let proposal = propose_singularity_deletion(healthy.as_ref(), 2, &[0, 1], 1e-5).unwrap();
        assert_eq!(proposal, None);
    }

    #[test]
    fn test_candidate_filter_respects_frozen_entries() {
        let gram = mat![[1.0, 0.999999999], [0.999999999, 1.0]];
        // Both directions participate in the null vector; only index 1 is a
        // permitted candidate.
        let proposal = propose_singularity_deletion(gram.as_ref(), 2, &[1], 1e-5).unwrap();
        assert_eq!(proposal, Some(1));
        let proposal = propose_singularity_deletion(gram.as_ref(), 2, &[], 1e-5).unwrap();
        assert_eq!(proposal, None);
    }

    #[test]
    fn test_res_res_mode_copies_matrix_into_overlap() {
        let (pspace, qspace, rhs) = {
            let pspace = PSpace::default();
            let mut qspace = QSpace::new(true);
            let rhs: Vec<Vec<f64>> = vec![];
            qspace.add(&vec![1.0, 0.0], &vec![3.0, 4.0], &rhs, &pspace);
            (pspace, qspace, rhs)
        };
        let params = vec![vec![0.0, 1.0]];
        let actions = vec![vec![1.0, 1.0]];
        let rblocks = RBlocks::compute(&params, &actions, &qspace, &pspace, &rhs, true, false);
        let data = SubspaceData::assemble(&pspace, &qspace, &rblocks, 0, true);
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(data.s.as_ref()[(i, j)], data.h.as_ref()[(i, j)]);
            }
        }
        assert_eq!(data.h.as_ref()[(0, 0)], 25.0);
    }
}
