//! Solvers for the small dense problems defined on the current subspace.
//!
//! Three variants share the same inputs, the assembled reduced operator `H`
//! and overlap `S`, and all emit an interpolation matrix whose columns combine
//! the subspace basis into the next trial solutions:
//!
//! - [`solve_generalised_eigenproblem`] handles `H c = λ S c` by whitening the
//!   metric through a truncated SVD, so that near-linear dependence in the
//!   basis degrades gracefully instead of poisoning the eigenvectors.
//! - [`solve_linear_equations`] solves `H c = B` by Householder QR, or embeds
//!   the right-hand side in a bordered generalised eigenproblem when the
//!   augmented-Hessian form is requested. QR rather than Cholesky, because the
//!   reduced operator is not required to be positive definite.
//! - [`solve_diis`] inverts the error-overlap system of the DIIS
//!   extrapolation with the same SVD truncation.
//!
//! The dense factorisations themselves are [`faer`]'s; this module owns the
//! conditioning around them and the post-processing of eigenpairs (ordering,
//! null-space repair, metric re-orthonormalisation, phase fixing).

use crate::error::{SolverError, SolverErrorKind};
use faer::prelude::*;
use faer::{c64, Mat, MatRef, Side};

/// Eigenvalue magnitude below which an eigenvector is treated as belonging to
/// the null space and repaired with a deterministic real mix-in.
const NULL_EIGENVALUE: f64 = 1e-12;

/// The deterministic mixing coefficient applied to null-space eigenvectors.
/// Any fixed, irrational-looking value works; it only has to break the
/// degeneracy reproducibly.
const NULL_SPACE_MIX: f64 = 0.3256897;

fn conj(z: c64) -> c64 {
    c64::new(z.re, -z.im)
}

fn modulus(z: c64) -> f64 {
    z.re.hypot(z.im)
}

fn to_complex(m: MatRef<'_, f64>) -> Mat<c64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| c64::new(m[(i, j)], 0.0))
}

fn non_finite(context: &'static str, h: MatRef<'_, f64>, s: MatRef<'_, f64>) -> SolverError {
    SolverError(SolverErrorKind::NonFiniteReducedProblem {
        context,
        matrix: format!("{h:?}"),
        overlap: format!("{s:?}"),
    })
}

/// Solution of the reduced generalised eigenproblem.
pub(crate) struct ReducedEigenproblem {
    /// Eigenvalues, ascending by real part.
    pub eigenvalues: Vec<c64>,
    /// Matching eigenvectors in the original subspace basis, `nX × rank`
    /// where `rank` is the retained rank of the overlap.
    pub eigenvectors: Mat<c64>,
}

/// Solves `H c = λ S c` for a possibly ill-conditioned overlap `S`.
///
/// The overlap is factored as `S = U Σ Vᵀ` with singular values below
/// `svd_threshold` (relative to the largest) truncated; the operator is
/// whitened to `Ĥ = Σ^{-1/2} Uᵀ H V Σ^{-1/2}` and diagonalised; eigenvectors
/// are transformed back, sorted ascending by real part (ties broken by the
/// leftmost original index), re-orthonormalised against the `S` metric in
/// three passes, and phase-fixed so the largest-magnitude component has a
/// non-negative real part.
pub(crate) fn solve_generalised_eigenproblem(
    h: MatRef<'_, f64>,
    s: MatRef<'_, f64>,
    hermitian: bool,
    svd_threshold: f64,
    verbosity: u32,
) -> Result<ReducedEigenproblem, SolverError> {
    let n = h.nrows();
    if n == 0 {
        return Ok(ReducedEigenproblem {
            eigenvalues: Vec::new(),
            eigenvectors: Mat::zeros(0, 0),
        });
    }

    let mut s_snapped = s.to_owned();
    for k in 0..n {
        // Snap near-unit diagonals; it protects the SVD of near-identity
        // metrics against spurious tiny perturbations.
        if (s_snapped.as_ref()[(k, k)] - 1.0).abs() < 1e-15 {
            s_snapped.as_mut()[(k, k)] = 1.0;
        }
    }
    let svd = s_snapped
        .as_ref()
        .svd()
        .map_err(|e| SolverError(SolverErrorKind::SvdError(e)))?;
    let sigma: Vec<f64> = (0..n).map(|i| svd.S()[i]).collect();
    let sigma_max = sigma[0];
    if !(sigma_max > 0.0) {
        return Err(SolverError(SolverErrorKind::InputError(
            "subspace overlap matrix is identically zero".into(),
        )));
    }
    let rank = sigma
        .iter()
        .take_while(|&&x| x > svd_threshold * sigma_max)
        .count()
        .max(1);
    if rank < n && verbosity > 1 {
        log::debug!(
            "overlap SVD rank {rank} in subspace of dimension {n}, singular values {sigma:?}"
        );
    }
    let inv_sqrt_sigma: Vec<f64> = sigma[..rank].iter().map(|x| 1.0 / x.sqrt()).collect();

    // Whitened operator Hbar = Σ^{-1/2} Uᵀ H V Σ^{-1/2}.
    let mut hbar: Mat<f64> = svd.U().get(.., 0..rank).transpose() * h * svd.V().get(.., 0..rank);
    for i in 0..rank {
        for j in 0..rank {
            hbar.as_mut()[(i, j)] *= inv_sqrt_sigma[i] * inv_sqrt_sigma[j];
        }
    }
    for i in 0..rank {
        for j in 0..rank {
            if !hbar.as_ref()[(i, j)].is_finite() {
                return Err(non_finite("eigenvalue", h, s));
            }
        }
    }

    // Back-transform factor V Σ^{-1/2}, shared between the real and complex
    // branches.
    let scaled_v = Mat::from_fn(n, rank, |i, j| svd.V()[(i, j)] * inv_sqrt_sigma[j]);

    let (mut eigenvalues, mut eigenvectors): (Vec<c64>, Mat<c64>) = if hermitian {
        let evd = hbar
            .as_ref()
            .self_adjoint_eigen(Side::Upper)
            .map_err(|e| SolverError(SolverErrorKind::EvdError(e)))?;
        let full: Mat<f64> = &scaled_v * evd.U();
        (
            (0..rank).map(|i| c64::new(evd.S()[i], 0.0)).collect(),
            to_complex(full.as_ref()),
        )
    } else {
        let eig = hbar
            .as_ref()
            .eigen()
            .map_err(|e| SolverError(SolverErrorKind::EvdError(e)))?;
        let full: Mat<c64> = to_complex(scaled_v.as_ref()) * eig.U();
        ((0..rank).map(|i| eig.S()[i]).collect(), full)
    };
    if eigenvalues.iter().any(|z| !(z.re.is_finite() && z.im.is_finite())) {
        return Err(non_finite("eigenvalue", h, s));
    }

    // Ascending sort on the real part; degeneracies keep their original,
    // leftmost-first order.
    let mut order: Vec<usize> = (0..rank).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[a]
            .re
            .partial_cmp(&eigenvalues[b].re)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    eigenvalues = order.iter().map(|&i| eigenvalues[i]).collect();
    eigenvectors = Mat::from_fn(n, rank, |i, j| eigenvectors.as_ref()[(i, order[j])]);

    // Re-orthonormalisation against the S metric, repeated three times for
    // numerical compounding, with the null-space repair and the phase fix.
    let s_c = to_complex(s);
    let mut ovl_times_vec = Mat::<c64>::zeros(rank, n);
    for _ in 0..3 {
        for k in 0..rank {
            if modulus(eigenvalues[k]) < NULL_EIGENVALUE {
                // A null eigenvalue leaves the eigenvector's complex phase
                // undetermined; collapse it onto a fixed real combination.
                for i in 0..n {
                    let z = eigenvectors.as_ref()[(i, k)];
                    eigenvectors.as_mut()[(i, k)] = c64::new(z.re + NULL_SPACE_MIX * z.im, 0.0);
                }
            }
            if hermitian {
                for l in 0..k {
                    let mut coeff = c64::new(0.0, 0.0);
                    for i in 0..n {
                        coeff = coeff
                            + conj(ovl_times_vec.as_ref()[(l, i)]) * eigenvectors.as_ref()[(i, k)];
                    }
                    for i in 0..n {
                        let updated =
                            eigenvectors.as_ref()[(i, k)] - eigenvectors.as_ref()[(i, l)] * coeff;
                        eigenvectors.as_mut()[(i, k)] = updated;
                    }
                }
            }
            let mut ovl = c64::new(0.0, 0.0);
            for i in 0..n {
                for j in 0..n {
                    ovl = ovl
                        + conj(eigenvectors.as_ref()[(i, k)])
                            * s_c.as_ref()[(i, j)]
                            * eigenvectors.as_ref()[(j, k)];
                }
            }
            let norm = ovl.re.sqrt();
            if !(norm > 0.0) || !norm.is_finite() {
                return Err(non_finite("eigenvalue", h, s));
            }
            for i in 0..n {
                let z = eigenvectors.as_ref()[(i, k)];
                eigenvectors.as_mut()[(i, k)] = c64::new(z.re / norm, z.im / norm);
            }
            for j in 0..n {
                let mut acc = c64::new(0.0, 0.0);
                for i in 0..n {
                    acc = acc + conj(eigenvectors.as_ref()[(i, k)]) * s_c.as_ref()[(i, j)];
                }
                ovl_times_vec.as_mut()[(k, j)] = acc;
            }
            let mut lmax = 0;
            for l in 0..n {
                if modulus(eigenvectors.as_ref()[(l, k)]) > modulus(eigenvectors.as_ref()[(lmax, k)])
                {
                    lmax = l;
                }
            }
            if eigenvectors.as_ref()[(lmax, k)].re < 0.0 {
                for i in 0..n {
                    let z = eigenvectors.as_ref()[(i, k)];
                    eigenvectors.as_mut()[(i, k)] = c64::new(-z.re, -z.im);
                }
            }
        }
    }

    Ok(ReducedEigenproblem {
        eigenvalues,
        eigenvectors,
    })
}

/// Solves the reduced linear-equation problem, one interpolation column per
/// right-hand side.
///
/// With `augmented_hessian > 0` each right-hand side is embedded in a bordered
/// `(nX+1)` generalised eigenproblem whose lowest eigenpair yields a damped
/// solution; the returned per-root scalars are those lowest eigenvalues.
/// Otherwise the square system `H c = B` is solved by Householder QR and the
/// scalar list is empty.
pub(crate) fn solve_linear_equations(
    h: MatRef<'_, f64>,
    s: MatRef<'_, f64>,
    rhs: MatRef<'_, f64>,
    augmented_hessian: f64,
    hermitian: bool,
    svd_threshold: f64,
    verbosity: u32,
) -> Result<(Mat<f64>, Vec<c64>), SolverError> {
    let nx = h.nrows();
    let n_rhs = rhs.ncols();
    if augmented_hessian > 0.0 {
        let mut interpolation = Mat::<f64>::zeros(nx, n_rhs);
        let mut eigenvalues = Vec::with_capacity(n_rhs);
        for root in 0..n_rhs {
            let h_aug = Mat::from_fn(nx + 1, nx + 1, |i, j| {
                if i < nx && j < nx {
                    h[(i, j)]
                } else if i == nx && j == nx {
                    0.0
                } else {
                    let border = if i == nx { j } else { i };
                    -augmented_hessian * rhs[(border, root)]
                }
            });
            let s_aug = Mat::from_fn(nx + 1, nx + 1, |i, j| {
                if i < nx && j < nx {
                    s[(i, j)]
                } else if i == nx && j == nx {
                    1.0
                } else {
                    0.0
                }
            });
            let reduced = solve_generalised_eigenproblem(
                h_aug.as_ref(),
                s_aug.as_ref(),
                hermitian,
                svd_threshold,
                verbosity,
            )?;
            let lowest = reduced.eigenvalues[0];
            eigenvalues.push(lowest);
            let denom = augmented_hessian * reduced.eigenvectors.as_ref()[(nx, 0)].re;
            if denom == 0.0 || !denom.is_finite() {
                return Err(non_finite("augmented-hessian", h, s));
            }
            for i in 0..nx {
                interpolation.as_mut()[(i, root)] = reduced.eigenvectors.as_ref()[(i, 0)].re / denom;
            }
        }
        Ok((interpolation, eigenvalues))
    } else {
        let interpolation = h.qr().solve(&rhs.to_owned());
        for i in 0..nx {
            for r in 0..n_rhs {
                if !interpolation.as_ref()[(i, r)].is_finite() {
                    return Err(non_finite("linear-equation", h, s));
                }
            }
        }
        Ok((interpolation, Vec::new()))
    }
}

/// Solves the DIIS extrapolation system. The last basis vector is the current
/// iterate; the leading block is the error-overlap matrix `B`, and the
/// coefficients minimise the extrapolated error with the current iterate's
/// coefficient fixed at one.
pub(crate) fn solve_diis(
    h: MatRef<'_, f64>,
    svd_threshold: f64,
    verbosity: u32,
) -> Result<Mat<f64>, SolverError> {
    let n = h.nrows();
    let mut coefficients = Mat::<f64>::zeros(n, 1);
    let ndim = n - 1;
    if ndim > 0 {
        let b = h.get(0..ndim, 0..ndim).to_owned();
        let svd = b
            .as_ref()
            .svd()
            .map_err(|e| SolverError(SolverErrorKind::SvdError(e)))?;
        let sigma_max = svd.S()[0];
        let rank = (0..ndim)
            .take_while(|&i| svd.S()[i] > svd_threshold * sigma_max)
            .count();
        if verbosity > 1 && rank < ndim {
            log::debug!("DIIS error-overlap matrix has rank {rank} of {ndim}");
        }
        for i in 0..rank {
            let mut proj = 0.0;
            for m in 0..ndim {
                proj += svd.U()[(m, i)] * (-h[(m, ndim)]);
            }
            proj /= svd.S()[i];
            for m in 0..ndim {
                coefficients.as_mut()[(m, 0)] += svd.V()[(m, i)] * proj;
            }
        }
        for m in 0..ndim {
            if !coefficients.as_ref()[(m, 0)].is_finite() {
                return Err(non_finite("DIIS", h, h));
            }
        }
    }
    coefficients.as_mut()[(ndim, 0)] = 1.0;
    Ok(coefficients)
}

/// Minimises the cubic interpolant of a one-dimensional function known by its
/// values and directional derivatives at `α = 0` and `α = 1`.
///
/// Returns `(α*, f(α*))` for the interpolant's minimiser, or `None` when the
/// cubic has no turning point. Degenerates to the quadratic fit when the cubic
/// coefficient vanishes.
pub(crate) fn cubic_minimum(f0: f64, f1: f64, g0: f64, g1: f64) -> Option<(f64, f64)> {
    if (2.0 * f1 - g1 - 2.0 * f0 - g0).abs() < 1e-10 {
        // Cubic coefficient is zero: quadratic fit.
        let c2 = (g1 - g0) / 2.0;
        if c2 <= 0.0 {
            return None;
        }
        let alpha = -0.5 * g0 / c2;
        return Some((alpha, f0 + g0 * alpha + c2 * alpha * alpha));
    }
    let discriminant = (3.0 * f0 - 3.0 * f1 + g0).powi(2)
        + (6.0 * f0 - 6.0 * f1 + g0) * g1
        + g1.powi(2);
    if discriminant < 0.0 {
        // The cubic has no turning points.
        return None;
    }
    let denom = 2.0 * f0 - 2.0 * f1 + g0 + g1;
    let (alpha_minus, alpha_plus) = if denom == 0.0 {
        let a = g0 / (2.0 * f1 - 2.0 * f0 - 2.0 * g1);
        (a, a)
    } else {
        (
            (3.0 * f0 - 3.0 * f1 + 2.0 * g0 + g1 - discriminant.sqrt()) / (3.0 * denom),
            (3.0 * f0 - 3.0 * f1 + 2.0 * g0 + g1 + discriminant.sqrt()) / (3.0 * denom),
        )
    };
    let eval = |alpha: f64| {
        f0 + alpha
            * (g0
                + alpha
                    * (-3.0 * f0 + 3.0 * f1 - 2.0 * g0 - g1
                        + alpha * (2.0 * f0 - 2.0 * f1 + g0 + g1)))
    };
    let (fm, fp) = (eval(alpha_minus), eval(alpha_plus));
    if fm < fp {
        Some((alpha_minus, fm))
    } else {
        Some((alpha_plus, fp))
    }
}
