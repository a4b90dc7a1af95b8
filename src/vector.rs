//! This module defines the core abstraction for the solver's large vectors.
//!
//! The subspace engine never inspects the elements of the client's solution and
//! residual vectors. Every interaction goes through a small capability set:
//! scalar product, scaled addition, in-place scaling, filling, cloning with a
//! storage hint, and a top-k selection used only when suggesting new P-space
//! axes. This observation allows for a powerful abstraction: the engine can be
//! written once and used with in-memory arrays, paged out-of-core containers,
//! or distributed vectors, without knowing their representations.
//!
//! The central piece of this module is the [`SolverVector`] trait, which
//! formalizes this contract, together with two concrete implementations:
//!
//! 1.  **`Vec<f64>`** — the plain in-memory kind, used by most callers and by
//!     the test suite.
//! 2.  **[`PagedVector`]** — a chunked container that keeps its data in
//!     fixed-size pages, standing in for out-of-core storage. It honours the
//!     [`StorageHint`] passed to [`SolverVector::clone_with_hint`].

use std::collections::BTreeMap;

/// A sparse P-space vector: a coefficient map over the full-vector index
/// domain. Only the stored indices are non-zero.
pub type PVector = BTreeMap<usize, f64>;

/// Advice given to [`SolverVector::clone_with_hint`] on where the copy should
/// live. Implementations are free to ignore it; it exists so that history
/// vectors kept by the solver (Q-space entries, right-hand sides) can be
/// migrated to slower, larger storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHint {
    /// Keep the copy in main memory.
    InMemory,
    /// The copy may be staged to backing store.
    Offline,
    /// The copy may be distributed across ranks, and may also be offline.
    Distributed,
}

/// Scalar product of two sparse coefficient maps.
pub(crate) fn sparse_dot(a: &PVector, b: &PVector) -> f64 {
    // Walk the smaller map and probe the larger one.
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(i, va)| large.get(i).map(|vb| va * vb))
        .sum()
}

/// Represents a large opaque vector that the solver can combine and measure.
///
/// The contract mirrors the level-1 BLAS operations plus a cloning operation
/// with a storage hint. `dot` must be symmetric for the real scalars used
/// throughout this crate; a complex extension would require it to be
/// conjugate-symmetric instead, and nothing in the solver relies on more than
/// that.
pub trait SolverVector: Sized {
    /// Scalar product `⟨self | other⟩`.
    fn dot(&self, other: &Self) -> f64;

    /// `self ← self + α · x`.
    fn axpy(&mut self, alpha: f64, x: &Self);

    /// In-place scaling `self ← α · self`. When `α == 0` the contents of
    /// `self` may be uninitialised garbage; the result must still be the zero
    /// vector.
    fn scal(&mut self, alpha: f64);

    /// Set every element to `α`.
    fn fill(&mut self, alpha: f64);

    /// Produce a copy of `self`, advising the implementation where the copy
    /// should be stored.
    fn clone_with_hint(&self, hint: StorageHint) -> Self;

    /// Scalar product against a sparse coefficient map.
    fn dot_sparse(&self, p: &PVector) -> f64;

    /// `self ← self + α · p` for a sparse coefficient map `p`.
    fn axpy_sparse(&mut self, alpha: f64, p: &PVector);

    /// Return up to `max` `(index, score)` pairs, ranked by descending score
    /// `|self_i · other_i|`, keeping only scores strictly above `threshold`.
    ///
    /// This is a pure measurement used by the driver's `suggest_p`; it never
    /// modifies the vector.
    fn select(&self, other: &Self, max: usize, threshold: f64) -> Vec<(usize, f64)>;
}

/// Shared top-k selection over an element-wise score iterator.
fn select_scores(
    scores: impl Iterator<Item = (usize, f64)>,
    max: usize,
    threshold: f64,
) -> Vec<(usize, f64)> {
    let mut picked: Vec<(usize, f64)> = scores.filter(|(_, s)| *s > threshold).collect();
    picked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    picked.truncate(max);
    picked
}

/// The plain in-memory vector kind.
impl SolverVector for Vec<f64> {
    fn dot(&self, other: &Self) -> f64 {
        assert_eq!(
            self.len(),
            other.len(),
            "Dimension mismatch: vectors of length {} and {}.",
            self.len(),
            other.len(),
        );
        self.iter().zip(other).map(|(a, b)| a * b).sum()
    }

    fn axpy(&mut self, alpha: f64, x: &Self) {
        assert_eq!(self.len(), x.len());
        for (s, v) in self.iter_mut().zip(x) {
            *s += alpha * v;
        }
    }

    fn scal(&mut self, alpha: f64) {
        if alpha == 0.0 {
            self.iter_mut().for_each(|s| *s = 0.0);
        } else {
            self.iter_mut().for_each(|s| *s *= alpha);
        }
    }

    fn fill(&mut self, alpha: f64) {
        self.iter_mut().for_each(|s| *s = alpha);
    }

    fn clone_with_hint(&self, _hint: StorageHint) -> Self {
        // An in-memory vector has nowhere slower to go.
        self.clone()
    }

    fn dot_sparse(&self, p: &PVector) -> f64 {
        p.iter().map(|(&i, &c)| self[i] * c).sum()
    }

    fn axpy_sparse(&mut self, alpha: f64, p: &PVector) {
        for (&i, &c) in p {
            self[i] += alpha * c;
        }
    }

    fn select(&self, other: &Self, max: usize, threshold: f64) -> Vec<(usize, f64)> {
        assert_eq!(self.len(), other.len());
        select_scores(
            self.iter()
                .zip(other)
                .enumerate()
                .map(|(i, (a, b))| (i, (a * b).abs())),
            max,
            threshold,
        )
    }
}

/// Default page length for [`PagedVector`], in elements.
const DEFAULT_PAGE_LEN: usize = 4096;

/// A vector stored as a sequence of fixed-size pages.
///
/// This stands in for an out-of-core container: element access goes through a
/// page lookup rather than a flat slice, and cloning with an
/// [`StorageHint::Offline`] or [`StorageHint::Distributed`] hint is recorded so
/// that tests can observe the migration. The arithmetic operations stream over
/// whole pages, which is the access pattern a real backing-store
/// implementation would need.
#[derive(Debug, Clone)]
pub struct PagedVector {
    pages: Vec<Vec<f64>>,
    len: usize,
    page_len: usize,
    offline: bool,
}

impl PagedVector {
    /// Creates a zero-filled paged vector of length `len`.
    pub fn zeros(len: usize) -> Self {
        Self::with_page_len(len, DEFAULT_PAGE_LEN)
    }

    /// Creates a zero-filled paged vector with an explicit page length.
    /// Small pages are useful in tests to force multi-page layouts.
    pub fn with_page_len(len: usize, page_len: usize) -> Self {
        assert!(page_len > 0, "page length must be positive");
        let mut pages = Vec::with_capacity(len.div_ceil(page_len));
        let mut remaining = len;
        while remaining > 0 {
            let this = remaining.min(page_len);
            pages.push(vec![0.0; this]);
            remaining -= this;
        }
        Self {
            pages,
            len,
            page_len,
            offline: false,
        }
    }

    /// Builds a paged vector from a slice.
    pub fn from_slice(data: &[f64]) -> Self {
        let mut v = Self::zeros(data.len());
        v.put(data);
        v
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this copy was created with an offline/distributed hint.
    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Copies the contents out into a flat `Vec`.
    pub fn get(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.len);
        for page in &self.pages {
            out.extend_from_slice(page);
        }
        out
    }

    /// Overwrites the contents from a flat slice of the same length.
    pub fn put(&mut self, data: &[f64]) {
        assert_eq!(data.len(), self.len);
        let mut offset = 0;
        for page in &mut self.pages {
            let len = page.len();
            page.copy_from_slice(&data[offset..offset + len]);
            offset += len;
        }
    }

    fn element(&self, i: usize) -> f64 {
        self.pages[i / self.page_len][i % self.page_len]
    }

    fn element_mut(&mut self, i: usize) -> &mut f64 {
        &mut self.pages[i / self.page_len][i % self.page_len]
    }
}

impl SolverVector for PagedVector {
    fn dot(&self, other: &Self) -> f64 {
        assert_eq!(
            self.len, other.len,
            "Dimension mismatch: vectors of length {} and {}.",
            self.len, other.len,
        );
        assert_eq!(self.page_len, other.page_len);
        self.pages
            .iter()
            .zip(&other.pages)
            .map(|(pa, pb)| pa.iter().zip(pb).map(|(a, b)| a * b).sum::<f64>())
            .sum()
    }

    fn axpy(&mut self, alpha: f64, x: &Self) {
        assert_eq!(self.len, x.len);
        assert_eq!(self.page_len, x.page_len);
        for (page, xp) in self.pages.iter_mut().zip(&x.pages) {
            for (s, v) in page.iter_mut().zip(xp) {
                *s += alpha * v;
            }
        }
    }

    fn scal(&mut self, alpha: f64) {
        for page in &mut self.pages {
            if alpha == 0.0 {
                page.iter_mut().for_each(|s| *s = 0.0);
            } else {
                page.iter_mut().for_each(|s| *s *= alpha);
            }
        }
    }

    fn fill(&mut self, alpha: f64) {
        for page in &mut self.pages {
            page.iter_mut().for_each(|s| *s = alpha);
        }
    }

    fn clone_with_hint(&self, hint: StorageHint) -> Self {
        let mut copy = self.clone();
        copy.offline = !matches!(hint, StorageHint::InMemory);
        copy
    }

    fn dot_sparse(&self, p: &PVector) -> f64 {
        p.iter().map(|(&i, &c)| self.element(i) * c).sum()
    }

    fn axpy_sparse(&mut self, alpha: f64, p: &PVector) {
        for (&i, &c) in p {
            *self.element_mut(i) += alpha * c;
        }
    }

    fn select(&self, other: &Self, max: usize, threshold: f64) -> Vec<(usize, f64)> {
        assert_eq!(self.len, other.len);
        select_scores(
            (0..self.len).map(|i| (i, (self.element(i) * other.element(i)).abs())),
            max,
            threshold,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_dot_and_axpy() {
        let a = vec![1.0, 2.0, 3.0];
        let mut b = vec![1.0, 1.0, 1.0];
        assert_eq!(a.dot(&b), 6.0);
        b.axpy(2.0, &a);
        assert_eq!(b, vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_scal_zero_clears_garbage() {
        let mut a = vec![f64::NAN, 1.0];
        a.scal(0.0);
        assert_eq!(a, vec![0.0, 0.0]);
    }

    #[test]
    fn test_sparse_interactions() {
        let v = vec![0.0, 2.0, 0.0, 4.0];
        let p: PVector = [(1, 0.5), (3, 1.0)].into_iter().collect();
        assert_eq!(v.dot_sparse(&p), 5.0);
        let mut w = vec![0.0; 4];
        w.axpy_sparse(2.0, &p);
        assert_eq!(w, vec![0.0, 1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_select_ranks_by_product_magnitude() {
        let a = vec![1.0, -3.0, 2.0, 0.0];
        let b = vec![1.0, 1.0, 1.0, 10.0];
        let picked = a.select(&b, 2, 0.5);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].0, 1);
        assert_eq!(picked[1].0, 2);
    }

    #[test]
    fn test_paged_matches_dense_arithmetic() {
        let data: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let mut paged = PagedVector::with_page_len(10, 3);
        paged.put(&data);
        let dense = data.clone();

        assert!((paged.dot(&paged) - dense.dot(&dense)).abs() < 1e-14);

        let mut paged2 = paged.clone();
        paged2.axpy(-0.5, &paged);
        let mut dense2 = dense.clone();
        dense2.axpy(-0.5, &dense);
        assert_eq!(paged2.get(), dense2);
    }

    #[test]
    fn test_paged_clone_hint_marks_offline() {
        let v = PagedVector::zeros(8);
        assert!(!v.is_offline());
        assert!(v.clone_with_hint(StorageHint::Offline).is_offline());
        assert!(v.clone_with_hint(StorageHint::Distributed).is_offline());
        assert!(!v.clone_with_hint(StorageHint::InMemory).is_offline());
    }

    #[test]
    fn test_sparse_dot_is_symmetric() {
        let a: PVector = [(0, 1.0), (2, 3.0)].into_iter().collect();
        let b: PVector = [(2, 2.0), (5, 1.0)].into_iter().collect();
        assert_eq!(sparse_dot(&a, &b), 6.0);
        assert_eq!(sparse_dot(&b, &a), 6.0);
    }
}
