//! Rk blocks and their algebra.
//!
//! An Rk block of rank `k` owns two factor panels `a (m × k)` and
//! `b (n × k)` whose product `a·bᵀ` is the dense value of the block. The
//! rank-0 block owns no panels at all. Index sets locate the block inside
//! the surrounding hierarchical structure; all coalescing operations work
//! on contributions whose index sets are subsets of the target's.

use crate::control::{ApproximationControl, RecompressionAlgorithm};
use crate::dense::DenseBlock;
use crate::hmatrix::HMatrix;
use crate::index_set::IndexSet;
use crate::panel::{gemm, Panel};
use crate::types::{Result, RkScalar, Trans};
use crate::CompressionMethod;
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2};
use num::{Float, One, Zero};
use std::io;
use std::mem;

/// The factor panels of a non-empty block.
#[derive(Clone, Debug)]
struct Factors<A: RkScalar> {
    a: Panel<A>,
    b: Panel<A>,
}

/// An `m × n` matrix stored as `A·Bᵀ`.
#[derive(Clone, Debug)]
pub struct RkMatrix<A: RkScalar> {
    rows: IndexSet,
    cols: IndexSet,
    factors: Option<Factors<A>>,
    method: CompressionMethod,
}

impl<A: RkScalar> RkMatrix<A> {
    /// The rank-0 block over the given index sets.
    pub fn empty(rows: IndexSet, cols: IndexSet, method: CompressionMethod) -> Self {
        RkMatrix {
            rows,
            cols,
            factors: None,
            method,
        }
    }

    /// Build from freshly computed factor panels.
    pub fn from_factors(
        a: Panel<A>,
        b: Panel<A>,
        rows: IndexSet,
        cols: IndexSet,
        method: CompressionMethod,
    ) -> Self {
        assert_eq!(a.nrows(), rows.size());
        assert_eq!(b.nrows(), cols.size());
        assert_eq!(a.ncols(), b.ncols());
        assert!(a.ncols() >= 1, "rank-0 blocks carry no panels");
        RkMatrix {
            rows,
            cols,
            factors: Some(Factors { a, b }),
            method,
        }
    }

    pub fn rows(&self) -> IndexSet {
        self.rows
    }

    pub fn cols(&self) -> IndexSet {
        self.cols
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn a(&self) -> Option<&Panel<A>> {
        self.factors.as_ref().map(|f| &f.a)
    }

    pub fn b(&self) -> Option<&Panel<A>> {
        self.factors.as_ref().map(|f| &f.b)
    }

    pub fn rank(&self) -> usize {
        self.factors.as_ref().map_or(0, |f| f.a.ncols())
    }

    /// Drop the factors, leaving the rank-0 block.
    pub fn clear(&mut self) {
        self.factors = None;
    }

    /// Exchange contents with another block over the same index sets.
    pub fn swap(&mut self, other: &mut RkMatrix<A>) {
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        mem::swap(&mut self.factors, &mut other.factors);
        mem::swap(&mut self.method, &mut other.method);
    }

    /// Deep in-place copy of another block.
    pub fn copy_from(&mut self, other: &RkMatrix<A>) {
        self.rows = other.rows;
        self.cols = other.cols;
        self.method = other.method;
        self.factors = other.factors.clone();
    }

    /// Evaluate `A·Bᵀ` into a caller-provided `m × n` array.
    pub fn eval_array(&self, mut out: ArrayViewMut2<A>) {
        assert_eq!(out.nrows(), self.rows.size());
        assert_eq!(out.ncols(), self.cols.size());
        match &self.factors {
            Some(f) => gemm(
                Trans::N,
                Trans::T,
                A::one(),
                f.a.view(),
                f.b.view(),
                A::zero(),
                out,
            ),
            None => out.fill(A::zero()),
        }
    }

    /// The dense value of the block.
    pub fn eval(&self) -> DenseBlock<A> {
        let mut result = DenseBlock::zeros(self.rows, self.cols);
        self.eval_array(result.data.view_mut());
        result
    }

    /// Entry `(i, j)` of the dense value.
    pub fn get(&self, i: usize, j: usize) -> A {
        match &self.factors {
            Some(f) => f.a.dot_rows(i, &f.b, j),
            None => A::zero(),
        }
    }

    /// Squared Frobenius norm of the dense value.
    pub fn norm_sqr(&self) -> f64 {
        match &self.factors {
            Some(f) => f.a.norm_product_sqr(&f.b),
            None => 0.0,
        }
    }

    /// Multiply the dense value by `alpha`; only the `A` panel is scaled.
    pub fn scale(&mut self, alpha: A) {
        if let Some(f) = &mut self.factors {
            f.a.scale(alpha);
        }
    }

    /// Swap the factor panels and the index sets: `M` becomes `Mᵀ`, in
    /// O(1) and without touching the entries.
    pub fn transpose(&mut self) {
        if let Some(f) = &mut self.factors {
            mem::swap(&mut f.a, &mut f.b);
        }
        mem::swap(&mut self.rows, &mut self.cols);
    }

    /// Conjugate the dense value in place.
    pub fn conjugate(&mut self) {
        if let Some(f) = &mut self.factors {
            f.a.conjugate();
            f.b.conjugate();
        }
    }

    pub fn compressed_size(&self) -> usize {
        (self.rows.size() + self.cols.size()) * self.rank()
    }

    pub fn uncompressed_size(&self) -> usize {
        self.rows.size() * self.cols.size()
    }

    /// Panics if a factor entry is NaN or infinite.
    pub fn check_nan(&self) {
        if let Some(f) = &self.factors {
            assert!(
                !f.a.has_non_finite(),
                "left factor contains non-finite entries"
            );
            assert!(
                !f.b.has_non_finite(),
                "right factor contains non-finite entries"
            );
        }
    }

    /// Perturb both panels entrywise with relative noise `epsilon`.
    pub fn add_random<R: rand::Rng>(&mut self, epsilon: f64, rng: &mut R) {
        if let Some(f) = &mut self.factors {
            f.a.add_random(epsilon, rng);
            f.b.add_random(epsilon, rng);
        }
    }

    /// Serialize the `A` panel then the `B` panel. A rank-0 block writes
    /// two zero-column headers.
    pub fn write_array<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        match &self.factors {
            Some(f) => {
                f.a.write_into(w)?;
                f.b.write_into(w)
            }
            None => {
                Panel::<A>::zeros(self.rows.size(), 0).write_into(w)?;
                Panel::<A>::zeros(self.cols.size(), 0).write_into(w)
            }
        }
    }

    /// Restriction to sub index sets; the panel slices are copied out and
    /// the result is an independent block.
    pub fn subset(&self, sub_rows: IndexSet, sub_cols: IndexSet) -> RkMatrix<A> {
        assert!(sub_rows.is_subset(&self.rows));
        assert!(sub_cols.is_subset(&self.cols));
        match &self.factors {
            Some(f) => {
                let a = f
                    .a
                    .sub_rows(sub_rows.offset() - self.rows.offset(), sub_rows.size());
                let b = f
                    .b
                    .sub_rows(sub_cols.offset() - self.cols.offset(), sub_cols.size());
                RkMatrix::from_factors(a, b, sub_rows, sub_cols, self.method)
            }
            None => RkMatrix::empty(sub_rows, sub_cols, self.method),
        }
    }

    /// `y ← beta·y + alpha·op(A·Bᵀ)·x`, through the width-`k`
    /// intermediate.
    pub fn gemv(&self, trans: Trans, alpha: A, x: ArrayView2<A>, beta: A, mut y: ArrayViewMut2<A>) {
        let f = match &self.factors {
            Some(f) => f,
            None => {
                if beta != A::one() {
                    y.map_inplace(|v| *v = *v * beta);
                }
                return;
            }
        };
        let k = f.a.ncols();
        let mut z = Array2::<A>::zeros((k, x.ncols()));
        match trans {
            Trans::N => {
                // y ← beta·y + alpha·A·(Bᵀ·x)
                gemm(Trans::T, Trans::N, A::one(), f.b.view(), x, A::zero(), z.view_mut());
                gemm(Trans::N, Trans::N, alpha, f.a.view(), z.view(), beta, y);
            }
            Trans::T => {
                // y ← beta·y + alpha·B·(Aᵀ·x)
                gemm(Trans::T, Trans::N, A::one(), f.a.view(), x, A::zero(), z.view_mut());
                gemm(Trans::N, Trans::N, alpha, f.b.view(), z.view(), beta, y);
            }
            Trans::C => {
                // y ← beta·y + alpha·conj(B)·(Aᴴ·x); the conjugation of B
                // happens on a copy.
                gemm(Trans::C, Trans::N, A::one(), f.a.view(), x, A::zero(), z.view_mut());
                let mut conj_b = f.b.clone();
                conj_b.conjugate();
                gemm(Trans::N, Trans::N, alpha, conj_b.view(), z.view(), beta, y);
            }
        }
    }

    /// Recompress at tolerance `epsilon` through a QR of both panels and
    /// an SVD of the small coupling matrix. `initial_pivot_a` and
    /// `initial_pivot_b` count leading orthonormal panel columns the
    /// factorizations may accept as is; they are ignored unless the
    /// control enables them.
    ///
    /// A failed SVD leaves the block unchanged.
    pub fn truncate(
        &mut self,
        ctrl: &ApproximationControl,
        epsilon: f64,
        initial_pivot_a: usize,
        initial_pivot_b: usize,
    ) -> Result<()> {
        let (mut pivot_a, mut pivot_b) = (initial_pivot_a, initial_pivot_b);
        if !ctrl.use_initial_pivot {
            pivot_a = 0;
            pivot_b = 0;
        }
        assert!(pivot_a <= self.rank());
        assert!(pivot_b <= self.rank());
        let k = self.rank();
        if k == 0 {
            return Ok(());
        }
        let (m, n) = (self.rows.size(), self.cols.size());
        assert!(m >= k);
        // With more columns than one dimension the small SVD costs more
        // than a dense one: evaluate and compress the dense value.
        // Known discrepancy: `epsilon` is forwarded here, while the other
        // dense compressions use the recompression tolerance.
        if k > m.min(n) {
            let dense = self.eval();
            let mut rk = dense.truncated_svd(ctrl, epsilon)?;
            self.swap(&mut rk);
            return Ok(());
        }
        if ctrl.recompression == RecompressionAlgorithm::Mgs {
            return self.mgs_truncate(ctrl, epsilon, pivot_a, pivot_b);
        }

        let f = self.factors.as_ref().unwrap();
        let mut qa = f.a.clone();
        let ra = qa.qr_in_place(pivot_a)?;
        let mut qb = f.b.clone();
        let rb = qb.qr_in_place(pivot_b)?;

        // Coupling matrix Ra·Rbᵀ and its SVD; non-convergence is
        // tolerated and leaves the block as it was.
        let mut r = Array2::<A>::zeros((k, k));
        gemm(Trans::N, Trans::T, A::one(), ra.view(), rb.view(), A::zero(), r.view_mut());
        let (u, sigma, vt) = match Panel::from_array(r).svd() {
            Ok(res) => res,
            Err(_) => return Ok(()),
        };

        let new_k = ctrl.find_k(sigma.view(), epsilon);
        if new_k == 0 {
            self.clear();
            return Ok(());
        }

        let (u, v) = scaled_singular_vectors(u, &sigma, vt, new_k);

        // A ← Qa·U√Σ and B ← Qb·V√Σ. With an explicit Q the split apply
        // over the pivot prefix collapses into the single product.
        let mut new_a = Panel::zeros(m, new_k);
        new_a.gemm(Trans::N, Trans::N, A::one(), &qa, &u, A::zero());
        new_a.set_ortho(u.is_ortho());
        let mut new_b = Panel::zeros(n, new_k);
        new_b.gemm(Trans::N, Trans::N, A::one(), &qb, &v, A::zero());
        new_b.set_ortho(v.is_ortho());
        self.factors = Some(Factors { a: new_a, b: new_b });
        Ok(())
    }

    /// Recompress through pivoted modified Gram–Schmidt on both panels
    /// and an SVD of the small coupling matrix. Gram–Schmidt may already
    /// drop columns below `epsilon`; a vanished panel clears the block.
    ///
    /// A failed SVD leaves the block unchanged.
    pub fn mgs_truncate(
        &mut self,
        ctrl: &ApproximationControl,
        epsilon: f64,
        initial_pivot_a: usize,
        initial_pivot_b: usize,
    ) -> Result<()> {
        if self.rank() == 0 {
            return Ok(());
        }
        let f = self.factors.as_ref().unwrap();
        let mut qa = f.a.clone();
        let (k_a, ra) = qa.modified_gram_schmidt(epsilon, initial_pivot_a);
        if k_a == 0 {
            self.clear();
            return Ok(());
        }
        let mut qb = f.b.clone();
        let (k_b, rb) = qb.modified_gram_schmidt(epsilon, initial_pivot_b);
        if k_b == 0 {
            self.clear();
            return Ok(());
        }

        let mut r = Array2::<A>::zeros((k_a, k_b));
        gemm(Trans::N, Trans::T, A::one(), ra.view(), rb.view(), A::zero(), r.view_mut());
        let (u, sigma, vt) = match Panel::from_array(r).svd() {
            Ok(res) => res,
            Err(_) => return Ok(()),
        };

        let new_k = ctrl.find_k(sigma.view(), epsilon);
        if new_k == 0 {
            self.clear();
            return Ok(());
        }

        let (u, v) = scaled_singular_vectors(u, &sigma, vt, new_k);

        // Plain products: Gram–Schmidt produced explicit orthonormal
        // columns, there is no implicit Q to apply.
        let mut new_a = Panel::zeros(qa.nrows(), new_k);
        new_a.gemm(Trans::N, Trans::N, A::one(), &qa, &u, A::zero());
        new_a.set_ortho(u.is_ortho());
        let mut new_b = Panel::zeros(qb.nrows(), new_k);
        new_b.gemm(Trans::N, Trans::N, A::one(), &qb, &v, A::zero());
        new_b.set_ortho(v.is_ortho());
        self.factors = Some(Factors { a: new_a, b: new_b });
        Ok(())
    }

    /// `self ← self + alpha·other`, recompressed.
    pub fn axpy(&mut self, ctrl: &ApproximationControl, alpha: A, other: &RkMatrix<A>) -> Result<()> {
        let mut sum = self.formatted_add_parts(ctrl, &[alpha], &[other], true)?;
        self.swap(&mut sum);
        Ok(())
    }

    /// `self ← self + alpha·other` for a dense contribution, recompressed.
    pub fn axpy_dense(
        &mut self,
        ctrl: &ApproximationControl,
        alpha: A,
        other: &DenseBlock<A>,
    ) -> Result<()> {
        let mut sum = self.formatted_add_parts_dense(ctrl, &[alpha], &[other])?;
        self.swap(&mut sum);
        Ok(())
    }

    /// Coalesce `self + Σ alpha[i]·parts[i]` into one recompressed block.
    ///
    /// Part index sets must be subsets of the target's; rank-0, empty and
    /// zero-coefficient contributions are skipped. When the summed ranks
    /// reach the block size the sum goes through a dense intermediate
    /// instead. Recompression runs only when more than one contribution
    /// actually participated and `dotruncate` is set.
    pub fn formatted_add_parts(
        &self,
        ctrl: &ApproximationControl,
        alpha: &[A],
        parts: &[&RkMatrix<A>],
        dotruncate: bool,
    ) -> Result<RkMatrix<A>> {
        assert_eq!(alpha.len(), parts.len());
        let mut used: Vec<(A, &RkMatrix<A>)> = Vec::with_capacity(parts.len() + 1);
        let mut rank_total = 0;
        let seeded = self.rank() > 0;
        if seeded {
            used.push((A::one(), self));
            rank_total += self.rank();
        }
        let mut min_method = self.method;
        for (&coeff, &part) in alpha.iter().zip(parts) {
            if part.rank() == 0
                || part.rows.is_empty()
                || part.cols.is_empty()
                || coeff == A::zero()
            {
                continue;
            }
            assert!(part.rows.is_subset(&self.rows));
            assert!(part.cols.is_subset(&self.cols));
            rank_total += part.rank();
            min_method = min_method.min(part.method);
            used.push((coeff, part));
        }
        if used.is_empty() {
            return Ok(RkMatrix::empty(self.rows, self.cols, min_method));
        }

        let (m, n) = (self.rows.size(), self.cols.size());
        // Summed ranks at or above the block size: everything low-rank
        // about the sum is gone, go through a dense intermediate.
        if rank_total >= m.min(n) {
            let first = if seeded { 1 } else { 0 };
            let dense: Vec<DenseBlock<A>> = used[first..].iter().map(|(_, p)| p.eval()).collect();
            let coeffs: Vec<A> = used[first..].iter().map(|(c, _)| *c).collect();
            let refs: Vec<&DenseBlock<A>> = dense.iter().collect();
            return self.formatted_add_parts_dense(ctrl, &coeffs, &refs);
        }

        let lead = used[0].1.factors.as_ref().unwrap();
        let mut pivot_a = if lead.a.is_ortho() { used[0].1.rank() } else { 0 };
        let mut pivot_b = if lead.b.is_ortho() { used[0].1.rank() } else { 0 };
        if ctrl.best_rk_order {
            reorder_for_pivot(&mut used, &mut pivot_a, &mut pivot_b);
        }

        // Concatenate: contribution i occupies columns
        // [k_offset, k_offset + rank_i) of both output panels, its rows
        // (resp. columns) shifted by its index-set offset relative to the
        // target's.
        let mut a_out = Panel::zeros(m, rank_total);
        let mut b_out = Panel::zeros(n, rank_total);
        let mut k_offset = 0;
        for (coeff, part) in &used {
            let f = part.factors.as_ref().unwrap();
            let rank = part.rank();
            let row_offset = part.rows.offset() - self.rows.offset();
            a_out.copy_at_offset(&f.a, row_offset, k_offset);
            if *coeff != A::one() {
                a_out.scale_block(row_offset, f.a.nrows(), k_offset, rank, *coeff);
            }
            let col_offset = part.cols.offset() - self.cols.offset();
            b_out.copy_at_offset(&f.b, col_offset, k_offset);
            k_offset += rank;
        }
        debug_assert_eq!(k_offset, rank_total);

        let mut rk = RkMatrix::from_factors(a_out, b_out, self.rows, self.cols, min_method);
        // A single participating contribution is as compressed as it was.
        if used.len() > 1 && dotruncate {
            rk.truncate(ctrl, ctrl.recompression_epsilon, pivot_a, pivot_b)?;
        }
        Ok(rk)
    }

    /// Dense-list variant of [`formatted_add_parts`]: evaluate the target,
    /// accumulate every dense contribution at its offset, compress the
    /// result.
    ///
    /// [`formatted_add_parts`]: RkMatrix::formatted_add_parts
    pub fn formatted_add_parts_dense(
        &self,
        ctrl: &ApproximationControl,
        alpha: &[A],
        parts: &[&DenseBlock<A>],
    ) -> Result<RkMatrix<A>> {
        assert_eq!(alpha.len(), parts.len());
        let mut me = self.eval();
        for (&coeff, &part) in alpha.iter().zip(parts) {
            me.axpy_subset(coeff, part);
        }
        me.truncated_svd(ctrl, ctrl.recompression_epsilon)
    }

    /// `op_r(rk) · op_m(m)` against a dense operand.
    ///
    /// Base case `N,N`: the free panel `A` is kept, `B` becomes
    /// `Mᵀ·B`. Transposing the Rk operand swaps the panels; its
    /// conjugate-transpose also conjugates them, which is commuted
    /// through the dense factor on copies.
    pub fn multiply_rk_dense(
        trans_r: Trans,
        trans_m: Trans,
        rk: &RkMatrix<A>,
        m: &DenseBlock<A>,
    ) -> RkMatrix<A> {
        assert_eq!(
            if trans_r == Trans::N { rk.cols.size() } else { rk.rows.size() },
            if trans_m == Trans::N { m.nrows() } else { m.ncols() }
        );
        let rk_rows = if trans_r == Trans::N { rk.rows } else { rk.cols };
        let m_cols = if trans_m == Trans::N { m.cols } else { m.rows };
        let f = match &rk.factors {
            Some(f) => f,
            None => return RkMatrix::empty(rk_rows, m_cols, CompressionMethod::NoCompression),
        };
        let (a, b) = if trans_r == Trans::N { (&f.a, &f.b) } else { (&f.b, &f.a) };
        let mut new_a = a.clone();
        let mut new_b = Panel::zeros(m_cols.size(), b.ncols());
        if trans_r == Trans::C {
            new_a.conjugate();
            match trans_m {
                Trans::N => {
                    // Mᵀ·conj(B) = conj(Mᴴ·B)
                    gemm(Trans::C, Trans::N, A::one(), m.data.view(), b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
                Trans::T => {
                    let mut conj_b = b.clone();
                    conj_b.conjugate();
                    gemm(Trans::N, Trans::N, A::one(), m.data.view(), conj_b.view(), A::zero(), new_b.view_mut());
                }
                Trans::C => {
                    // conj(M)·conj(B) = conj(M·B)
                    gemm(Trans::N, Trans::N, A::one(), m.data.view(), b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
            }
        } else {
            match trans_m {
                Trans::N => gemm(Trans::T, Trans::N, A::one(), m.data.view(), b.view(), A::zero(), new_b.view_mut()),
                Trans::T => gemm(Trans::N, Trans::N, A::one(), m.data.view(), b.view(), A::zero(), new_b.view_mut()),
                Trans::C => {
                    let mut conj_b = b.clone();
                    conj_b.conjugate();
                    gemm(Trans::N, Trans::N, A::one(), m.data.view(), conj_b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
            }
        }
        RkMatrix::from_factors(new_a, new_b, rk_rows, m_cols, rk.method)
    }

    /// `op_m(m) · op_r(rk)`, mirror image of [`multiply_rk_dense`].
    ///
    /// [`multiply_rk_dense`]: RkMatrix::multiply_rk_dense
    pub fn multiply_dense_rk(
        trans_m: Trans,
        trans_r: Trans,
        m: &DenseBlock<A>,
        rk: &RkMatrix<A>,
    ) -> RkMatrix<A> {
        assert_eq!(
            if trans_m == Trans::N { m.ncols() } else { m.nrows() },
            if trans_r == Trans::N { rk.rows.size() } else { rk.cols.size() }
        );
        let m_rows = if trans_m == Trans::N { m.rows } else { m.cols };
        let rk_cols = if trans_r == Trans::N { rk.cols } else { rk.rows };
        let f = match &rk.factors {
            Some(f) => f,
            None => return RkMatrix::empty(m_rows, rk_cols, rk.method),
        };
        let (a, b) = if trans_r == Trans::N { (&f.a, &f.b) } else { (&f.b, &f.a) };
        let mut new_a = Panel::zeros(m_rows.size(), a.ncols());
        let mut new_b = b.clone();
        if trans_r == Trans::C {
            new_b.conjugate();
            match trans_m {
                Trans::N => {
                    let mut conj_a = a.clone();
                    conj_a.conjugate();
                    gemm(Trans::N, Trans::N, A::one(), m.data.view(), conj_a.view(), A::zero(), new_a.view_mut());
                }
                Trans::T => {
                    // Mᵀ·conj(A) = conj(Mᴴ·A)
                    gemm(Trans::C, Trans::N, A::one(), m.data.view(), a.view(), A::zero(), new_a.view_mut());
                    new_a.conjugate();
                }
                Trans::C => {
                    // Mᴴ·conj(A) = conj(Mᵀ·A)
                    gemm(Trans::T, Trans::N, A::one(), m.data.view(), a.view(), A::zero(), new_a.view_mut());
                    new_a.conjugate();
                }
            }
        } else {
            gemm(trans_m, Trans::N, A::one(), m.data.view(), a.view(), A::zero(), new_a.view_mut());
        }
        RkMatrix::from_factors(new_a, new_b, m_rows, rk_cols, rk.method)
    }

    /// `op_r(rk) · op_h(h)`; the hierarchical operand is applied through
    /// its `gemv`.
    pub fn multiply_rk_h(
        trans_r: Trans,
        trans_h: Trans,
        rk: &RkMatrix<A>,
        h: &HMatrix<A>,
    ) -> RkMatrix<A> {
        assert_eq!(
            if trans_r == Trans::N { rk.cols } else { rk.rows },
            if trans_h == Trans::N { h.rows() } else { h.cols() }
        );
        let rk_rows = if trans_r == Trans::N { rk.rows } else { rk.cols };
        let new_cols = if trans_h == Trans::N { h.cols() } else { h.rows() };
        let f = match &rk.factors {
            Some(f) => f,
            None => return RkMatrix::empty(rk_rows, new_cols, rk.method),
        };
        let (a, b) = if trans_r == Trans::N { (&f.a, &f.b) } else { (&f.b, &f.a) };
        let mut new_a = a.clone();
        let mut new_b = Panel::zeros(new_cols.size(), b.ncols());
        if trans_r == Trans::C {
            new_a.conjugate();
            match trans_h {
                Trans::N => {
                    h.gemv(Trans::C, A::one(), b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
                Trans::T => {
                    let mut conj_b = b.clone();
                    conj_b.conjugate();
                    h.gemv(Trans::N, A::one(), conj_b.view(), A::zero(), new_b.view_mut());
                }
                Trans::C => {
                    h.gemv(Trans::N, A::one(), b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
            }
        } else {
            match trans_h {
                Trans::N => h.gemv(Trans::T, A::one(), b.view(), A::zero(), new_b.view_mut()),
                Trans::T => h.gemv(Trans::N, A::one(), b.view(), A::zero(), new_b.view_mut()),
                Trans::C => {
                    let mut conj_b = b.clone();
                    conj_b.conjugate();
                    h.gemv(Trans::N, A::one(), conj_b.view(), A::zero(), new_b.view_mut());
                    new_b.conjugate();
                }
            }
        }
        RkMatrix::from_factors(new_a, new_b, rk_rows, new_cols, rk.method)
    }

    /// `op_h(h) · op_r(rk)`.
    pub fn multiply_h_rk(
        trans_h: Trans,
        trans_r: Trans,
        h: &HMatrix<A>,
        rk: &RkMatrix<A>,
    ) -> RkMatrix<A> {
        let new_rows = if trans_h == Trans::N { h.rows() } else { h.cols() };
        let rk_cols = if trans_r == Trans::N { rk.cols } else { rk.rows };
        let f = match &rk.factors {
            Some(f) => f,
            None => return RkMatrix::empty(new_rows, rk_cols, rk.method),
        };
        let (a, b) = if trans_r == Trans::N { (&f.a, &f.b) } else { (&f.b, &f.a) };
        let mut new_a = Panel::zeros(new_rows.size(), a.ncols());
        let mut new_b = b.clone();
        if trans_r == Trans::C {
            new_b.conjugate();
            match trans_h {
                Trans::N => {
                    let mut conj_a = a.clone();
                    conj_a.conjugate();
                    h.gemv(Trans::N, A::one(), conj_a.view(), A::zero(), new_a.view_mut());
                }
                Trans::T => {
                    // Hᵀ·conj(A) = conj(Hᴴ·A)
                    h.gemv(Trans::C, A::one(), a.view(), A::zero(), new_a.view_mut());
                    new_a.conjugate();
                }
                Trans::C => {
                    // Hᴴ·conj(A) = conj(Hᵀ·A)
                    h.gemv(Trans::T, A::one(), a.view(), A::zero(), new_a.view_mut());
                    new_a.conjugate();
                }
            }
        } else {
            h.gemv(trans_h, A::one(), a.view(), A::zero(), new_a.view_mut());
        }
        RkMatrix::from_factors(new_a, new_b, new_rows, rk_cols, rk.method)
    }

    /// `op₁(r1) · op₂(r2)`.
    ///
    /// The default policy computes the coupling matrix `b₁ᵀ·a₂` and folds
    /// it into the side of smaller rank, preserving orthogonality on the
    /// other output panel. With `rk_rk_svd` the coupling matrix is
    /// recompressed by an SVD against the recompression tolerance and
    /// `√Σ` is applied to both sides; no output panel stays orthonormal.
    pub fn multiply_rk_rk(
        ctrl: &ApproximationControl,
        trans1: Trans,
        trans2: Trans,
        r1: &RkMatrix<A>,
        r2: &RkMatrix<A>,
    ) -> Result<RkMatrix<A>> {
        assert_eq!(
            if trans1 == Trans::N { r1.cols } else { r1.rows },
            if trans2 == Trans::N { r2.rows } else { r2.cols }
        );
        let rows = if trans1 == Trans::N { r1.rows } else { r1.cols };
        let cols = if trans2 == Trans::N { r2.cols } else { r2.rows };
        let method = r1.method.min(r2.method);
        let (f1, f2) = match (&r1.factors, &r2.factors) {
            (Some(f1), Some(f2)) => (f1, f2),
            _ => return Ok(RkMatrix::empty(rows, cols, method)),
        };
        let (a1, b1) = if trans1 == Trans::N { (&f1.a, &f1.b) } else { (&f1.b, &f1.a) };
        let (a2, b2) = if trans2 == Trans::N { (&f2.a, &f2.b) } else { (&f2.b, &f2.a) };
        assert_eq!(b1.nrows(), a2.nrows());

        // Coupling matrix b₁ᵀ·a₂ (r1.rank × r2.rank), conjugations folded
        // in per operand mode.
        let mut tmp = Array2::<A>::zeros((r1.rank(), r2.rank()));
        match (trans1, trans2) {
            (Trans::C, Trans::C) => {
                gemm(Trans::T, Trans::N, A::one(), b1.view(), a2.view(), A::zero(), tmp.view_mut());
                tmp.map_inplace(|x| *x = x.conj());
            }
            (Trans::C, _) => {
                gemm(Trans::C, Trans::N, A::one(), b1.view(), a2.view(), A::zero(), tmp.view_mut());
            }
            (_, Trans::C) => {
                gemm(Trans::C, Trans::N, A::one(), b1.view(), a2.view(), A::zero(), tmp.view_mut());
                tmp.map_inplace(|x| *x = x.conj());
            }
            _ => {
                gemm(Trans::T, Trans::N, A::one(), b1.view(), a2.view(), A::zero(), tmp.view_mut());
            }
        }

        if ctrl.rk_rk_svd {
            let (u, sigma, vt) = Panel::from_array(tmp).svd()?;
            let new_k = ctrl.find_k(sigma.view(), ctrl.recompression_epsilon);
            if new_k == 0 {
                return Ok(RkMatrix::empty(rows, cols, method));
            }
            let (mut u, mut v) = scaled_singular_vectors(u, &sigma, vt, new_k);
            if trans1 == Trans::C {
                u.conjugate();
            }
            let mut new_a = Panel::zeros(a1.nrows(), new_k);
            new_a.gemm(Trans::N, Trans::N, A::one(), a1, &u, A::zero());
            if trans1 == Trans::C {
                new_a.conjugate();
            }
            if trans2 == Trans::C {
                v.conjugate();
            }
            let mut new_b = Panel::zeros(b2.nrows(), new_k);
            new_b.gemm(Trans::N, Trans::N, A::one(), b2, &v, A::zero());
            if trans2 == Trans::C {
                new_b.conjugate();
            }
            Ok(RkMatrix::from_factors(new_a, new_b, rows, cols, method))
        } else if r1.rank() < r2.rank() {
            // Keep a₁, fold the coupling matrix into b₂: rank r1.
            let mut new_a = a1.clone();
            if trans1 == Trans::C {
                new_a.conjugate();
            }
            let mut new_b = Panel::zeros(b2.nrows(), r1.rank());
            if trans2 == Trans::C {
                gemm(Trans::N, Trans::C, A::one(), b2.view(), tmp.view(), A::zero(), new_b.view_mut());
                new_b.conjugate();
            } else {
                gemm(Trans::N, Trans::T, A::one(), b2.view(), tmp.view(), A::zero(), new_b.view_mut());
            }
            Ok(RkMatrix::from_factors(new_a, new_b, rows, cols, method))
        } else {
            // Fold the coupling matrix into a₁, keep b₂: rank r2.
            let mut tmp = tmp;
            if trans1 == Trans::C {
                tmp.map_inplace(|x| *x = x.conj());
            }
            let mut new_a = Panel::zeros(a1.nrows(), r2.rank());
            gemm(Trans::N, Trans::N, A::one(), a1.view(), tmp.view(), A::zero(), new_a.view_mut());
            if trans1 == Trans::C {
                new_a.conjugate();
            }
            let mut new_b = b2.clone();
            if trans2 == Trans::C {
                new_b.conjugate();
            }
            Ok(RkMatrix::from_factors(new_a, new_b, rows, cols, method))
        }
    }

    /// Peak bytes of the intermediate panels of [`multiply_rk_rk`], so
    /// callers can pre-reserve.
    ///
    /// [`multiply_rk_rk`]: RkMatrix::multiply_rk_rk
    pub fn rk_rk_memory_size(
        trans1: Trans,
        trans2: Trans,
        r1: &RkMatrix<A>,
        r2: &RkMatrix<A>,
    ) -> usize {
        let a1 = if trans1 == Trans::N { r1.a() } else { r1.b() };
        let b2 = if trans2 == Trans::N { r2.b() } else { r2.a() };
        b2.map_or(0, |p| p.memory_size())
            + a1.map_or(0, |p| p.nrows() * r2.rank() * mem::size_of::<A>())
    }

    /// Multiply by the diagonal of `d`, or by its inverse, from the left
    /// (`diag·M`, scaling rows of `A`) or the right (`M·diag`, scaling
    /// rows of `B`).
    pub fn multiply_with_diag_or_diag_inv(&mut self, d: &HMatrix<A>, inverse: bool, left: bool) {
        assert_eq!(d.rows(), d.cols());
        assert!(!left || self.rows == d.cols());
        assert!(left || self.cols == d.rows());
        if self.rank() == 0 {
            return;
        }
        let mut diag = Array1::<A>::zeros(d.cols().size());
        d.extract_diagonal(diag.view_mut());
        let f = self.factors.as_mut().unwrap();
        let panel = if left { &mut f.a } else { &mut f.b };
        panel.scale_rows(diag.view(), inverse);
    }

    /// Accumulate `alpha·op_a(ha)·op_b(hb)` into `self`. Only `beta = 1`
    /// is supported: the target is always accumulated into.
    ///
    /// Internal operands recurse block-wise, the per-child partial
    /// products being coalesced through [`formatted_add_parts`]; leaf
    /// operands multiply through the mixed products or, failing a
    /// low-rank operand, through a compressed dense product.
    ///
    /// [`formatted_add_parts`]: RkMatrix::formatted_add_parts
    pub fn gemm_rk(
        &mut self,
        ctrl: &ApproximationControl,
        trans_a: Trans,
        trans_b: Trans,
        alpha: A,
        ha: &HMatrix<A>,
        hb: &HMatrix<A>,
        beta: A,
    ) -> Result<()> {
        assert!(beta == A::one(), "the target is accumulated into");
        let ha = prune_void_diagonal(ha);
        let hb = prune_void_diagonal(hb);
        if ha.rows().is_empty()
            || ha.cols().is_empty()
            || hb.rows().is_empty()
            || hb.cols().is_empty()
        {
            return Ok(());
        }

        if !ha.is_leaf() && !hb.is_leaf() {
            let nb_rows = if trans_a == Trans::N { ha.nr_child_row() } else { ha.nr_child_col() };
            let nb_cols = if trans_b == Trans::N { hb.nr_child_col() } else { hb.nr_child_row() };
            let nb_com = if trans_a == Trans::N { ha.nr_child_col() } else { ha.nr_child_row() };
            let mut sub_rks: Vec<Option<RkMatrix<A>>> =
                (0..nb_rows * nb_cols).map(|_| None).collect();
            for i in 0..nb_rows {
                for j in 0..nb_cols {
                    for l in 0..nb_com {
                        let a_il = if trans_a == Trans::N { ha.child(i, l) } else { ha.child(l, i) };
                        let b_lj = if trans_b == Trans::N { hb.child(l, j) } else { hb.child(j, l) };
                        if let (Some(a_il), Some(b_lj)) = (a_il, b_lj) {
                            let slot = &mut sub_rks[i + j * nb_rows];
                            if slot.is_none() {
                                let sub_rows =
                                    if trans_a == Trans::N { a_il.rows() } else { a_il.cols() };
                                let sub_cols =
                                    if trans_b == Trans::N { b_lj.cols() } else { b_lj.rows() };
                                *slot = Some(RkMatrix::empty(
                                    sub_rows,
                                    sub_cols,
                                    CompressionMethod::NoCompression,
                                ));
                            }
                            slot.as_mut().unwrap().gemm_rk(
                                ctrl, trans_a, trans_b, alpha, a_il, b_lj, A::one(),
                            )?;
                        }
                    }
                }
            }
            let parts: Vec<&RkMatrix<A>> = sub_rks.iter().flatten().collect();
            let coeffs = vec![A::one(); parts.len()];
            let mut sum = self.formatted_add_parts(ctrl, &coeffs, &parts, true)?;
            self.swap(&mut sum);
            return Ok(());
        }

        // Leaf case: a null operand contributes nothing, a low-rank
        // operand routes through the mixed products, otherwise the
        // product is dense and gets compressed.
        let rk = if (ha.is_leaf() && ha.is_null()) || (hb.is_leaf() && hb.is_null()) {
            None
        } else if ha.is_rk() || hb.is_rk() {
            Some(HMatrix::multiply_rk(ctrl, trans_a, trans_b, ha, hb)?)
        } else {
            let dense = HMatrix::multiply_dense(trans_a, trans_b, ha, hb);
            Some(dense.truncated_svd(ctrl, ctrl.recompression_epsilon)?)
        };
        if let Some(rk) = rk {
            self.axpy(ctrl, alpha, &rk)?;
        }
        Ok(())
    }
}

/// Keep the first `new_k` singular directions with `√Σ` folded into both
/// sides: returns `(U·√Σ, V·√Σ)` where `V` is the plain transpose of the
/// `vt` returned by the SVD.
fn scaled_singular_vectors<A: RkScalar>(
    u: Panel<A>,
    sigma: &Array1<A::Real>,
    vt: Array2<A>,
    new_k: usize,
) -> (Panel<A>, Panel<A>) {
    let sqrt_sigma: Vec<A::Real> = sigma.iter().take(new_k).map(|&s| Float::sqrt(s)).collect();
    let mut u = Panel::from_array(u.into_array().slice(s![.., 0..new_k]).to_owned());
    u.scale_columns(&sqrt_sigma);
    let mut v = Panel::from_array(vt.slice(s![0..new_k, ..]).t().to_owned());
    v.scale_columns(&sqrt_sigma);
    (u, v)
}

/// Reorder coalesced contributions so that orthonormal panels end up in
/// front, where they extend the initial pivot of the recompression.
fn reorder_for_pivot<A: RkScalar>(
    used: &mut [(A, &RkMatrix<A>)],
    pivot_a: &mut usize,
    pivot_b: &mut usize,
) {
    // The flop gain of a pivot of width p in a QR factorization grows
    // like p², hence the score (orthonormal panels)·rank².
    let mut best_gain: i64 = -1;
    let mut best = 0;
    for (i, (_, rk)) in used.iter().enumerate() {
        let f = rk.factors.as_ref().unwrap();
        let ortho = f.a.is_ortho() as i64 + f.b.is_ortho() as i64;
        let gain = ortho * (rk.rank() * rk.rank()) as i64;
        if gain > best_gain {
            best_gain = gain;
            best = i;
        }
    }
    if best > 0 {
        used.swap(0, best);
    }
    {
        let lead = used[0].1;
        let f = lead.factors.as_ref().unwrap();
        *pivot_a = if f.a.is_ortho() { lead.rank() } else { 0 };
        *pivot_b = if f.b.is_ortho() { lead.rank() } else { 0 };
    }

    // A pair with disjoint supports keeps both leading panels mutually
    // orthogonal after concatenation, extending the pivot past the first
    // contribution.
    let mut best_pair: Option<(usize, usize, usize, usize)> = None;
    for i1 in 0..used.len() {
        for i2 in 0..used.len() {
            if i1 == i2 {
                continue;
            }
            let rk1 = used[i1].1;
            let rk2 = used[i2].1;
            let f1 = rk1.factors.as_ref().unwrap();
            let f2 = rk2.factors.as_ref().unwrap();
            let rk_a = if f1.a.is_ortho() {
                rk1.rank()
                    + if f2.a.is_ortho() && !rk1.rows.intersects(&rk2.rows) {
                        rk2.rank()
                    } else {
                        0
                    }
            } else {
                0
            };
            let rk_b = if f1.b.is_ortho() {
                rk1.rank()
                    + if f2.b.is_ortho() && !rk1.cols.intersects(&rk2.cols) {
                        rk2.rank()
                    } else {
                        0
                    }
            } else {
                0
            };
            let gain = (rk_a * rk_a + rk_b * rk_b) as i64;
            if gain > best_gain {
                best_gain = gain;
                best_pair = Some((i1, i2, rk_a, rk_b));
            }
        }
    }
    if let Some((i1, mut i2, rk_a, rk_b)) = best_pair {
        used.swap(0, i1);
        if i2 == 0 {
            // The former head was just moved to position i1.
            i2 = i1;
        }
        used.swap(1, i2);
        *pivot_a = rk_a;
        *pivot_b = rk_b;
    }
}

/// Descend past internal nodes whose `(0,0)` or `(1,1)` diagonal child is
/// void, so the remaining computation only sees the non-degenerate part.
fn prune_void_diagonal<A: RkScalar>(mut h: &HMatrix<A>) -> &HMatrix<A> {
    while !h.is_leaf() {
        if h.nr_child_row() >= 2 && h.nr_child_col() >= 2 {
            let void = |c: Option<&HMatrix<A>>| {
                c.map_or(false, |c| c.rows().is_empty() && c.cols().is_empty())
            };
            if void(h.child(0, 0)) {
                if let Some(next) = h.child(1, 1) {
                    h = next;
                    continue;
                }
            }
            if void(h.child(1, 1)) {
                if let Some(next) = h.child(0, 0) {
                    h = next;
                    continue;
                }
            }
        }
        break;
    }
    h
}
