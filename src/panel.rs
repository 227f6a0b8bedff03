//! Factor panels and the dense kernels that operate on them.
//!
//! A panel is a tall-thin dense matrix together with a flag recording
//! whether its columns are known orthonormal. The flag feeds the
//! initial-pivot optimizations of the recompression routines, so every
//! mutating operation here is explicit about whether it preserves it.

use crate::types::{Result, RkScalar, Trans};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis, CowArray, Ix2, Zip};
use ndarray_linalg::{JobSvd, Norm, SVDDC, QR};
use num::traits::cast::cast;
use num::{Float, One, ToPrimitive, Zero};
use rand::Rng;
use std::io;

/// View of `m` under a transposition mode; `C` materializes the conjugate.
pub(crate) fn op_view<A: RkScalar>(trans: Trans, m: ArrayView2<'_, A>) -> CowArray<'_, A, Ix2> {
    match trans {
        Trans::N => m.into(),
        Trans::T => m.reversed_axes().into(),
        Trans::C => m.t().mapv(|x| x.conj()).into(),
    }
}

/// `c ← beta·c + alpha·op(a)·op(b)`.
pub(crate) fn gemm<A: RkScalar>(
    transa: Trans,
    transb: Trans,
    alpha: A,
    a: ArrayView2<A>,
    b: ArrayView2<A>,
    beta: A,
    mut c: ArrayViewMut2<A>,
) {
    let oa = op_view(transa, a);
    let ob = op_view(transb, b);
    assert_eq!(oa.ncols(), ob.nrows());
    assert_eq!(c.nrows(), oa.nrows());
    assert_eq!(c.ncols(), ob.ncols());
    let prod = oa.dot(&ob);
    if beta == A::zero() {
        c.assign(&prod);
        if alpha != A::one() {
            c.map_inplace(|x| *x = *x * alpha);
        }
    } else {
        Zip::from(&mut c)
            .and(&prod)
            .for_each(|ci, &pi| *ci = beta * *ci + alpha * pi);
    }
}

/// A dense `rows × k` factor panel.
#[derive(Clone, Debug)]
pub struct Panel<A: RkScalar> {
    data: Array2<A>,
    ortho: bool,
}

impl<A: RkScalar> Panel<A> {
    /// Zero-filled panel; its columns are not orthonormal.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Panel {
            data: Array2::zeros((rows, cols)),
            ortho: false,
        }
    }

    pub fn from_array(data: Array2<A>) -> Self {
        Panel { data, ortho: false }
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn view(&self) -> ArrayView2<A> {
        self.data.view()
    }

    /// Mutable entry access. The columns can no longer be assumed
    /// orthonormal afterwards.
    pub fn view_mut(&mut self) -> ArrayViewMut2<A> {
        self.ortho = false;
        self.data.view_mut()
    }

    pub fn into_array(self) -> Array2<A> {
        self.data
    }

    /// Whether the columns are known orthonormal.
    pub fn is_ortho(&self) -> bool {
        self.ortho
    }

    pub fn set_ortho(&mut self, ortho: bool) {
        self.ortho = ortho;
    }

    /// Bytes held by the entries.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<A>()
    }

    /// Multiply every entry by `alpha`.
    pub fn scale(&mut self, alpha: A) {
        if alpha == A::one() {
            return;
        }
        self.ortho = false;
        self.data.map_inplace(|x| *x = *x * alpha);
    }

    /// Conjugate every entry. Orthonormality survives conjugation.
    pub fn conjugate(&mut self) {
        self.data.map_inplace(|x| *x = x.conj());
    }

    /// Scale column `j` by `diag[j]`. Used to fold singular values into
    /// singular vectors, after which the columns stop being orthonormal.
    pub fn scale_columns(&mut self, diag: &[A::Real]) {
        assert_eq!(diag.len(), self.ncols());
        self.ortho = false;
        for (mut col, &d) in self.data.axis_iter_mut(Axis(1)).zip(diag) {
            let d = A::from_real(d);
            col.map_inplace(|x| *x = *x * d);
        }
    }

    /// Scale row `i` by `diag[i]`, or divide by it in inverse mode.
    pub fn scale_rows(&mut self, diag: ArrayView1<A>, inverse: bool) {
        assert_eq!(diag.len(), self.nrows());
        self.ortho = false;
        for (mut row, &d) in self.data.axis_iter_mut(Axis(0)).zip(diag.iter()) {
            let d = if inverse { A::one() / d } else { d };
            row.map_inplace(|x| *x = *x * d);
        }
    }

    /// Copy `other` into `self` with its top-left corner at
    /// `(row_offset, col_offset)`.
    pub fn copy_at_offset(&mut self, other: &Panel<A>, row_offset: usize, col_offset: usize) {
        self.ortho = false;
        self.data
            .slice_mut(s![
                row_offset..row_offset + other.nrows(),
                col_offset..col_offset + other.ncols()
            ])
            .assign(&other.data);
    }

    /// Scale the `nrows × ncols` block at `(row_offset, col_offset)`.
    pub fn scale_block(
        &mut self,
        row_offset: usize,
        nrows: usize,
        col_offset: usize,
        ncols: usize,
        alpha: A,
    ) {
        self.ortho = false;
        self.data
            .slice_mut(s![row_offset..row_offset + nrows, col_offset..col_offset + ncols])
            .map_inplace(|x| *x = *x * alpha);
    }

    /// Rows `[offset, offset + size)` as a fresh panel. The slice is not
    /// assumed orthonormal.
    pub fn sub_rows(&self, offset: usize, size: usize) -> Panel<A> {
        Panel::from_array(self.data.slice(s![offset..offset + size, ..]).to_owned())
    }

    /// `self ← beta·self + alpha·op(a)·op(b)`.
    pub fn gemm(&mut self, transa: Trans, transb: Trans, alpha: A, a: &Panel<A>, b: &Panel<A>, beta: A) {
        self.ortho = false;
        gemm(transa, transb, alpha, a.view(), b.view(), beta, self.data.view_mut());
    }

    /// Dot product of row `i` of `self` with row `j` of `other`, without
    /// conjugation: entry `(i, j)` of `self · otherᵀ`.
    pub fn dot_rows(&self, i: usize, other: &Panel<A>, j: usize) -> A {
        assert_eq!(self.ncols(), other.ncols());
        let mut acc = A::zero();
        for k in 0..self.ncols() {
            acc = acc + self.data[[i, k]] * other.data[[j, k]];
        }
        acc
    }

    /// `‖self·otherᵀ‖²_F` through the two `k×k` Gram matrices, avoiding
    /// the `m×n` product.
    pub fn norm_product_sqr(&self, other: &Panel<A>) -> f64 {
        assert_eq!(self.ncols(), other.ncols());
        let ga = op_view(Trans::C, self.view()).dot(&self.data);
        let gb = op_view(Trans::C, other.view()).dot(&other.data);
        let mut acc = 0.0;
        for (x, y) in ga.iter().zip(gb.iter()) {
            acc += (*x * *y).re().to_f64().unwrap();
        }
        acc
    }

    /// Perturb every entry by relative noise of magnitude `epsilon`.
    pub fn add_random<R: Rng>(&mut self, epsilon: f64, rng: &mut R) {
        self.ortho = false;
        for x in self.data.iter_mut() {
            let noise = epsilon * (2.0 * rng.gen::<f64>() - 1.0);
            let noise = A::from_real(cast::<f64, A::Real>(noise).unwrap());
            *x = *x + *x * noise;
        }
    }

    /// True if any entry is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.data
            .iter()
            .any(|x| !x.re().is_finite() || !x.im().is_finite())
    }

    /// Replace the panel with the thin orthonormal factor of its QR
    /// decomposition and return the `k × k` triangular factor.
    ///
    /// The first `initial_pivot` columns must already be orthonormal; they
    /// become the leading columns of Q unchanged and only the trailing
    /// block is orthogonalized against them and factorized.
    pub fn qr_in_place(&mut self, initial_pivot: usize) -> Result<Array2<A>> {
        let (m, k) = (self.nrows(), self.ncols());
        assert!(m >= k, "thin QR needs a tall panel");
        assert!(initial_pivot <= k);
        if initial_pivot == 0 {
            let (q, r) = self.data.qr()?;
            self.data = q;
            self.ortho = true;
            return Ok(r);
        }
        let p = initial_pivot;
        let q1 = self.data.slice(s![.., 0..p]).to_owned();
        let a2 = self.data.slice(s![.., p..k]).to_owned();
        // Coefficients of the trailing block on the orthonormal prefix,
        // then a QR of the remainder.
        let r12 = op_view(Trans::C, q1.view()).dot(&a2);
        let a2 = a2 - q1.dot(&r12);
        let mut r = Array2::<A>::zeros((k, k));
        for i in 0..p {
            r[[i, i]] = A::one();
        }
        r.slice_mut(s![0..p, p..k]).assign(&r12);
        let mut q = Array2::<A>::zeros((m, k));
        q.slice_mut(s![.., 0..p]).assign(&q1);
        if k > p {
            let (q2, r22) = a2.qr()?;
            q.slice_mut(s![.., p..k]).assign(&q2);
            r.slice_mut(s![p..k, p..k]).assign(&r22);
        }
        self.data = q;
        self.ortho = true;
        Ok(r)
    }

    /// Modified Gram–Schmidt with column pivoting and a drop tolerance.
    ///
    /// On return the panel holds `rank` orthonormal columns and the
    /// returned `rank × k` matrix `r` satisfies `panel_before =
    /// panel_after · r`, columns indexed in their original order. Columns
    /// whose residual falls below `epsilon` times the largest initial
    /// column norm are dropped. The first `initial_pivot` columns must be
    /// orthonormal already and are accepted as they are.
    pub fn modified_gram_schmidt(
        &mut self,
        epsilon: f64,
        initial_pivot: usize,
    ) -> (usize, Array2<A>) {
        let (m, k) = (self.nrows(), self.ncols());
        assert!(initial_pivot <= k);
        let mut r = Array2::<A>::zeros((k, k));
        // perm[j]: original position of the column currently in slot j.
        let mut perm: Vec<usize> = (0..k).collect();
        let mut norm2: Vec<f64> = self
            .data
            .axis_iter(Axis(1))
            .map(|c| c.norm_l2().to_f64().unwrap().powi(2))
            .collect();
        let reference = norm2.iter().cloned().fold(0.0, f64::max);
        let threshold = epsilon * epsilon * reference;
        let mut rank = 0;
        for j in 0..k {
            if j >= initial_pivot {
                let (piv, best) = norm2[j..]
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                    .map(|(i, &v)| (i + j, v))
                    .unwrap();
                if best <= threshold {
                    break;
                }
                if piv != j {
                    let (col_j, col_piv) =
                        self.data.multi_slice_mut((s![.., j], s![.., piv]));
                    Zip::from(col_j).and(col_piv).for_each(std::mem::swap);
                    norm2.swap(j, piv);
                    perm.swap(j, piv);
                }
                let norm = self.data.column(j).norm_l2();
                r[[j, perm[j]]] = A::from_real(norm);
                let inv = A::one() / A::from_real(norm);
                self.data.column_mut(j).map_inplace(|x| *x = *x * inv);
            } else {
                r[[j, perm[j]]] = A::one();
            }
            rank += 1;
            // Project the remaining columns on the new direction. Columns
            // inside the initial pivot are mutually orthogonal already.
            for l in (j + 1)..k {
                if j < initial_pivot && l < initial_pivot {
                    continue;
                }
                let mut c = A::zero();
                for i in 0..m {
                    c = c + self.data[[i, j]].conj() * self.data[[i, l]];
                }
                r[[j, perm[l]]] = c;
                for i in 0..m {
                    let qij = self.data[[i, j]];
                    self.data[[i, l]] = self.data[[i, l]] - c * qij;
                }
                norm2[l] -= c.abs().to_f64().unwrap().powi(2);
            }
        }
        self.data = self.data.slice(s![.., 0..rank]).to_owned();
        self.ortho = true;
        (rank, r.slice(s![0..rank, ..]).to_owned())
    }

    /// Thin SVD. `u` comes back flagged orthonormal; `vt` is returned as a
    /// plain array because both truncation variants consume its transpose.
    pub fn svd(&self) -> Result<(Panel<A>, Array1<A::Real>, Array2<A>)> {
        let (u, sigma, vt) = self.data.svddc(JobSvd::Some)?;
        let mut u = Panel::from_array(u.expect("left singular vectors were requested"));
        u.ortho = true;
        Ok((u, sigma, vt.expect("right singular vectors were requested")))
    }

    /// Stream the panel: a header of rows, cols and scalar kind, then the
    /// entries in column-major order, all little-endian.
    pub fn write_into<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.nrows() as u64).to_le_bytes())?;
        w.write_all(&(self.ncols() as u64).to_le_bytes())?;
        w.write_all(&(A::KIND as u32).to_le_bytes())?;
        for col in self.data.axis_iter(Axis(1)) {
            for &x in col {
                x.write_le(w)?;
            }
        }
        Ok(())
    }
}
