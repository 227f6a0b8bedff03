//! Dense blocks: the uncompressed leaves of the hierarchical structure.

use crate::control::ApproximationControl;
use crate::index_set::IndexSet;
use crate::panel::{gemm, Panel};
use crate::rk::RkMatrix;
use crate::types::{Result, RkScalar, Trans};
use crate::CompressionMethod;
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};
use ndarray_linalg::{JobSvd, SVDDC};

/// An index-set pair and the matching dense entries.
#[derive(Clone, Debug)]
pub struct DenseBlock<A: RkScalar> {
    pub rows: IndexSet,
    pub cols: IndexSet,
    pub data: Array2<A>,
}

impl<A: RkScalar> DenseBlock<A> {
    pub fn zeros(rows: IndexSet, cols: IndexSet) -> Self {
        DenseBlock {
            rows,
            cols,
            data: Array2::zeros((rows.size(), cols.size())),
        }
    }

    pub fn new(rows: IndexSet, cols: IndexSet, data: Array2<A>) -> Self {
        assert_eq!(data.nrows(), rows.size());
        assert_eq!(data.ncols(), cols.size());
        DenseBlock { rows, cols, data }
    }

    pub fn nrows(&self) -> usize {
        self.rows.size()
    }

    pub fn ncols(&self) -> usize {
        self.cols.size()
    }

    /// `self[sub] += alpha·other`, where `other` covers a subset of the
    /// index sets of `self`.
    pub fn axpy_subset(&mut self, alpha: A, other: &DenseBlock<A>) {
        assert!(other.rows.is_subset(&self.rows));
        assert!(other.cols.is_subset(&self.cols));
        let r0 = other.rows.offset() - self.rows.offset();
        let c0 = other.cols.offset() - self.cols.offset();
        self.data
            .slice_mut(s![r0..r0 + other.nrows(), c0..c0 + other.ncols()])
            .scaled_add(alpha, &other.data);
    }

    /// `y ← beta·y + alpha·op(self)·x`.
    pub fn gemv(&self, trans: Trans, alpha: A, x: ArrayView2<A>, beta: A, y: ArrayViewMut2<A>) {
        gemm(trans, Trans::N, alpha, self.data.view(), x, beta, y);
    }

    /// Compress into an Rk block at tolerance `epsilon`.
    ///
    /// The kept singular values are folded into the left factor; the right
    /// factor keeps orthonormal columns and is flagged as such. A spectrum
    /// entirely below the threshold yields the empty block.
    pub fn truncated_svd(
        &self,
        ctrl: &ApproximationControl,
        epsilon: f64,
    ) -> Result<RkMatrix<A>> {
        let (u, sigma, vt) = self.data.svddc(JobSvd::Some)?;
        let u = u.expect("left singular vectors were requested");
        let vt = vt.expect("right singular vectors were requested");
        let new_k = ctrl.find_k(sigma.view(), epsilon);
        if new_k == 0 {
            return Ok(RkMatrix::empty(self.rows, self.cols, CompressionMethod::Svd));
        }
        let mut a = Panel::from_array(u.slice(s![.., 0..new_k]).to_owned());
        a.scale_columns(&sigma.as_slice().unwrap()[0..new_k]);
        let mut b = Panel::from_array(vt.slice(s![0..new_k, ..]).t().to_owned());
        b.set_ortho(true);
        Ok(RkMatrix::from_factors(
            a,
            b,
            self.rows,
            self.cols,
            CompressionMethod::Svd,
        ))
    }
}
