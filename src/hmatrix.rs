//! A minimal hierarchical-matrix node: the operand the Rk algebra
//! multiplies against.
//!
//! Nodes form a block [`Tree`]; a leaf holds nothing (the zero block), a
//! dense block, or an Rk block, while internal nodes carry a child grid
//! partitioning their index sets.

use crate::control::ApproximationControl;
use crate::dense::DenseBlock;
use crate::index_set::IndexSet;
use crate::panel::{gemm, op_view};
use crate::rk::RkMatrix;
use crate::tree::Tree;
use crate::types::{Result, RkScalar, Trans};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut1, ArrayViewMut2};
use num::{One, Zero};

/// Payload of one node of the block tree.
#[derive(Debug)]
pub struct BlockData<A: RkScalar> {
    rows: IndexSet,
    cols: IndexSet,
    content: Option<BlockContent<A>>,
}

/// What a leaf holds.
#[derive(Debug)]
pub enum BlockContent<A: RkScalar> {
    Dense(DenseBlock<A>),
    Rk(RkMatrix<A>),
}

/// A hierarchical matrix node.
pub type HMatrix<A> = Tree<BlockData<A>>;

impl<A: RkScalar> HMatrix<A> {
    /// A zero leaf over the given index sets.
    pub fn null_leaf(rows: IndexSet, cols: IndexSet) -> Self {
        Tree::leaf(BlockData {
            rows,
            cols,
            content: None,
        })
    }

    pub fn dense_leaf(block: DenseBlock<A>) -> Self {
        let (rows, cols) = (block.rows, block.cols);
        Tree::leaf(BlockData {
            rows,
            cols,
            content: Some(BlockContent::Dense(block)),
        })
    }

    pub fn rk_leaf(rk: RkMatrix<A>) -> Self {
        let (rows, cols) = (rk.rows(), rk.cols());
        Tree::leaf(BlockData {
            rows,
            cols,
            content: Some(BlockContent::Rk(rk)),
        })
    }

    /// An internal node with an empty `nr_child_row × nr_child_col` grid.
    pub fn blocked(
        rows: IndexSet,
        cols: IndexSet,
        nr_child_row: usize,
        nr_child_col: usize,
    ) -> Self {
        Tree::with_grid(
            BlockData {
                rows,
                cols,
                content: None,
            },
            nr_child_row,
            nr_child_col,
        )
    }

    pub fn rows(&self) -> IndexSet {
        self.data.rows
    }

    pub fn cols(&self) -> IndexSet {
        self.data.cols
    }

    /// A leaf holding nothing: the zero block.
    pub fn is_null(&self) -> bool {
        self.is_leaf() && self.data.content.is_none()
    }

    pub fn is_rk(&self) -> bool {
        matches!(self.data.content, Some(BlockContent::Rk(_)))
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.data.content, Some(BlockContent::Dense(_)))
    }

    pub fn rk(&self) -> Option<&RkMatrix<A>> {
        match &self.data.content {
            Some(BlockContent::Rk(rk)) => Some(rk),
            _ => None,
        }
    }

    pub fn dense(&self) -> Option<&DenseBlock<A>> {
        match &self.data.content {
            Some(BlockContent::Dense(block)) => Some(block),
            _ => None,
        }
    }

    /// `y ← beta·y + alpha·op(self)·x`, recursing over the block
    /// structure. `x` covers the operand's input side, `y` its output
    /// side.
    pub fn gemv(&self, trans: Trans, alpha: A, x: ArrayView2<A>, beta: A, mut y: ArrayViewMut2<A>) {
        assert_eq!(
            x.nrows(),
            if trans == Trans::N { self.cols().size() } else { self.rows().size() }
        );
        assert_eq!(
            y.nrows(),
            if trans == Trans::N { self.rows().size() } else { self.cols().size() }
        );
        if beta != A::one() {
            y.map_inplace(|v| *v = *v * beta);
        }
        self.gemv_accumulate(trans, alpha, x, y);
    }

    fn gemv_accumulate(&self, trans: Trans, alpha: A, x: ArrayView2<A>, mut y: ArrayViewMut2<A>) {
        match &self.data.content {
            Some(BlockContent::Rk(rk)) => rk.gemv(trans, alpha, x, A::one(), y),
            Some(BlockContent::Dense(block)) => block.gemv(trans, alpha, x, A::one(), y),
            None if self.is_leaf() => {}
            None => {
                for i in 0..self.nr_child_row() {
                    for j in 0..self.nr_child_col() {
                        let child = match self.child(i, j) {
                            Some(c) => c,
                            None => continue,
                        };
                        let row_off = child.rows().offset() - self.rows().offset();
                        let col_off = child.cols().offset() - self.cols().offset();
                        // `N` maps cols to x and rows to y; both transposed
                        // modes swap the roles.
                        let (x_off, x_len, y_off, y_len) = if trans == Trans::N {
                            (col_off, child.cols().size(), row_off, child.rows().size())
                        } else {
                            (row_off, child.rows().size(), col_off, child.cols().size())
                        };
                        child.gemv_accumulate(
                            trans,
                            alpha,
                            x.slice(s![x_off..x_off + x_len, ..]),
                            y.slice_mut(s![y_off..y_off + y_len, ..]),
                        );
                    }
                }
            }
        }
    }

    /// Copy the diagonal entries into `diag`, which covers `rows`.
    pub fn extract_diagonal(&self, mut diag: ArrayViewMut1<A>) {
        assert_eq!(self.rows().size(), self.cols().size());
        assert_eq!(diag.len(), self.rows().size());
        match &self.data.content {
            Some(BlockContent::Dense(block)) => {
                for i in 0..block.nrows() {
                    diag[i] = block.data[[i, i]];
                }
            }
            Some(BlockContent::Rk(rk)) => {
                for i in 0..rk.rows().size() {
                    diag[i] = rk.get(i, i);
                }
            }
            None if self.is_leaf() => diag.fill(A::zero()),
            None => {
                for i in 0..self.nr_child_row().min(self.nr_child_col()) {
                    if let Some(child) = self.child(i, i) {
                        let off = child.rows().offset() - self.rows().offset();
                        child.extract_diagonal(
                            diag.slice_mut(s![off..off + child.rows().size()]),
                        );
                    }
                }
            }
        }
    }

    /// Product of two nodes of which at least one is an Rk leaf, as an Rk
    /// block.
    pub fn multiply_rk(
        ctrl: &ApproximationControl,
        trans_a: Trans,
        trans_b: Trans,
        ha: &HMatrix<A>,
        hb: &HMatrix<A>,
    ) -> Result<RkMatrix<A>> {
        match (ha.rk(), hb.rk()) {
            (Some(ra), Some(rb)) => RkMatrix::multiply_rk_rk(ctrl, trans_a, trans_b, ra, rb),
            (Some(ra), None) => Ok(match hb.dense() {
                Some(fb) => RkMatrix::multiply_rk_dense(trans_a, trans_b, ra, fb),
                None => RkMatrix::multiply_rk_h(trans_a, trans_b, ra, hb),
            }),
            (None, Some(rb)) => Ok(match ha.dense() {
                Some(fa) => RkMatrix::multiply_dense_rk(trans_a, trans_b, fa, rb),
                None => RkMatrix::multiply_h_rk(trans_a, trans_b, ha, rb),
            }),
            (None, None) => unreachable!("an Rk operand is required"),
        }
    }

    /// Product of two nodes of which at least one is a dense leaf and
    /// none is Rk or null, as a dense block.
    pub fn multiply_dense(
        trans_a: Trans,
        trans_b: Trans,
        ha: &HMatrix<A>,
        hb: &HMatrix<A>,
    ) -> DenseBlock<A> {
        let rows = if trans_a == Trans::N { ha.rows() } else { ha.cols() };
        let cols = if trans_b == Trans::N { hb.cols() } else { hb.rows() };
        match (ha.dense(), hb.dense()) {
            (Some(fa), Some(fb)) => {
                let mut out = DenseBlock::zeros(rows, cols);
                gemm(
                    trans_a,
                    trans_b,
                    A::one(),
                    fa.data.view(),
                    fb.data.view(),
                    A::zero(),
                    out.data.view_mut(),
                );
                out
            }
            (None, Some(fb)) => {
                // op_a(Ha) applied to the dense right factor.
                let rhs = op_view(trans_b, fb.data.view()).to_owned();
                let mut out = DenseBlock::zeros(rows, cols);
                ha.gemv(trans_a, A::one(), rhs.view(), A::zero(), out.data.view_mut());
                out
            }
            (Some(fa), None) => {
                // Computed transposed: Cᵀ = op_b(Hb)ᵀ · op_a(Fa)ᵀ.
                let lhs = op_view(trans_a, fa.data.view()).to_owned().reversed_axes();
                let lhs = lhs.as_standard_layout().into_owned();
                let mut out_t = Array2::<A>::zeros((cols.size(), rows.size()));
                match trans_b {
                    Trans::N => {
                        hb.gemv(Trans::T, A::one(), lhs.view(), A::zero(), out_t.view_mut())
                    }
                    Trans::T => {
                        hb.gemv(Trans::N, A::one(), lhs.view(), A::zero(), out_t.view_mut())
                    }
                    Trans::C => {
                        // conj(Hb)·X = conj(Hb·conj(X))
                        let conj_lhs = lhs.mapv(|v| v.conj());
                        hb.gemv(Trans::N, A::one(), conj_lhs.view(), A::zero(), out_t.view_mut());
                        out_t.map_inplace(|v| *v = v.conj());
                    }
                }
                let data = out_t.reversed_axes().as_standard_layout().into_owned();
                DenseBlock::new(rows, cols, data)
            }
            (None, None) => unreachable!("a dense operand is required"),
        }
    }
}
