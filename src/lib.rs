//! Low-rank block algebra for hierarchical matrices.
//!
//! An Rk block stores a dense `m × n` matrix as the outer product `A·Bᵀ`
//! of two tall-thin factor panels of width `k` (the rank). This crate
//! implements the arithmetic on such blocks: scaling, transposition,
//! matrix-vector products, coalesced sums of many low-rank and dense
//! contributions, products against dense, low-rank and hierarchical
//! operands, and the rank-revealing recompressions that keep `k` close to
//! the ε-optimal rank after each operation.

pub mod control;
pub mod dense;
pub mod helpers;
pub mod hmatrix;
pub mod index_set;
pub mod panel;
pub mod prelude;
pub mod random;
pub mod rk;
pub mod tree;
pub mod types;

/// Provenance of a compressed block. When several blocks are combined the
/// minimum tag is kept.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum CompressionMethod {
    Svd,
    AcaFull,
    AcaPartial,
    AcaPlus,
    NoCompression,
}

pub use crate::control::ApproximationControl;
pub use crate::dense::DenseBlock;
pub use crate::hmatrix::HMatrix;
pub use crate::index_set::IndexSet;
pub use crate::panel::Panel;
pub use crate::rk::RkMatrix;
pub use crate::types::{Result, RkError, RkScalar, Trans};
