//! Collect the crate's common exports.

pub use crate::control::{ApproximationControl, RecompressionAlgorithm};
pub use crate::dense::DenseBlock;
pub use crate::helpers::RelDiff;
pub use crate::hmatrix::{BlockContent, BlockData, HMatrix};
pub use crate::index_set::IndexSet;
pub use crate::panel::Panel;
pub use crate::random::RandomPanel;
pub use crate::rk::RkMatrix;
pub use crate::tree::Tree;
pub use crate::types::{c32, c64, Result, RkError, RkScalar, ScalarKind, Trans};
pub use crate::CompressionMethod;
