//! Small helpers shared by the test suites.

use crate::types::RkScalar;
use ndarray::{ArrayBase, Data, Ix2};
use ndarray_linalg::OperationNorm;
use num::ToPrimitive;

/// Relative Frobenius-norm distance between two matrices.
pub trait RelDiff {
    type A: RkScalar;

    /// `‖self − other‖_F / ‖other‖_F` (the absolute distance if `other`
    /// is zero).
    fn rel_diff<S2: Data<Elem = Self::A>>(&self, other: &ArrayBase<S2, Ix2>) -> f64;
}

impl<A, S> RelDiff for ArrayBase<S, Ix2>
where
    A: RkScalar,
    S: Data<Elem = A>,
{
    type A = A;

    fn rel_diff<S2: Data<Elem = A>>(&self, other: &ArrayBase<S2, Ix2>) -> f64 {
        let diff = self.to_owned() - other;
        let num = diff.opnorm_fro().unwrap().to_f64().unwrap();
        let denom = other.opnorm_fro().unwrap().to_f64().unwrap();
        if denom == 0.0 {
            num
        } else {
            num / denom
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn rel_diff_is_relative() {
        let a = array![[2.0f64, 0.0], [0.0, 2.0]];
        let b = array![[2.0f64, 0.0], [0.0, 2.2]];
        let d = b.rel_diff(&a);
        assert!(d > 0.0 && d < 0.1);
        assert_eq!(a.rel_diff(&a), 0.0);
    }
}
