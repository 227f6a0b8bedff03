//! Approximation control shared by every recompressing operation.

use ndarray::ArrayView1;
use num::{Float, ToPrimitive};

/// Algorithm used by [`crate::rk::RkMatrix::truncate`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecompressionAlgorithm {
    /// QR of both panels, then an SVD of the small coupling matrix.
    QrSvd,
    /// Pivoted modified Gram–Schmidt, then the small SVD.
    Mgs,
}

/// Approximation parameters, passed explicitly to every operation that may
/// recompress. Historically these were environment toggles; [`from_env`]
/// keeps that mapping alive with the original variable names.
///
/// [`from_env`]: ApproximationControl::from_env
#[derive(Clone, Debug)]
pub struct ApproximationControl {
    /// Hard cap on the rank kept by [`find_k`]; 0 lets the singular values
    /// decide.
    ///
    /// [`find_k`]: ApproximationControl::find_k
    pub k: usize,
    /// Tolerance for cascaded recompressions.
    pub recompression_epsilon: f64,
    /// Threshold singular values against `sigma[0]` instead of their sum
    /// (`HMAT_L2_CRITERION`).
    pub l2_criterion: bool,
    /// Honor the initial-pivot arguments of `truncate`; otherwise they are
    /// clamped to 0 (`HMAT_TRUNC_INITPIV`).
    pub use_initial_pivot: bool,
    /// Recompression algorithm (`HMAT_RECOMPRESS=MGS` selects MGS).
    pub recompression: RecompressionAlgorithm,
    /// Reorder coalesced contributions to maximize the initial pivot
    /// (`HMAT_MGS_BESTRK`).
    pub best_rk_order: bool,
    /// Recompress Rk×Rk products through an SVD of the coupling matrix
    /// instead of keeping the smaller-rank side (`HMAT_NEW_RKRK`).
    pub rk_rk_svd: bool,
}

impl Default for ApproximationControl {
    fn default() -> Self {
        ApproximationControl {
            k: 0,
            recompression_epsilon: 1e-4,
            l2_criterion: false,
            use_initial_pivot: false,
            recompression: RecompressionAlgorithm::QrSvd,
            best_rk_order: false,
            rk_rk_svd: false,
        }
    }
}

impl ApproximationControl {
    /// Defaults with the toggles read from the historical `HMAT_*`
    /// environment variables.
    pub fn from_env() -> Self {
        let set = |name: &str| std::env::var_os(name).is_some();
        ApproximationControl {
            l2_criterion: set("HMAT_L2_CRITERION"),
            use_initial_pivot: set("HMAT_TRUNC_INITPIV"),
            recompression: if std::env::var("HMAT_RECOMPRESS").map_or(false, |v| v == "MGS") {
                RecompressionAlgorithm::Mgs
            } else {
                RecompressionAlgorithm::QrSvd
            },
            best_rk_order: set("HMAT_MGS_BESTRK"),
            rk_rk_svd: set("HMAT_NEW_RKRK"),
            ..ApproximationControl::default()
        }
    }

    /// Number of singular values worth keeping at tolerance `epsilon`.
    ///
    /// Returns the index of the first value at or below `epsilon` times
    /// the sum of all values (or times `sigma[0]` under the L² criterion).
    /// A non-zero configured rank bypasses the tolerance and acts as a
    /// hard cap instead. `sigma` must be non-increasing.
    pub fn find_k<R: Float>(&self, sigma: ArrayView1<R>, epsilon: f64) -> usize {
        if self.k != 0 {
            return self.k.min(sigma.len());
        }
        assert!(epsilon >= 0.0);
        if sigma.is_empty() {
            return 0;
        }
        let reference = if self.l2_criterion {
            sigma[0].to_f64().unwrap()
        } else {
            sigma.iter().map(|s| s.to_f64().unwrap()).sum::<f64>()
        };
        let threshold = reference * epsilon;
        sigma
            .iter()
            .position(|s| s.to_f64().unwrap() <= threshold)
            .unwrap_or(sigma.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn find_k_with_sum_criterion() {
        let ctrl = ApproximationControl::default();
        let sigma = array![10.0, 1e-8, 0.0];
        assert_eq!(ctrl.find_k(sigma.view(), 1e-6), 1);
        assert_eq!(ctrl.find_k(sigma.view(), 1e-12), 2);
    }

    #[test]
    fn find_k_with_l2_criterion() {
        let ctrl = ApproximationControl {
            l2_criterion: true,
            ..ApproximationControl::default()
        };
        let sigma = array![2.0, 1.0, 1e-3, 1e-9];
        assert_eq!(ctrl.find_k(sigma.view(), 1e-2), 2);
    }

    #[test]
    fn find_k_with_fixed_rank() {
        let ctrl = ApproximationControl {
            k: 2,
            ..ApproximationControl::default()
        };
        let sigma = array![1.0f64, 0.5, 0.25];
        assert_eq!(ctrl.find_k(sigma.view(), 0.9), 2);
        let short = array![1.0f64];
        assert_eq!(ctrl.find_k(short.view(), 0.9), 1);
    }

    #[test]
    fn find_k_of_zero_spectrum_is_zero() {
        let ctrl = ApproximationControl::default();
        let sigma = array![0.0f64, 0.0];
        assert_eq!(ctrl.find_k(sigma.view(), 1e-4), 0);
    }
}
