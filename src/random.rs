//! Random panels and factor pairs, for tests and experiments.

use crate::panel::Panel;
use crate::types::RkScalar;
use ndarray::{Array, Array2};
use ndarray_linalg::{JobSvd, SVDDCInto};
use num::complex::Complex;
use num::traits::cast::cast;
use num::Float;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Random generation of panels and low-rank factor pairs.
pub trait RandomPanel
where
    Self: RkScalar,
{
    /// A matrix with independent standard Gaussian entries.
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Self>;

    /// A panel with orthonormal columns, obtained by orthogonalizing a
    /// Gaussian matrix. Requires `rows >= cols`.
    fn random_orthonormal<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Panel<Self> {
        assert!(dimension.0 >= dimension.1);
        let mat = Self::random_gaussian(dimension, rng);
        let (u, _, _) = mat
            .svddc_into(JobSvd::Some)
            .expect("orthogonalization failed");
        let mut panel = Panel::from_array(u.unwrap());
        panel.set_ortho(true);
        panel
    }

    /// A factor pair `(a, b)` of width `k` whose product `a · bᵀ` has
    /// singular values distributed logarithmically between `sigma_max`
    /// and `sigma_min`. The singular values are folded into `a`; `b`
    /// keeps orthonormal columns.
    fn random_low_rank_factors<R: Rng>(
        m: usize,
        n: usize,
        k: usize,
        sigma_max: f64,
        sigma_min: f64,
        rng: &mut R,
    ) -> (Panel<Self>, Panel<Self>) {
        assert!(k >= 1 && k <= m.min(n));
        assert!(
            0.0 < sigma_min && sigma_min <= sigma_max,
            "singular value bounds must be positive and ordered"
        );
        let mut a = Self::random_orthonormal((m, k), rng);
        let b = Self::random_orthonormal((n, k), rng);
        let singvals: Vec<<Self as ndarray_linalg::Scalar>::Real> =
            Array::geomspace(sigma_max, sigma_min, k)
                .unwrap()
                .iter()
                .map(|&s| cast::<f64, <Self as ndarray_linalg::Scalar>::Real>(s).unwrap())
                .collect();
        a.scale_columns(&singvals);
        (a, b)
    }
}

impl RandomPanel for f32 {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<f32> {
        random_gaussian_real::<f32, R>(dimension, rng)
    }
}

impl RandomPanel for f64 {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<f64> {
        random_gaussian_real::<f64, R>(dimension, rng)
    }
}

impl RandomPanel for Complex<f32> {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Complex<f32>> {
        random_gaussian_complex::<f32, R>(dimension, rng)
    }
}

impl RandomPanel for Complex<f64> {
    fn random_gaussian<R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<Complex<f64>> {
        random_gaussian_complex::<f64, R>(dimension, rng)
    }
}

fn random_gaussian_real<T: Float, R: Rng>(dimension: (usize, usize), rng: &mut R) -> Array2<T> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut mat = Array2::<T>::zeros(dimension);
    mat.map_inplace(|item| *item = cast::<f64, T>(normal.sample(rng)).unwrap());
    mat
}

fn random_gaussian_complex<T: Float, R: Rng>(
    dimension: (usize, usize),
    rng: &mut R,
) -> Array2<Complex<T>> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut mat = Array2::<Complex<T>>::zeros(dimension);
    mat.map_inplace(|item| {
        let re = cast::<f64, T>(normal.sample(rng)).unwrap();
        let im = cast::<f64, T>(normal.sample(rng)).unwrap();
        *item = Complex::new(re, im);
    });
    mat
}
