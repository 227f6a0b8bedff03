//! Scalar traits, operand modes and error definitions.

use ndarray::LinalgScalar;
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Lapack, Scalar};
use std::io;
use thiserror::Error;

pub use ndarray_linalg::{c32, c64};

#[derive(Error, Debug)]
pub enum RkError {
    #[error("dense linear algebra kernel failed")]
    Kernel(#[from] LinalgError),
}

pub type Result<T> = std::result::Result<T, RkError>;

/// Transposition mode of an operand, BLAS style: as-is, transposed, or
/// conjugate-transposed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trans {
    N,
    T,
    C,
}

/// On-disk tag for the element type of a serialized panel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ScalarKind {
    F32 = 0,
    F64 = 1,
    C32 = 2,
    C64 = 3,
}

/// Element type of a block: one of `f32`, `f64`, `c32`, `c64`.
pub trait RkScalar: Scalar + Lapack + LinalgScalar {
    /// Serialization tag of this scalar type.
    const KIND: ScalarKind;

    /// Write the scalar little-endian, complex entries as (re, im).
    fn write_le<W: io::Write>(self, w: &mut W) -> io::Result<()>;
}

macro_rules! rk_scalar_impl {
    (@real, $scalar:ty, $kind:expr) => {
        impl RkScalar for $scalar {
            const KIND: ScalarKind = $kind;

            fn write_le<W: io::Write>(self, w: &mut W) -> io::Result<()> {
                w.write_all(&self.to_le_bytes())
            }
        }
    };
    (@complex, $scalar:ty, $kind:expr) => {
        impl RkScalar for $scalar {
            const KIND: ScalarKind = $kind;

            fn write_le<W: io::Write>(self, w: &mut W) -> io::Result<()> {
                w.write_all(&self.re.to_le_bytes())?;
                w.write_all(&self.im.to_le_bytes())
            }
        }
    };
}

rk_scalar_impl!(@real, f32, ScalarKind::F32);
rk_scalar_impl!(@real, f64, ScalarKind::F64);
rk_scalar_impl!(@complex, c32, ScalarKind::C32);
rk_scalar_impl!(@complex, c64, ScalarKind::C64);
