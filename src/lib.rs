//! Iterative frequency-domain deblurring of 2D and 3D images.
//!
//! The crate restores a blurred image given a point-spread function by
//! iterating entirely in the real-valued Hartley transform domain.
//! Four solvers share the same padding, transform and spectral kernels:
//!
//! - `WPL`: Wiener-filter preconditioned Landweber (nonnegatively constrained)
//! - `CGLS`: conjugate gradient for least squares
//! - `MRNSD`: modified residual norm steepest descent (nonnegative by construction)
//! - `HyBR`: hybrid bidiagonalization regularization
//!
//! # Modules
//! - `image`: dense 2D/3D sample buffers and output conversion
//! - `padding`: boundary conditions and working-grid sizing
//! - `hartley`: multidimensional Hartley transform over cached FFT plans
//! - `spectral`: transform-domain convolution, deconvolution and weighting
//! - `psf`: PSF centering and the forward/adjoint blur operator
//! - `method`: the four solvers and their options

pub mod error;
pub mod hartley;
pub mod image;
pub mod method;
pub mod padding;
pub mod psf;
pub mod spectral;
pub mod tiles;

pub use error::DeblurError;
pub use image::{Image, OutputImage, OutputKind};
pub use method::{
    solve, CglsOptions, DeblurConfig, HybrOptions, IterationEvent, Method, Monitor, MrnsdOptions,
    Preconditioner, RegMethod, WplOptions,
};
pub use padding::{Boundary, Resizing};

use ndarray::LinalgScalar;
use num_traits::Float;

/// Floating-point sample type the engine is monomorphized over.
///
/// Implemented for `f32` and `f64`. Every kernel exists once, generic over
/// this trait, instead of once per precision.
pub trait Sample:
    Float + LinalgScalar + rustfft::FftNum + Send + Sync + std::iter::Sum + 'static
{
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    /// Wraps a finished buffer in the output variant matching this precision,
    /// which is what a `SameAsSource` request resolves to.
    fn wrap_native(data: ndarray::ArrayD<Self>) -> OutputImage;
}

impl Sample for f32 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn wrap_native(data: ndarray::ArrayD<f32>) -> OutputImage {
        OutputImage::Float(data)
    }
}

impl Sample for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
    fn wrap_native(data: ndarray::ArrayD<f64>) -> OutputImage {
        OutputImage::Double(data)
    }
}

/// `sqrt(machine epsilon)`, the tolerance floor shared by the least-squares
/// solvers and the preconditioner.
pub(crate) fn sqrt_eps<T: Sample>() -> T {
    T::epsilon().sqrt()
}
