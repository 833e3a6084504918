//! The four deblurring methods and the shared entry point.
//!
//! Each solver lives in its own module and shares the padding, transform
//! and spectral kernels; [`Method`] selects one together with its options
//! record, and [`solve`] dispatches.

pub mod cgls;
pub mod hybr;
pub mod mrnsd;
pub mod precond;
pub mod wpl;

pub use cgls::CglsOptions;
pub use hybr::{HybrOptions, RegMethod};
pub use mrnsd::MrnsdOptions;
pub use precond::Preconditioner;
pub use wpl::WplOptions;

use crate::error::DeblurError;
use crate::image::{Image, OutputImage, OutputKind};
use crate::padding::{Boundary, Resizing};
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Deblurring method together with its options record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Method {
    /// Wiener-filter preconditioned Landweber (nonnegatively constrained).
    Wpl(WplOptions),
    /// Conjugate gradient for least squares.
    Cgls(CglsOptions),
    /// Modified residual norm steepest descent (nonnegative by construction).
    Mrnsd(MrnsdOptions),
    /// Hybrid bidiagonalization regularization.
    Hybr(HybrOptions),
}

/// Configuration shared by all methods.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeblurConfig {
    pub boundary: Boundary,
    pub resizing: Resizing,
    pub output: OutputKind,
    pub max_iters: usize,
    /// Smallest value kept in the restored image; everything below is set
    /// to zero. `-1.0` disables thresholding.
    pub threshold: f64,
}

impl Default for DeblurConfig {
    fn default() -> Self {
        DeblurConfig {
            boundary: Boundary::Reflexive,
            resizing: Resizing::Auto,
            output: OutputKind::SameAsSource,
            max_iters: 15,
            threshold: -1.0,
        }
    }
}

/// Snapshot handed to a [`Monitor`] after each iteration.
pub struct IterationEvent<'a, T> {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Convergence metric of the iteration: `percent_change` for WPL, the
    /// residual norm for the least-squares methods.
    pub metric: f64,
    /// Current estimate, cropped to the source extent.
    pub estimate: &'a Image<T>,
}

/// Observer of the running iteration. Has no effect on convergence.
pub trait Monitor<T> {
    fn iteration(&mut self, event: IterationEvent<'_, T>);
}

/// Deblurs `image` with the given `psf`.
///
/// Both buffers must have the same rank (2D or 3D). The result has the
/// rank and extent of `image`, in the numeric kind requested by
/// `config.output`.
pub fn solve<T: Sample>(
    image: &Image<T>,
    psf: &Image<T>,
    config: &DeblurConfig,
    method: &Method,
    monitor: Option<&mut dyn Monitor<T>>,
) -> Result<OutputImage, DeblurError> {
    validate(image, psf, config)?;
    match method {
        Method::Wpl(options) => wpl::deblur(image, psf, config, options, monitor),
        Method::Cgls(options) => cgls::deblur(image, psf, config, options, monitor),
        Method::Mrnsd(options) => mrnsd::deblur(image, psf, config, options, monitor),
        Method::Hybr(options) => hybr::deblur(image, psf, config, options, monitor),
    }
}

fn validate<T: Sample>(
    image: &Image<T>,
    psf: &Image<T>,
    config: &DeblurConfig,
) -> Result<(), DeblurError> {
    if image.dims().is_empty() || psf.dims().is_empty() {
        return Err(DeblurError::EmptyInput);
    }
    if image.rank() != psf.rank() {
        return Err(DeblurError::RankMismatch {
            image: image.rank(),
            psf: psf.rank(),
        });
    }
    if config.threshold != -1.0 && config.threshold < 0.0 {
        return Err(DeblurError::BadOption(format!(
            "threshold must be nonnegative or the -1 sentinel, got {}",
            config.threshold
        )));
    }
    if config.max_iters == 0 {
        return Err(DeblurError::BadOption("max_iters must be positive".into()));
    }
    Ok(())
}

/// Thresholds and converts a finished, source-extent estimate.
pub(crate) fn finalize<T: Sample>(
    mut estimate: Image<T>,
    threshold: f64,
    output: OutputKind,
) -> OutputImage {
    estimate.apply_threshold(threshold);
    estimate.into_output(output)
}
