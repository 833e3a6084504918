//! PSF preparation and the forward/adjoint blur operator.
//!
//! Circular convolution assumes a kernel centered at the origin, so the
//! PSF is zero-padded to the working grid and circularly shifted by the
//! location of its energy peak in the unpadded buffer. The least-squares
//! solvers never see the working grid: [`PsfOperator`] pads, transforms,
//! multiplies, inverse-transforms and crops on every application.

use crate::error::DeblurError;
use crate::hartley::HartleyPlan;
use crate::image::{Dims, Image};
use crate::padding::{self, Boundary, Resizing};
use crate::spectral;
use crate::Sample;

/// Location `(slice, row, col)` of the largest sample.
pub fn max_location<T: Sample>(x: &Image<T>) -> [usize; 3] {
    let dims = x.dims();
    let mut best = T::neg_infinity();
    let mut loc = [0usize; 3];
    for s in 0..dims.slices {
        for r in 0..dims.rows {
            for c in 0..dims.cols {
                let v = x.get(s, r, c);
                if v > best {
                    best = v;
                    loc = [s, r, c];
                }
            }
        }
    }
    loc
}

/// Expanded working grid for an image/PSF pair.
///
/// 2D inputs keep a single slice; real axes are sized per the resizing
/// policy with a floor of 4.
pub fn expanded_dims(psf: Dims, image: Dims, rank: usize, resizing: Resizing) -> Dims {
    let slices = if rank == 3 {
        padding::expanded_size(psf.slices, image.slices, resizing)
    } else {
        1
    };
    Dims::new(
        slices,
        padding::expanded_size(psf.rows, image.rows, resizing),
        padding::expanded_size(psf.cols, image.cols, resizing),
    )
}

/// Checks the PSF fits the working grid on every axis.
pub fn check_psf_fits(psf: Dims, work: Dims) -> Result<(), DeblurError> {
    let axes = [
        ("slice", psf.slices, work.slices),
        ("row", psf.rows, work.rows),
        ("column", psf.cols, work.cols),
    ];
    for (axis, p, w) in axes {
        if p > w {
            return Err(DeblurError::PsfTooLarge {
                axis,
                psf: p,
                working: w,
            });
        }
    }
    Ok(())
}

/// Zero-pads the PSF to the working grid and circularly shifts its peak
/// to the origin.
pub fn center_on_grid<T: Sample>(psf: &Image<T>, work: Dims) -> Image<T> {
    let peak = max_location(psf);
    let padded = padding::pad_zero_post(psf, work);
    padding::circ_shift(&padded, peak)
}

/// The blur operator `A` (and its adjoint) realized in the transform
/// domain over a private working grid.
pub struct PsfOperator<T: Sample> {
    boundary: Boundary,
    image_dims: Dims,
    work_dims: Dims,
    rank: usize,
    psf_ht: Image<T>,
    plan: HartleyPlan<T>,
}

impl<T: Sample> std::fmt::Debug for PsfOperator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsfOperator")
            .field("boundary", &self.boundary)
            .field("image_dims", &self.image_dims)
            .field("work_dims", &self.work_dims)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

impl<T: Sample> PsfOperator<T> {
    pub fn new(
        psf: &Image<T>,
        boundary: Boundary,
        resizing: Resizing,
        image_dims: Dims,
        rank: usize,
    ) -> Result<Self, DeblurError> {
        if image_dims.is_empty() || psf.dims().is_empty() {
            return Err(DeblurError::EmptyInput);
        }
        let work_dims = expanded_dims(psf.dims(), image_dims, rank, resizing);
        check_psf_fits(psf.dims(), work_dims)?;
        let mut psf_ht = center_on_grid(psf, work_dims);
        let mut plan = HartleyPlan::new(work_dims);
        plan.forward(&mut psf_ht);
        Ok(PsfOperator {
            boundary,
            image_dims,
            work_dims,
            rank,
            psf_ht,
            plan,
        })
    }

    pub fn image_dims(&self) -> Dims {
        self.image_dims
    }

    pub fn work_dims(&self) -> Dims {
        self.work_dims
    }

    /// The Hartley-transformed, origin-centered PSF on the working grid.
    pub fn psf_spectrum(&self) -> &Image<T> {
        &self.psf_ht
    }

    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    /// `A x`: blur an image-extent buffer.
    pub fn apply(&mut self, x: &Image<T>) -> Image<T> {
        self.convolve(x, false)
    }

    /// `A^T x`: correlate an image-extent buffer with the PSF.
    pub fn apply_adjoint(&mut self, x: &Image<T>) -> Image<T> {
        self.convolve(x, true)
    }

    fn convolve(&mut self, x: &Image<T>, transpose: bool) -> Image<T> {
        debug_assert_eq!(x.dims(), self.image_dims);
        let mut padded = padding::pad(x, self.boundary, self.work_dims);
        self.plan.forward(&mut padded);
        let mut out = Image::zeros(self.work_dims, self.rank);
        if transpose {
            spectral::convolve_transpose_fd(
                self.work_dims,
                self.psf_ht.as_slice(),
                padded.as_slice(),
                out.as_mut_slice(),
            );
        } else {
            spectral::convolve_fd(
                self.work_dims,
                self.psf_ht.as_slice(),
                padded.as_slice(),
                out.as_mut_slice(),
            );
        }
        self.plan.inverse(&mut out);
        padding::crop(&out, self.image_dims, self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn peak_location_is_found() {
        let mut x = Image::<f64>::zeros(Dims::new(2, 3, 4), 3);
        x.set(1, 2, 1, 5.0);
        assert_eq!(max_location(&x), [1, 2, 1]);
    }

    #[test]
    fn expanded_dims_keep_2d_single_slice() {
        let psf = Dims::new(1, 3, 3);
        let image = Dims::new(1, 8, 8);
        let work = expanded_dims(psf, image, 2, Resizing::Minimal);
        assert_eq!(work, Dims::new(1, 11, 11));
    }

    #[test]
    fn oversized_psf_is_rejected() {
        let psf = Image::<f32>::zeros(Dims::new(1, 40, 3), 2);
        let err = PsfOperator::new(
            &psf,
            Boundary::Zero,
            Resizing::Minimal,
            Dims::new(1, 8, 8),
            2,
        )
        .unwrap_err();
        match err {
            DeblurError::PsfTooLarge { psf: 40, .. } => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn identity_psf_applies_as_identity() {
        let a = Array2::from_shape_fn((6, 6), |(r, c)| ((r * 6 + c) % 5) as f64);
        let x = Image::from_2d(a.view());
        let mut psf = Image::<f64>::zeros(Dims::new(1, 3, 3), 2);
        psf.set(0, 1, 1, 1.0);
        let mut op = PsfOperator::new(
            &psf,
            Boundary::Zero,
            Resizing::Minimal,
            x.dims(),
            2,
        )
        .expect("valid setup");
        let y = op.apply(&x);
        let yt = op.apply_adjoint(&x);
        for ((got, got_t), want) in y
            .as_slice()
            .iter()
            .zip(yt.as_slice())
            .zip(x.as_slice())
        {
            assert_abs_diff_eq!(got, want, epsilon = 1e-10);
            assert_abs_diff_eq!(got_t, want, epsilon = 1e-10);
        }
    }

    #[test]
    fn box_psf_preserves_total_energy_periodically() {
        let mut x = Image::<f64>::zeros(Dims::new(1, 8, 8), 2);
        x.set(0, 4, 4, 100.0);
        let mut psf = Image::<f64>::zeros(Dims::new(1, 3, 3), 2);
        for r in 0..3 {
            for c in 0..3 {
                psf.set(0, r, c, 1.0 / 9.0);
            }
        }
        let mut op = PsfOperator::new(
            &psf,
            Boundary::Periodic,
            Resizing::Auto,
            x.dims(),
            2,
        )
        .expect("valid setup");
        let y = op.apply(&x);
        assert_abs_diff_eq!(y.sum(), 100.0, epsilon = 1e-8);
        // the blur spreads the impulse over a 3x3 patch
        assert_abs_diff_eq!(y.get(0, 4, 4), 100.0 / 9.0, epsilon = 1e-8);
        assert_abs_diff_eq!(y.get(0, 3, 5), 100.0 / 9.0, epsilon = 1e-8);
    }
}
