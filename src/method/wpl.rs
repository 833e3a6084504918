//! Wiener-filter preconditioned Landweber deblurring.
//!
//! The driver works entirely on the expanded working grid: the blurred
//! image is padded once per the boundary policy, the PSF is centered and
//! kept Hartley-transformed for the whole run, and each iteration refines
//! the estimate with a nonnegativity-clamped Landweber step damped by a
//! separable Gaussian frequency weight. The result is rescaled, cropped
//! back to the source extent and converted at the end.

use crate::error::DeblurError;
use crate::hartley::HartleyPlan;
use crate::image::{self, Dims, Image, OutputImage};
use crate::method::{self, DeblurConfig, IterationEvent, Monitor};
use crate::padding::{self, center_offset};
use crate::psf;
use crate::spectral;
use crate::Sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Below this, the Wiener pre-filter is disabled entirely.
const GAMMA_EPS: f64 = 1e-4;

/// Floor used when converting the finished estimate back to decibels.
const MIN_DB: f64 = -90.0;

/// Options of the WPL method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WplOptions {
    /// Wiener regularization weight of the pre-filter step; values at or
    /// below `1e-4` skip the pre-filter.
    pub gamma: f64,
    /// Gaussian frequency weight width along columns.
    pub filter_x: f64,
    /// Gaussian frequency weight width along rows.
    pub filter_y: f64,
    /// Gaussian frequency weight width along slices (3D only).
    pub filter_z: f64,
    /// Rescale the blurred image by the PSF sum before iterating.
    pub normalize: bool,
    /// Log the per-iteration percent change.
    pub log_mean: bool,
    /// Run the anti-ringing blend before iterating.
    pub anti_ring: bool,
    /// Convergence threshold on the decrease of the percent change.
    pub change_thresh_percent: f64,
    /// Inputs are in decibels; convert to linear first and back at the end.
    pub db: bool,
    /// Stop as soon as the percent change starts growing.
    pub detect_divergence: bool,
}

impl Default for WplOptions {
    fn default() -> Self {
        WplOptions {
            gamma: 0.0,
            filter_x: 1.0,
            filter_y: 1.0,
            filter_z: 1.0,
            normalize: false,
            log_mean: false,
            anti_ring: true,
            change_thresh_percent: 0.01,
            db: false,
            detect_divergence: true,
        }
    }
}

pub(crate) fn deblur<T: Sample>(
    image: &Image<T>,
    psf_in: &Image<T>,
    config: &DeblurConfig,
    options: &WplOptions,
    mut monitor: Option<&mut dyn Monitor<T>>,
) -> Result<OutputImage, DeblurError> {
    let rank = image.rank();
    let b_dims = image.dims();
    let mut b = image.clone();
    let mut psf_src = psf_in.clone();
    if options.db {
        image::un_db(&mut b);
        image::un_db(&mut psf_src);
    }

    let psf_sum = psf_src.sum();
    let scale_psf = if psf_sum != T::zero() && options.normalize {
        T::one() / psf_sum
    } else {
        T::one()
    };

    let work_dims = psf::expanded_dims(psf_src.dims(), b_dims, rank, config.resizing);
    psf::check_psf_fits(psf_src.dims(), work_dims)?;
    let weights = spectral::gaussian_weights(
        work_dims,
        [options.filter_z, options.filter_y, options.filter_x],
    );

    let mut b = padding::pad(&b, config.boundary, work_dims);
    let mut psf = psf::center_on_grid(&psf_src, work_dims);
    let mut plan = HartleyPlan::new(work_dims);
    plan.forward(&mut psf);

    let mut ax = Image::zeros(work_dims, rank);
    if options.anti_ring {
        log::debug!("wpl: anti-ringing step");
        let mut x = b.clone();
        plan.forward(&mut x);
        spectral::convolve_fd(work_dims, psf.as_slice(), x.as_slice(), ax.as_mut_slice());
        plan.inverse(&mut ax);
        copy_data_average(b_dims, &mut b, &ax, psf_sum);
    }

    if options.gamma > GAMMA_EPS {
        log::debug!("wpl: Wiener pre-filter, gamma = {}", options.gamma);
        let gamma = <T as crate::Sample>::from_f64(options.gamma);
        let mag_max = spectral::find_mag_max(work_dims, psf.as_slice());
        plan.forward(&mut b);
        let original_psf = psf.clone();
        // regularize the PSF against itself, then B against the original PSF
        spectral::deconvolve_fd(
            gamma,
            mag_max,
            work_dims,
            original_psf.as_slice(),
            original_psf.as_slice(),
            psf.as_mut_slice(),
        );
        let b_spectrum = b.clone();
        spectral::deconvolve_fd(
            gamma,
            mag_max,
            work_dims,
            b_spectrum.as_slice(),
            original_psf.as_slice(),
            b.as_mut_slice(),
        );
        plan.inverse(&mut b);
    }

    let offsets = [
        center_offset(work_dims.slices, b_dims.slices),
        center_offset(work_dims.rows, b_dims.rows),
        center_offset(work_dims.cols, b_dims.cols),
    ];

    plan.inverse(&mut psf);
    let a_sum = psf.abs_sum();
    if scale_psf != T::one() {
        b.scale(T::one() / scale_psf);
    }
    plan.forward(&mut psf);

    let mut x = b.clone();
    let mut old_percent_change = f64::MAX;
    for iter in 0..config.max_iters {
        plan.forward(&mut x);
        spectral::gaussian_filter(work_dims, x.as_mut_slice(), &weights);
        spectral::convolve_fd(work_dims, psf.as_slice(), x.as_slice(), ax.as_mut_slice());
        plan.inverse(&mut ax);
        plan.inverse(&mut x);

        let mean_delta = update_estimate(&b, &ax, &mut x, a_sum);
        let sum_pixels = energy_sum(&x, b_dims, offsets);
        let percent_change = 100.0 * mean_delta.to_f64() / sum_pixels.to_f64();
        if options.log_mean {
            log::debug!("wpl iteration {}: percent change {percent_change}", iter + 1);
        }
        if let Some(m) = monitor.as_deref_mut() {
            let estimate = padding::crop(&x, b_dims, rank);
            m.iteration(IterationEvent {
                iteration: iter + 1,
                metric: percent_change,
                estimate: &estimate,
            });
        }
        if old_percent_change - percent_change < options.change_thresh_percent {
            log::info!("wpl: converged after {} iterations", iter + 1);
            break;
        }
        if options.detect_divergence && old_percent_change < percent_change {
            log::info!("wpl: terminated by divergence after {} iterations", iter + 1);
            break;
        }
        old_percent_change = percent_change;
    }

    plan.forward(&mut x);
    spectral::gaussian_filter_with_scaling(work_dims, x.as_mut_slice(), &weights, a_sum);
    plan.inverse(&mut x);
    if options.db {
        image::to_db(&mut x, MIN_DB);
    }
    let estimate = padding::crop(&x, b_dims, rank);
    Ok(method::finalize(estimate, config.threshold, config.output))
}

/// Blends the padded data with its blurred counterpart near the padding
/// boundary: the blend weight ramps linearly from 0 at the data region to
/// 1 at the outer edge of the half-pad width, suppressing wrap-around
/// discontinuities before the iteration starts.
fn copy_data_average<T: Sample>(src: Dims, b: &mut Image<T>, ax: &Image<T>, psf_sum: T) {
    let work = b.dims();
    let offs = [
        center_offset(work.slices, src.slices),
        center_offset(work.rows, src.rows),
        center_offset(work.cols, src.cols),
    ];
    let alpha = |p: usize, off: usize, n: usize| -> f64 {
        let rel = p as isize - off as isize;
        if rel < 0 {
            (-rel) as f64 / off as f64
        } else if rel > n as isize - 1 {
            (rel - n as isize) as f64 / off as f64
        } else {
            0.0
        }
    };
    let cols = work.cols;
    let ax_data = ax.as_slice();
    b.as_mut_slice()
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(row, b_row)| {
            let s = row / work.rows;
            let r = row % work.rows;
            let alpha_s = alpha(s, offs[0], src.slices);
            let alpha_r = alpha(r, offs[1], src.rows);
            let ax_row = &ax_data[row * cols..(row + 1) * cols];
            for (c, v) in b_row.iter_mut().enumerate() {
                let a = <T as crate::Sample>::from_f64(alpha_s.max(alpha_r).max(alpha(c, offs[2], src.cols)));
                *v = (T::one() - a) * *v + a * ax_row[c] / psf_sum;
            }
        });
}

/// Applies the clamped Landweber update `x += b - ax / a_sum` in place and
/// accumulates the convergence metric. A delta only contributes to the
/// metric when the updated sample stays nonnegative; clamped samples are
/// set to zero and excluded.
fn update_estimate<T: Sample>(b: &Image<T>, ax: &Image<T>, x: &mut Image<T>, a_sum: T) -> T {
    let cols = x.dims().cols;
    x.as_mut_slice()
        .par_chunks_mut(cols)
        .zip(b.as_slice().par_chunks(cols))
        .zip(ax.as_slice().par_chunks(cols))
        .map(|((x_row, b_row), ax_row)| {
            let mut local = T::zero();
            for ((xv, &bv), &axv) in x_row.iter_mut().zip(b_row).zip(ax_row) {
                let delta = bv - axv / a_sum;
                *xv = *xv + delta;
                if *xv < T::zero() {
                    *xv = T::zero();
                } else {
                    local = local + delta.abs();
                }
            }
            local
        })
        .sum()
}

/// Sum of the estimate over the interior region that maps back to the
/// source extent.
fn energy_sum<T: Sample>(x: &Image<T>, src: Dims, offsets: [usize; 3]) -> T {
    let work = x.dims();
    let data = x.as_slice();
    (0..src.slices * src.rows)
        .into_par_iter()
        .map(|row| -> T {
            let s = row / src.rows + offsets[0];
            let r = row % src.rows + offsets[1];
            let start = work.idx(s, r, offsets[2]);
            data[start..start + src.cols].iter().copied().sum()
        })
        .sum()
}
