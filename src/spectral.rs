//! Transform-domain kernels: circular convolution, Wiener-regularized
//! deconvolution, and separable Gaussian frequency weighting.
//!
//! All kernels operate on Hartley-transformed buffers. For a linear index
//! `i` the circular conjugate `i'` negates every axis index modulo its
//! length; splitting the second operand into parts even/odd under that
//! reversal realizes complex-domain multiplication with real arithmetic
//! only. `i` and `i'` coincide at self-conjugate indices, where the odd
//! part vanishes and the same formulas hold.

use crate::image::Dims;
use crate::tiles;
use crate::Sample;

/// Conjugate of a row: the (slice, row) pair reversed per axis.
#[inline]
fn conj_row(dims: &Dims, s: usize, r: usize) -> (usize, usize) {
    (
        (dims.slices - s) % dims.slices,
        (dims.rows - r) % dims.rows,
    )
}

#[inline]
fn split_row(dims: &Dims, row: usize) -> (usize, usize) {
    (row / dims.rows, row % dims.rows)
}

/// Circular convolution: `out[i] = h1[i]*h2e[i] + h1[i']*h2o[i]`.
///
/// By convention `h1` is the (transformed) kernel and `h2` the data; the
/// roles are interchangeable here, but not in [`convolve_transpose_fd`].
pub fn convolve_fd<T: Sample>(dims: Dims, h1: &[T], h2: &[T], out: &mut [T]) {
    let half = <T as crate::Sample>::from_f64(0.5);
    tiles::par_for_rows(out, dims.cols, move |row, out_row| {
        let (s, r) = split_row(&dims, row);
        let (s_c, r_c) = conj_row(&dims, s, r);
        for (c, o) in out_row.iter_mut().enumerate() {
            let c_c = (dims.cols - c) % dims.cols;
            let idx1 = dims.idx(s, r, c);
            let idx2 = dims.idx(s_c, r_c, c_c);
            let h2e = (h2[idx1] + h2[idx2]) * half;
            let h2o = (h2[idx1] - h2[idx2]) * half;
            *o = h1[idx1] * h2e + h1[idx2] * h2o;
        }
    });
}

/// Adjoint of [`convolve_fd`]: multiplication by the conjugate spectrum,
/// `out[i'] = h1[i]*h2e[i] - h1[i']*h2o[i]` with `h1` the kernel and `h2`
/// the data.
///
/// The write index is the conjugate, so the pass runs serially; the
/// conjugate map is a bijection and every output index is written once.
pub fn convolve_transpose_fd<T: Sample>(dims: Dims, h1: &[T], h2: &[T], out: &mut [T]) {
    let half = <T as crate::Sample>::from_f64(0.5);
    for s in 0..dims.slices {
        for r in 0..dims.rows {
            let (s_c, r_c) = conj_row(&dims, s, r);
            for c in 0..dims.cols {
                let c_c = (dims.cols - c) % dims.cols;
                let idx1 = dims.idx(s, r, c);
                let idx2 = dims.idx(s_c, r_c, c_c);
                let h2e = (h2[idx1] + h2[idx2]) * half;
                let h2o = (h2[idx1] - h2[idx2]) * half;
                out[idx2] = h1[idx1] * h2e - h1[idx2] * h2o;
            }
        }
    }
}

/// Largest spectral magnitude `h2[i]^2 + h2[i']^2` over the buffer.
pub fn find_mag_max<T: Sample>(dims: Dims, h2: &[T]) -> T {
    tiles::par_map_rows_reduce(
        h2,
        dims.cols,
        |row, row_data| {
            let (s, r) = split_row(&dims, row);
            let (s_c, r_c) = conj_row(&dims, s, r);
            let mut max = T::zero();
            for (c, &v) in row_data.iter().enumerate() {
                let c_c = (dims.cols - c) % dims.cols;
                let v_c = h2[dims.idx(s_c, r_c, c_c)];
                let mag = v * v + v_c * v_c;
                if mag > max {
                    max = mag;
                }
            }
            max
        },
        T::zero(),
        |a, b| if a > b { a } else { b },
    )
}

/// Wiener-regularized deconvolution with `h1` the data and `h2` the
/// kernel:
/// `out[i] = (h1[i]*h2e[i] - h1[i']*h2o[i]) / ((mag[i] + gamma * mag_max) / 2)`.
///
/// The `gamma * mag_max` floor bounds the inverse filter's gain where the
/// kernel spectrum vanishes. `mag[i] = h2[i]^2 + h2[i']^2` is twice the
/// squared complex magnitude; the halved denominator makes the filter an
/// exact inverse of [`convolve_fd`] at `gamma = 0`.
pub fn deconvolve_fd<T: Sample>(
    gamma: T,
    mag_max: T,
    dims: Dims,
    h1: &[T],
    h2: &[T],
    out: &mut [T],
) {
    let gamma_scaled = gamma * mag_max;
    let half = <T as crate::Sample>::from_f64(0.5);
    tiles::par_for_rows(out, dims.cols, move |row, out_row| {
        let (s, r) = split_row(&dims, row);
        let (s_c, r_c) = conj_row(&dims, s, r);
        for (c, o) in out_row.iter_mut().enumerate() {
            let c_c = (dims.cols - c) % dims.cols;
            let idx1 = dims.idx(s, r, c);
            let idx2 = dims.idx(s_c, r_c, c_c);
            let h2e = (h2[idx1] + h2[idx2]) * half;
            let h2o = (h2[idx1] - h2[idx2]) * half;
            let mag = h2[idx1] * h2[idx1] + h2[idx2] * h2[idx2];
            *o = (h1[idx1] * h2e - h1[idx2] * h2o) / ((mag + gamma_scaled) * half);
        }
    });
}

/// Per-axis Gaussian weight vectors over the working grid, `[z, y, x]`.
///
/// `w[k] = exp(-(k_folded / (n / (filter + 1e-6)))^2)` with the frequency
/// index folded at the Nyquist bin.
pub fn gaussian_weights<T: Sample>(dims: Dims, filters: [f64; 3]) -> [Vec<T>; 3] {
    let axis = |n: usize, filter: f64| -> Vec<T> {
        let scale = n as f64 / (filter + 1e-6);
        (0..n)
            .map(|k| {
                let folded = if k > n / 2 { n - k } else { k };
                let t = folded as f64 / scale;
                <T as crate::Sample>::from_f64((-t * t).exp())
            })
            .collect()
    };
    [
        axis(dims.slices, filters[0]),
        axis(dims.rows, filters[1]),
        axis(dims.cols, filters[2]),
    ]
}

/// Multiplies a transformed buffer by the separable weight outer product.
pub fn gaussian_filter<T: Sample>(dims: Dims, x: &mut [T], weights: &[Vec<T>; 3]) {
    tiles::par_for_rows(x, dims.cols, |row, row_data| {
        let (s, r) = split_row(&dims, row);
        let w_row = weights[0][s] * weights[1][r];
        for (c, v) in row_data.iter_mut().enumerate() {
            *v = *v * w_row * weights[2][c];
        }
    });
}

/// Like [`gaussian_filter`], additionally dividing by `scale` in the same
/// pass (saving a second full traversal for the final normalization).
pub fn gaussian_filter_with_scaling<T: Sample>(
    dims: Dims,
    x: &mut [T],
    weights: &[Vec<T>; 3],
    scale: T,
) {
    tiles::par_for_rows(x, dims.cols, move |row, row_data| {
        let (s, r) = split_row(&dims, row);
        let w_row = weights[0][s] * weights[1][r];
        for (c, v) in row_data.iter_mut().enumerate() {
            *v = *v * w_row * weights[2][c] / scale;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hartley::HartleyPlan;
    use crate::image::Image;
    use approx::assert_abs_diff_eq;

    fn transformed(dims: Dims, fill: impl Fn(usize) -> f64) -> Image<f64> {
        let mut img = Image::zeros(dims, 3);
        for (i, v) in img.as_mut_slice().iter_mut().enumerate() {
            *v = fill(i);
        }
        let mut plan = HartleyPlan::new(dims);
        let mut out = img;
        plan.forward(&mut out);
        out
    }

    #[test]
    fn convolving_with_unit_impulse_is_identity() {
        let dims = Dims::new(1, 4, 6);
        let h1 = transformed(dims, |i| (i as f64 * 0.7).cos());
        // impulse at the origin transforms to an all-ones spectrum
        let mut impulse = Image::zeros(dims, 3);
        impulse.set(0, 0, 0, 1.0);
        let mut plan = HartleyPlan::new(dims);
        plan.forward(&mut impulse);

        let mut out = Image::zeros(dims, 3);
        convolve_fd(dims, impulse.as_slice(), h1.as_slice(), out.as_mut_slice());
        for (got, want) in out.as_slice().iter().zip(h1.as_slice()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn deconvolve_inverts_convolve_for_nonvanishing_spectrum() {
        let dims = Dims::new(1, 4, 4);
        let x = transformed(dims, |i| 1.0 + (i as f64 * 0.31).sin());
        // a near-delta kernel has no spectral zeros
        let mut kernel = Image::zeros(dims, 3);
        kernel.set(0, 0, 0, 1.0);
        kernel.set(0, 0, 1, 0.1);
        kernel.set(0, 1, 0, 0.1);
        let mut plan = HartleyPlan::new(dims);
        plan.forward(&mut kernel);

        let mut blurred = Image::zeros(dims, 3);
        convolve_fd(dims, kernel.as_slice(), x.as_slice(), blurred.as_mut_slice());
        let mag_max = find_mag_max(dims, kernel.as_slice());
        let mut recovered = Image::zeros(dims, 3);
        deconvolve_fd(
            1e-12,
            mag_max,
            dims,
            blurred.as_slice(),
            kernel.as_slice(),
            recovered.as_mut_slice(),
        );
        for (got, want) in recovered.as_slice().iter().zip(x.as_slice()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn transpose_convolution_agrees_on_symmetric_kernels() {
        // a kernel even under index reversal has zero odd part, so the
        // forward and adjoint convolutions coincide
        let dims = Dims::new(1, 4, 4);
        let x = transformed(dims, |i| (i as f64 * 0.13).cos());
        let mut kernel = Image::zeros(dims, 3);
        kernel.set(0, 0, 0, 0.5);
        kernel.set(0, 0, 1, 0.25);
        kernel.set(0, 0, 3, 0.25);
        let mut plan = HartleyPlan::new(dims);
        plan.forward(&mut kernel);

        let mut forward = Image::zeros(dims, 3);
        let mut adjoint = Image::zeros(dims, 3);
        convolve_fd(dims, kernel.as_slice(), x.as_slice(), forward.as_mut_slice());
        convolve_transpose_fd(dims, kernel.as_slice(), x.as_slice(), adjoint.as_mut_slice());
        for (a, b) in forward.as_slice().iter().zip(adjoint.as_slice()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn gaussian_weights_fold_at_nyquist() {
        let dims = Dims::new(1, 1, 8);
        let [_, _, wx] = gaussian_weights::<f64>(dims, [1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(wx[0], 1.0, epsilon = 1e-12);
        // folded: w[k] == w[n - k]
        for k in 1..8 {
            assert_abs_diff_eq!(wx[k], wx[8 - k], epsilon = 1e-12);
        }
        // monotone decrease towards the Nyquist bin
        assert!(wx[0] > wx[1] && wx[1] > wx[2] && wx[2] > wx[3] && wx[3] > wx[4]);
    }

    #[test]
    fn filter_with_scaling_matches_filter_then_divide() {
        let dims = Dims::new(1, 3, 5);
        let weights = gaussian_weights::<f64>(dims, [2.0, 2.0, 2.0]);
        let base = transformed(dims, |i| i as f64 + 1.0);

        let mut a = base.clone();
        gaussian_filter(dims, a.as_mut_slice(), &weights);
        a.scale(1.0 / 3.0);

        let mut b = base;
        gaussian_filter_with_scaling(dims, b.as_mut_slice(), &weights, 3.0);
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }
}
