//! Multidimensional Hartley transform.
//!
//! The iteration stays real-valued by working with Hartley coefficients
//! `H(k) = Re F(k) - Im F(k)` of the multidimensional DFT `F`. The
//! transform is its own inverse up to a `1/len` scale, and circular
//! convolution becomes the even/odd identity implemented in
//! [`crate::spectral`].
//!
//! FFT plans and the complex scratch buffer are cached per working-grid
//! shape; one plan instance serves every transform of a deblur run.

use crate::image::{Dims, Image};
use crate::Sample;
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

/// Cached FFT plans and scratch for one working-grid shape.
pub struct HartleyPlan<T: Sample> {
    dims: Dims,
    fft_x: Arc<dyn Fft<T>>,
    fft_y: Arc<dyn Fft<T>>,
    fft_z: Arc<dyn Fft<T>>,
    buf: Vec<Complex<T>>,
}

impl<T: Sample> HartleyPlan<T> {
    pub fn new(dims: Dims) -> Self {
        let mut planner = FftPlanner::new();
        let fft_x = planner.plan_fft(dims.cols, FftDirection::Forward);
        let fft_y = planner.plan_fft(dims.rows, FftDirection::Forward);
        let fft_z = planner.plan_fft(dims.slices, FftDirection::Forward);
        HartleyPlan {
            dims,
            fft_x,
            fft_y,
            fft_z,
            buf: vec![Complex::new(T::zero(), T::zero()); dims.len()],
        }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// In-place forward Hartley transform.
    pub fn forward(&mut self, x: &mut Image<T>) {
        debug_assert_eq!(x.dims(), self.dims);
        self.transform(x.as_mut_slice(), None);
    }

    /// In-place inverse Hartley transform (forward transform scaled by
    /// `1/len`).
    pub fn inverse(&mut self, x: &mut Image<T>) {
        debug_assert_eq!(x.dims(), self.dims);
        let scale = T::one() / <T as crate::Sample>::from_f64(self.dims.len() as f64);
        self.transform(x.as_mut_slice(), Some(scale));
    }

    fn transform(&mut self, data: &mut [T], scale: Option<T>) {
        let Dims { slices, rows, cols } = self.dims;
        for (c, &v) in self.buf.iter_mut().zip(data.iter()) {
            *c = Complex::new(v, T::zero());
        }

        // x axis: contiguous lines, one rayon task per line
        let fft_x = &self.fft_x;
        self.buf
            .par_chunks_mut(cols)
            .for_each_init(
                || vec![Complex::new(T::zero(), T::zero()); fft_x.get_inplace_scratch_len()],
                |scratch, line| fft_x.process_with_scratch(line, scratch),
            );

        // y axis: gather/scatter strided lines, one rayon task per slice
        if rows > 1 {
            let fft_y = &self.fft_y;
            self.buf
                .par_chunks_mut(rows * cols)
                .for_each_init(
                    || {
                        (
                            vec![Complex::new(T::zero(), T::zero()); rows],
                            vec![
                                Complex::new(T::zero(), T::zero());
                                fft_y.get_inplace_scratch_len()
                            ],
                        )
                    },
                    |(line, scratch), plane| {
                        for c in 0..cols {
                            for r in 0..rows {
                                line[r] = plane[r * cols + c];
                            }
                            fft_y.process_with_scratch(line, scratch);
                            for r in 0..rows {
                                plane[r * cols + c] = line[r];
                            }
                        }
                    },
                );
        }

        // z axis: lines stride a whole plane, gathered serially
        if slices > 1 {
            let mut line = vec![Complex::new(T::zero(), T::zero()); slices];
            let mut scratch =
                vec![Complex::new(T::zero(), T::zero()); self.fft_z.get_inplace_scratch_len()];
            let plane = rows * cols;
            for r in 0..rows {
                for c in 0..cols {
                    let base = r * cols + c;
                    for s in 0..slices {
                        line[s] = self.buf[s * plane + base];
                    }
                    self.fft_z.process_with_scratch(&mut line, &mut scratch);
                    for s in 0..slices {
                        self.buf[s * plane + base] = line[s];
                    }
                }
            }
        }

        match scale {
            Some(k) => {
                for (v, c) in data.iter_mut().zip(self.buf.iter()) {
                    *v = (c.re - c.im) * k;
                }
            }
            None => {
                for (v, c) in data.iter_mut().zip(self.buf.iter()) {
                    *v = c.re - c.im;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn forward_then_inverse_roundtrips() {
        let dims = Dims::new(2, 4, 6);
        let mut plan = HartleyPlan::<f64>::new(dims);
        let mut img = Image::zeros(dims, 3);
        for (i, v) in img.as_mut_slice().iter_mut().enumerate() {
            *v = (i as f64 * 0.37).sin() + 0.1 * i as f64;
        }
        let original = img.clone();
        plan.forward(&mut img);
        plan.inverse(&mut img);
        for (got, want) in img.as_slice().iter().zip(original.as_slice()) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-9);
        }
    }

    #[test]
    fn impulse_at_origin_has_flat_spectrum() {
        let dims = Dims::new(1, 4, 4);
        let mut plan = HartleyPlan::<f64>::new(dims);
        let mut img = Image::zeros(dims, 2);
        img.set(0, 0, 0, 1.0);
        plan.forward(&mut img);
        for v in img.as_slice() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_input_concentrates_at_dc() {
        let dims = Dims::new(1, 4, 4);
        let mut plan = HartleyPlan::<f32>::new(dims);
        let mut img = Image::zeros(dims, 2);
        for v in img.as_mut_slice() {
            *v = 1.0;
        }
        plan.forward(&mut img);
        assert_abs_diff_eq!(img.get(0, 0, 0), 16.0, epsilon = 1e-4);
        for i in 1..dims.len() {
            assert_abs_diff_eq!(img.as_slice()[i], 0.0, epsilon = 1e-4);
        }
    }
}
