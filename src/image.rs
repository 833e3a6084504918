//! Dense 2D/3D sample buffers and output conversion.
//!
//! Every buffer in the engine is a contiguous, row-major block of samples
//! with explicit `slices x rows x cols` dimensions. 2D images are carried
//! with `slices == 1` so each kernel exists only once; the source rank is
//! remembered and restored on output.

use crate::error::DeblurError;
use crate::Sample;
use ndarray::{ArrayD, ArrayView2, ArrayView3, IxDyn};

/// Dimensions of a buffer, one entry per axis.
///
/// Invariant: `len() == slices * rows * cols`, row-major layout with the
/// column index fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dims {
    pub slices: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Dims {
    pub fn new(slices: usize, rows: usize, cols: usize) -> Self {
        Dims { slices, rows, cols }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slices * self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of `(slice, row, col)`.
    #[inline]
    pub fn idx(&self, s: usize, r: usize, c: usize) -> usize {
        (s * self.rows + r) * self.cols + c
    }
}

/// An owned image (or PSF) buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    data: Vec<T>,
    dims: Dims,
    rank: usize,
}

impl<T: Sample> Image<T> {
    /// Zero-filled buffer of the given dimensions.
    pub fn zeros(dims: Dims, rank: usize) -> Self {
        Image {
            data: vec![T::zero(); dims.len()],
            dims,
            rank,
        }
    }

    pub fn from_2d(view: ArrayView2<'_, T>) -> Self {
        let (rows, cols) = view.dim();
        Image {
            data: view.iter().copied().collect(),
            dims: Dims::new(1, rows, cols),
            rank: 2,
        }
    }

    pub fn from_3d(view: ArrayView3<'_, T>) -> Self {
        let (slices, rows, cols) = view.dim();
        Image {
            data: view.iter().copied().collect(),
            dims: Dims::new(slices, rows, cols),
            rank: 3,
        }
    }

    /// Accepts a dynamic-rank array of rank 2 or 3.
    pub fn from_dyn(array: &ArrayD<T>) -> Result<Self, DeblurError> {
        match array.ndim() {
            2 => {
                let view = array.view().into_dimensionality().expect("rank checked");
                Ok(Self::from_2d(view))
            }
            3 => {
                let view = array.view().into_dimensionality().expect("rank checked");
                Ok(Self::from_3d(view))
            }
            n => Err(DeblurError::BadOption(format!(
                "unsupported rank {n}, expected 2 or 3"
            ))),
        }
    }

    #[inline]
    pub fn dims(&self) -> Dims {
        self.dims
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, s: usize, r: usize, c: usize) -> T {
        self.data[self.dims.idx(s, r, c)]
    }

    #[inline]
    pub fn set(&mut self, s: usize, r: usize, c: usize, v: T) {
        let i = self.dims.idx(s, r, c);
        self.data[i] = v;
    }

    /// Sum of all samples.
    pub fn sum(&self) -> T {
        crate::tiles::par_map_rows_sum(&self.data, self.dims.cols.max(1), |_, row| {
            row.iter().copied().sum::<T>()
        })
    }

    /// Sum of absolute values of all samples.
    pub fn abs_sum(&self) -> T {
        crate::tiles::par_map_rows_sum(&self.data, self.dims.cols.max(1), |_, row| {
            row.iter().map(|v| v.abs()).sum::<T>()
        })
    }

    /// Smallest sample value.
    pub fn min_value(&self) -> T {
        self.data
            .iter()
            .copied()
            .fold(T::infinity(), |a, v| if v < a { v } else { a })
    }

    /// Euclidean norm, treating the buffer as a flat vector.
    pub fn norm2(&self) -> T {
        self.data.iter().map(|&v| v * v).sum::<T>().sqrt()
    }

    /// Inner product with another buffer of the same extent.
    pub fn dot(&self, other: &Image<T>) -> T {
        debug_assert_eq!(self.dims, other.dims);
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| a * b)
            .sum()
    }

    /// `self += alpha * other`, elementwise.
    pub fn axpy(&mut self, alpha: T, other: &Image<T>) {
        debug_assert_eq!(self.dims, other.dims);
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = *a + alpha * b;
        }
    }

    /// Multiplies every sample by `factor`.
    pub fn scale(&mut self, factor: T) {
        for v in self.data.iter_mut() {
            *v = *v * factor;
        }
    }

    /// Adds `offset` to every sample.
    pub fn shift(&mut self, offset: T) {
        for v in self.data.iter_mut() {
            *v = *v + offset;
        }
    }

    /// Converts to a dynamic-rank ndarray of the remembered source rank.
    pub fn to_dyn(&self) -> ArrayD<T> {
        let shape = self.shape_vec();
        ArrayD::from_shape_vec(IxDyn(&shape), self.data.clone()).expect("shape matches data length")
    }

    fn shape_vec(&self) -> Vec<usize> {
        if self.rank == 2 {
            vec![self.dims.rows, self.dims.cols]
        } else {
            vec![self.dims.slices, self.dims.rows, self.dims.cols]
        }
    }

    /// Zeroes every sample below `threshold`; the `-1.0` sentinel disables
    /// thresholding. Applying the same threshold twice is a no-op.
    pub fn apply_threshold(&mut self, threshold: f64) {
        if threshold == -1.0 {
            return;
        }
        let t = <T as crate::Sample>::from_f64(threshold);
        for v in self.data.iter_mut() {
            if *v < t {
                *v = T::zero();
            }
        }
    }

    /// Converts the finished estimate into the requested numeric kind,
    /// rounding and clamping for the integer kinds.
    pub fn into_output(self, output: OutputKind) -> OutputImage {
        let shape = self.shape_vec();
        match output {
            OutputKind::SameAsSource => {
                T::wrap_native(
                    ArrayD::from_shape_vec(IxDyn(&shape), self.data)
                        .expect("shape matches data length"),
                )
            }
            OutputKind::Byte => {
                let data = self
                    .data
                    .iter()
                    .map(|v| Sample::to_f64(*v).round().clamp(0.0, 255.0) as u8)
                    .collect();
                OutputImage::Byte(
                    ArrayD::from_shape_vec(IxDyn(&shape), data).expect("shape matches data length"),
                )
            }
            OutputKind::Short => {
                let data = self
                    .data
                    .iter()
                    .map(|v| Sample::to_f64(*v).round().clamp(0.0, 65535.0) as u16)
                    .collect();
                OutputImage::Short(
                    ArrayD::from_shape_vec(IxDyn(&shape), data).expect("shape matches data length"),
                )
            }
            OutputKind::Float => {
                let data = self.data.iter().map(|v| Sample::to_f64(*v) as f32).collect();
                OutputImage::Float(
                    ArrayD::from_shape_vec(IxDyn(&shape), data).expect("shape matches data length"),
                )
            }
        }
    }
}

/// Numeric kind of the returned image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OutputKind {
    /// Same floating precision as the input samples.
    SameAsSource,
    /// 8-bit unsigned, rounded and clamped.
    Byte,
    /// 16-bit unsigned, rounded and clamped.
    Short,
    /// 32-bit float.
    Float,
}

/// The restored image, in the numeric kind requested by the caller.
///
/// The rank and extent always match the blurred input image.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputImage {
    Byte(ArrayD<u8>),
    Short(ArrayD<u16>),
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
}

/// `10 / ln 10`, the scale of the decibel representation.
fn db_scale<T: Sample>() -> T {
    <T as crate::Sample>::from_f64(10.0) / <T as crate::Sample>::from_f64(10.0f64.ln())
}

/// Converts a linear-valued buffer to decibels in place, flooring
/// non-positive and tiny values at `min_db`.
pub fn to_db<T: Sample>(x: &mut Image<T>, min_db: f64) {
    let scale = db_scale::<T>();
    let min_db = <T as crate::Sample>::from_f64(min_db);
    let min_val = (min_db / scale).exp();
    for v in x.as_mut_slice() {
        if *v > min_val {
            *v = scale * v.ln();
        } else {
            *v = min_db;
        }
    }
}

/// Converts a dB-valued buffer back to linear in place and returns the
/// smallest dB value seen, so the conversion can be undone.
pub fn un_db<T: Sample>(x: &mut Image<T>) -> T {
    let scale = db_scale::<T>();
    let mut min = T::infinity();
    for v in x.as_mut_slice() {
        if *v < min {
            min = *v;
        }
        *v = (*v / scale).exp();
    }
    min
}
