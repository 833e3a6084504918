//! Circulant (FFT) preconditioning for the least-squares solvers.
//!
//! The preconditioner approximates the blur by a circulant operator on
//! the working grid and applies its masked inverse in the Hartley domain:
//! spectral components with magnitude below the tolerance are left
//! untouched (identity) instead of amplified. With `tol = -1` the
//! tolerance is picked by a generalized-cross-validation heuristic over
//! the sorted spectral magnitudes.

use crate::hartley::HartleyPlan;
use crate::image::{Dims, Image};
use crate::padding::{self, Boundary};
use crate::psf::PsfOperator;
use crate::spectral;
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Preconditioner selection for CGLS, MRNSD and HyBR.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Preconditioner {
    #[default]
    None,
    /// Circulant approximation of the blur; `tol = -1.0` chooses the
    /// truncation tolerance by generalized cross-validation.
    Fft { tol: f64 },
}

/// The masked circulant inverse `M^{-1}` (and its transpose), expressed as
/// a Hartley-domain kernel over the working grid.
pub(crate) struct FftPreconditioner<T: Sample> {
    kernel: Image<T>,
    plan: HartleyPlan<T>,
    boundary: Boundary,
    image_dims: Dims,
    work_dims: Dims,
    rank: usize,
}

impl<T: Sample> FftPreconditioner<T> {
    pub fn new(op: &PsfOperator<T>, b: &Image<T>, tol: f64) -> Self {
        let work_dims = op.work_dims();
        let rank = b.rank();
        let boundary = op.boundary();
        let h = op.psf_spectrum().as_slice();

        // complex spectral magnitude per index
        let half = <T as crate::Sample>::from_f64(0.5);
        let magnitude = |i: usize| -> T {
            let j = conj_index(work_dims, i);
            ((h[i] * h[i] + h[j] * h[j]) * half).sqrt()
        };
        let e: Vec<T> = (0..work_dims.len()).map(magnitude).collect();
        let max_e = e.iter().copied().fold(T::zero(), T::max);
        let min_e = e.iter().copied().fold(T::infinity(), T::min);

        let mut plan = HartleyPlan::new(work_dims);
        let tol = if tol == -1.0 {
            if (max_e / min_e).to_f64() < 100.0 {
                T::zero()
            } else {
                let mut b_pad = padding::pad(b, boundary, work_dims);
                plan.forward(&mut b_pad);
                let gcv_tol = default_tol(work_dims, &e, b_pad.as_slice());
                log::debug!(
                    "fft preconditioner: gcv-selected tolerance {}",
                    gcv_tol.to_f64()
                );
                gcv_tol
            }
        } else {
            <T as crate::Sample>::from_f64(tol)
        };

        // Hartley coefficients of the masked inverse filter: for a kept
        // component 1/F has Hartley value 2*h[i'] / (h[i]^2 + h[i']^2),
        // a dropped component passes through unchanged.
        let mut kernel = Image::zeros(work_dims, rank);
        for i in 0..work_dims.len() {
            let j = conj_index(work_dims, i);
            let v = if e[i] >= tol {
                <T as crate::Sample>::from_f64(2.0) * h[j] / (h[i] * h[i] + h[j] * h[j])
            } else {
                T::one()
            };
            kernel.as_mut_slice()[i] = v;
        }

        FftPreconditioner {
            kernel,
            plan,
            boundary,
            image_dims: b.dims(),
            work_dims,
            rank,
        }
    }

    /// Applies `M^{-1}` (or `M^{-T}`) to an image-extent buffer.
    pub fn solve(&mut self, x: &Image<T>, transpose: bool) -> Image<T> {
        let mut padded = padding::pad(x, self.boundary, self.work_dims);
        self.plan.forward(&mut padded);
        let mut out = Image::zeros(self.work_dims, self.rank);
        if transpose {
            spectral::convolve_transpose_fd(
                self.work_dims,
                self.kernel.as_slice(),
                padded.as_slice(),
                out.as_mut_slice(),
            );
        } else {
            spectral::convolve_fd(
                self.work_dims,
                self.kernel.as_slice(),
                padded.as_slice(),
                out.as_mut_slice(),
            );
        }
        self.plan.inverse(&mut out);
        padding::crop(&out, self.image_dims, self.rank)
    }
}

#[inline]
fn conj_index(dims: Dims, i: usize) -> usize {
    let c = i % dims.cols;
    let r = (i / dims.cols) % dims.rows;
    let s = i / (dims.cols * dims.rows);
    dims.idx(
        (dims.slices - s) % dims.slices,
        (dims.rows - r) % dims.rows,
        (dims.cols - c) % dims.cols,
    )
}

/// Generalized-cross-validation choice of the truncation tolerance.
///
/// Spectral magnitudes are sorted in decreasing order, the data spectrum
/// is accumulated from the tail, and the magnitude minimizing the GCV
/// functional becomes the tolerance.
fn default_tol<T: Sample>(dims: Dims, e: &[T], b_hartley: &[T]) -> T {
    let n = e.len();
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| e[b].partial_cmp(&e[a]).unwrap_or(std::cmp::Ordering::Equal));

    let half = <T as crate::Sample>::from_f64(0.5);
    let sqrt_n = <T as crate::Sample>::from_f64(n as f64).sqrt();
    let bhat: Vec<T> = indices
        .iter()
        .map(|&i| {
            let j = conj_index(dims, i);
            ((b_hartley[i] * b_hartley[i] + b_hartley[j] * b_hartley[j]) * half).sqrt() / sqrt_n
        })
        .collect();

    let mut rho = vec![T::zero(); n - 1];
    let mut g = vec![T::zero(); n - 1];
    rho[n - 2] = bhat[n - 1] * bhat[n - 1];
    g[n - 2] = rho[n - 2];
    for k in (1..n - 1).rev() {
        rho[k - 1] = rho[k] + bhat[k] * bhat[k];
        let m = <T as crate::Sample>::from_f64(((n - k) * (n - k)) as f64);
        g[k - 1] = rho[k - 1] / m;
    }
    for k in 0..n.saturating_sub(3) {
        if e[indices[k]] == e[indices[k + 1]] {
            g[k] = T::infinity();
        }
    }
    let mut best = 0;
    for k in 1..g.len() {
        if g[k] < g[best] {
            best = k;
        }
    }
    e[indices[best]]
}

/// The blur operator with optional left preconditioning: the solvers see
/// `M^{-1} A` and `M^{-1} b` instead of `A` and `b`.
pub(crate) struct BlurOp<T: Sample> {
    op: PsfOperator<T>,
    prec: Option<FftPreconditioner<T>>,
}

impl<T: Sample> BlurOp<T> {
    pub fn new(op: PsfOperator<T>, precond: Preconditioner, b: &Image<T>) -> Self {
        let prec = match precond {
            Preconditioner::None => None,
            Preconditioner::Fft { tol } => Some(FftPreconditioner::new(&op, b, tol)),
        };
        BlurOp { op, prec }
    }

    /// `M^{-1} A x`.
    pub fn forward(&mut self, x: &Image<T>) -> Image<T> {
        let y = self.op.apply(x);
        match self.prec.as_mut() {
            Some(p) => p.solve(&y, false),
            None => y,
        }
    }

    /// `A^T M^{-T} y`.
    pub fn adjoint(&mut self, y: &Image<T>) -> Image<T> {
        match self.prec.as_mut() {
            Some(p) => {
                let z = p.solve(y, true);
                self.op.apply_adjoint(&z)
            }
            None => self.op.apply_adjoint(y),
        }
    }

    /// `M^{-1} b`, the right-hand side the solvers iterate against.
    pub fn rhs(&mut self, b: &Image<T>) -> Image<T> {
        match self.prec.as_mut() {
            Some(p) => p.solve(b, false),
            None => b.clone(),
        }
    }
}
