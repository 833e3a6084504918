//! Hybrid bidiagonalization regularization.
//!
//! Lanczos bidiagonalization projects the blur operator onto a small
//! bidiagonal system that is solved with Tikhonov regularization each
//! iteration; the regularization parameter is picked per iteration by
//! (weighted) generalized cross-validation, and a GCV series over the
//! iterations decides when to stop. Regularizing only from `beg_reg`
//! onwards avoids over-fitting the earliest, low-rank projections.

use crate::error::DeblurError;
use crate::image::{Image, OutputImage};
use crate::method::precond::{BlurOp, Preconditioner};
use crate::method::{self, DeblurConfig, IterationEvent, Monitor};
use crate::psf::PsfOperator;
use crate::Sample;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// How the Tikhonov parameter of the projected problem is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegMethod {
    /// Generalized cross-validation.
    Gcv,
    /// Weighted GCV with a fixed weight.
    Wgcv,
    /// Weighted GCV with the weight adapted from the projected systems.
    AdaptWgcv,
    /// Fixed parameter, taken from `reg_par`.
    Fixed,
}

/// Options of the HyBR method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybrOptions {
    pub reg_method: RegMethod,
    /// Regularization parameter for [`RegMethod::Fixed`].
    pub reg_par: f64,
    /// GCV weight for [`RegMethod::Wgcv`].
    pub omega: f64,
    /// Fully reorthogonalize the Lanczos bases each step.
    pub reorth: bool,
    /// First iteration at which regularization starts.
    pub beg_reg: usize,
    /// Relative flatness of the GCV series that stops the iteration.
    pub flat_tol: f64,
    pub preconditioner: Preconditioner,
}

impl Default for HybrOptions {
    fn default() -> Self {
        HybrOptions {
            reg_method: RegMethod::AdaptWgcv,
            reg_par: -1.0,
            omega: 0.0,
            reorth: false,
            beg_reg: 2,
            flat_tol: 1e-6,
            preconditioner: Preconditioner::None,
        }
    }
}

pub(crate) fn deblur<T: Sample>(
    image: &Image<T>,
    psf: &Image<T>,
    config: &DeblurConfig,
    options: &HybrOptions,
    mut monitor: Option<&mut dyn Monitor<T>>,
) -> Result<OutputImage, DeblurError> {
    if options.beg_reg < 2 {
        return Err(DeblurError::BadOption(
            "beg_reg must be at least 2".into(),
        ));
    }
    let op = PsfOperator::new(
        psf,
        config.boundary,
        config.resizing,
        image.dims(),
        image.rank(),
    )?;
    let mut a = BlurOp::new(op, options.preconditioner, image);
    let n_total = image.dims().len();

    let b = a.rhs(image);
    let beta0 = b.norm2();
    let mut u0 = b;
    u0.scale(T::one() / beta0);

    let mut u_basis: Vec<Image<T>> = vec![u0];
    let mut v_basis: Vec<Image<T>> = Vec::new();
    let mut alphas: Vec<T> = Vec::new();
    let mut betas: Vec<T> = Vec::new();

    let mut omega_sum = 0.0f64;
    let mut omega_count = 0usize;
    let mut gcv: Vec<f64> = vec![0.0; options.beg_reg];
    let mut warning = false;
    let mut iterations_save = 0usize;
    let mut x_save: Option<Image<T>> = None;
    let mut x_last: Option<Image<T>> = None;

    let tiny = T::epsilon();
    for i in 0..=config.max_iters {
        // one Lanczos bidiagonalization step
        let k = v_basis.len();
        let mut v = a.adjoint(&u_basis[k]);
        if k > 0 {
            v.axpy(-betas[k - 1], &v_basis[k - 1]);
        }
        if options.reorth {
            for vj in &v_basis {
                let c = v.dot(vj);
                v.axpy(-c, vj);
            }
        }
        let alpha = v.norm2();
        if !(alpha > tiny) {
            // the operator annihilated the residual direction
            log::info!("hybr: bidiagonalization broke down after {i} iterations");
            let x_out = x_last.unwrap_or_else(|| Image::zeros(image.dims(), image.rank()));
            return Ok(method::finalize(x_out, config.threshold, config.output));
        }
        v.scale(T::one() / alpha);
        let mut u_next = a.forward(&v);
        u_next.axpy(-alpha, &u_basis[k]);
        if options.reorth {
            for uj in &u_basis {
                let c = u_next.dot(uj);
                u_next.axpy(-c, uj);
            }
        }
        let beta = u_next.norm2();
        // beta near zero means the Krylov space is exhausted; solve once
        // more on the completed basis and stop
        let breakdown = !(beta > tiny);
        if !breakdown {
            u_next.scale(T::one() / beta);
        }
        alphas.push(alpha);
        betas.push(beta);
        v_basis.push(v);
        u_basis.push(u_next);

        if breakdown {
            let f = projected_solve(&alphas, &betas, beta0);
            let x = assemble(&v_basis, &f);
            log::info!("hybr: krylov space exhausted after {i} iterations");
            return Ok(method::finalize(x, config.threshold, config.output));
        }

        if i == 0 {
            continue;
        }

        if i < options.beg_reg - 1 {
            // not yet regularizing; keep an unregularized projected solve
            let f = projected_solve(&alphas, &betas, beta0);
            x_last = Some(assemble(&v_basis, &f));
            continue;
        }

        let bidiag = bidiagonal(&alphas, &betas);
        let (ub, sv, vb) = svd_full(&bidiag);
        let bhat: Vec<T> = ub.row(0).iter().map(|&u| u * beta0).collect();

        let omega = match options.reg_method {
            RegMethod::AdaptWgcv => {
                let candidate = find_omega(&bhat, &sv).to_f64().min(1.0);
                omega_sum += candidate;
                omega_count += 1;
                omega_sum / omega_count as f64
            }
            RegMethod::Wgcv => options.omega,
            RegMethod::Gcv => 1.0,
            RegMethod::Fixed => 1.0,
        };
        let (f, alpha_reg) = tikhonov_solve(&ub, &sv, &vb, beta0, omega, options.reg_method, options.reg_par);
        let x = assemble(&v_basis, &f);

        gcv.push(gcv_stop(alpha_reg, &bhat, &sv, beta0, n_total).to_f64());
        log::debug!(
            "hybr iteration {i}: reg parameter {}, gcv {}",
            alpha_reg.to_f64(),
            gcv[gcv.len() - 1]
        );
        if let Some(m) = monitor.as_deref_mut() {
            m.iteration(IterationEvent {
                iteration: i,
                metric: gcv[gcv.len() - 1],
                estimate: &x,
            });
        }

        if i > 1 {
            if (gcv[i] - gcv[i - 1]).abs() / gcv[options.beg_reg] < options.flat_tol {
                log::info!("hybr: gcv series flattened after {i} iterations");
                return Ok(method::finalize(x, config.threshold, config.output));
            } else if warning && gcv.len() > iterations_save + 3 {
                let bump = (iterations_save..gcv.len() - 1)
                    .any(|j| gcv[iterations_save] > gcv[j + 1]);
                if !bump {
                    log::info!(
                        "hybr: gcv increased, restoring iteration {iterations_save}"
                    );
                    let restored = x_save.take().unwrap_or(x);
                    return Ok(method::finalize(restored, config.threshold, config.output));
                }
                warning = false;
                x_save = None;
                iterations_save = config.max_iters;
            } else if !warning && gcv[i - 1] < gcv[i] {
                warning = true;
                x_save = Some(x.clone());
                iterations_save = i;
            }
        }
        x_last = Some(x);
    }

    log::info!("hybr: reached the iteration limit");
    let x_out = x_last.unwrap_or_else(|| Image::zeros(image.dims(), image.rank()));
    Ok(method::finalize(x_out, config.threshold, config.output))
}

/// The `(k+1) x k` lower-bidiagonal projection of the operator.
fn bidiagonal<T: Sample>(alphas: &[T], betas: &[T]) -> Array2<T> {
    let k = alphas.len();
    let mut b = Array2::zeros((k + 1, k));
    for j in 0..k {
        b[[j, j]] = alphas[j];
        b[[j + 1, j]] = betas[j];
    }
    b
}

/// Unregularized least-squares solve of the projected bidiagonal system;
/// used before regularization begins and on Krylov breakdown.
fn projected_solve<T: Sample>(alphas: &[T], betas: &[T], beta0: T) -> Array1<T> {
    let b = bidiagonal(alphas, betas);
    let (ub, sv, vb) = svd_full(&b);
    let bhat: Vec<T> = ub.row(0).iter().map(|&u| u * beta0).collect();
    let k = sv.len();
    let mut coeffs = Array1::zeros(k);
    for j in 0..k {
        if sv[j] > T::epsilon() {
            coeffs[j] = bhat[j] / sv[j];
        }
    }
    vb.dot(&coeffs)
}

/// Combines the Lanczos solution basis with the projected coefficients.
fn assemble<T: Sample>(v_basis: &[Image<T>], f: &Array1<T>) -> Image<T> {
    let mut x = Image::zeros(v_basis[0].dims(), v_basis[0].rank());
    for (vj, &fj) in v_basis.iter().zip(f.iter()) {
        x.axpy(fj, vj);
    }
    x
}

/// Tikhonov solution of the projected problem, with the parameter chosen
/// by the requested method.
fn tikhonov_solve<T: Sample>(
    ub: &Array2<T>,
    sv: &[T],
    vb: &Array2<T>,
    beta0: T,
    omega: f64,
    reg_method: RegMethod,
    reg_par: f64,
) -> (Array1<T>, T) {
    let bhat: Vec<T> = ub.row(0).iter().map(|&u| u * beta0).collect();
    let alpha = match reg_method {
        RegMethod::Fixed => <T as crate::Sample>::from_f64(reg_par),
        RegMethod::Gcv => fmin(|a| tik_gcv_value(a, &bhat, sv, 1.0), T::zero(), T::one()),
        RegMethod::Wgcv | RegMethod::AdaptWgcv => {
            fmin(|a| tik_gcv_value(a, &bhat, sv, omega), T::zero(), T::one())
        }
    };
    let k = sv.len();
    let mut coeffs = Array1::zeros(k);
    for j in 0..k {
        let d = sv[j] * sv[j] + alpha * alpha;
        coeffs[j] = bhat[j] * sv[j] / d;
    }
    (vb.dot(&coeffs), alpha)
}

/// The (weighted) GCV functional of the projected Tikhonov problem.
fn tik_gcv_value<T: Sample>(alpha: T, bhat: &[T], sv: &[T], omega: f64) -> T {
    let m = bhat.len();
    let n = sv.len();
    let omega = <T as crate::Sample>::from_f64(omega);
    let alpha2 = alpha * alpha;
    let t0: T = bhat[n..].iter().map(|&v| v * v).sum();
    let mut num = T::zero();
    let mut denom = T::zero();
    for j in 0..n {
        let s2 = sv[j] * sv[j];
        let work = T::one() / (s2 + alpha2);
        let t1 = work * alpha2;
        let t2 = t1 * bhat[j];
        num = num + t2 * t2;
        denom = denom + work * s2 * (T::one() - omega) + t1;
    }
    let denom = denom + <T as crate::Sample>::from_f64((m - n) as f64);
    <T as crate::Sample>::from_f64(n as f64) * (num + t0) / (denom * denom)
}

/// Adaptive choice of the WGCV weight from the current projected system.
fn find_omega<T: Sample>(bhat: &[T], sv: &[T]) -> T {
    let m = bhat.len();
    let n = sv.len();
    let alpha = sv[n - 1];
    let alpha2 = alpha * alpha;
    let t0: T = bhat[n..].iter().map(|&v| v * v).sum();
    let mut t1 = T::zero();
    let mut t3 = T::zero();
    let mut t4 = T::zero();
    let mut t5 = T::zero();
    let mut v2 = T::zero();
    for j in 0..n {
        let s2 = sv[j] * sv[j];
        let tt = T::one() / (s2 + alpha2);
        let tt3 = (tt * tt * tt).abs();
        t1 = t1 + s2 * tt;
        let sb = sv[j] * bhat[j];
        t3 = t3 + tt3 * (alpha * sb) * (alpha * sb);
        let st = sv[j] * tt;
        t4 = t4 + st * st;
        let bt = tt * bhat[j] * alpha2;
        t5 = t5 + bt * bt;
        v2 = v2 + tt3 * sb * sb;
    }
    <T as crate::Sample>::from_f64(m as f64) * alpha2 * v2 / (t1 * t3 + t4 * (t5 + t0))
}

/// The GCV stopping functional over the outer iteration.
fn gcv_stop<T: Sample>(alpha: T, bhat: &[T], sv: &[T], beta0: T, n_total: usize) -> T {
    let k = sv.len();
    let beta2 = beta0 * beta0;
    let alpha2 = alpha * alpha;
    let nt = <T as crate::Sample>::from_f64(n_total as f64);
    // bhat here is beta0 times the first row of U, so divide the scale out
    let mut num = T::zero();
    let mut trace = T::zero();
    for j in 0..k {
        let s2 = sv[j] * sv[j];
        let t1 = T::one() / (s2 + alpha2);
        let t2 = t1 * (bhat[j] / beta0) * alpha2;
        num = num + t2 * t2;
        trace = trace + t1 * s2;
    }
    let tail = (bhat[k] / beta0).abs();
    let num = beta2 * (num + tail * tail) / nt;
    let den = (nt - trace) / nt;
    num / (den * den)
}

/// Golden-section minimization of a unimodal function on `[a, b]`.
fn fmin<T: Sample>(f: impl Fn(T) -> T, a: T, b: T) -> T {
    let tol = <T as crate::Sample>::from_f64(1e-4);
    let ratio = <T as crate::Sample>::from_f64(0.618_033_988_749_895);
    let mut lo = a;
    let mut hi = b;
    let mut x1 = hi - ratio * (hi - lo);
    let mut x2 = lo + ratio * (hi - lo);
    let mut f1 = f(x1);
    let mut f2 = f(x2);
    while hi - lo > tol {
        if f1 < f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - ratio * (hi - lo);
            f1 = f(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + ratio * (hi - lo);
            f2 = f(x2);
        }
    }
    (lo + hi) / <T as crate::Sample>::from_f64(2.0)
}

/// Full SVD of a small dense matrix by one-sided Jacobi rotations.
///
/// Returns `(U, s, V)` with `U` square `(m x m)`, singular values in
/// decreasing order, and `V` square `(n x n)`; only matrices with
/// `m >= n` occur here.
fn svd_full<T: Sample>(a: &Array2<T>) -> (Array2<T>, Vec<T>, Array2<T>) {
    let (m, n) = a.dim();
    let mut w = a.clone();
    let mut v: Array2<T> = Array2::eye(n);
    let eps = T::epsilon() * <T as crate::Sample>::from_f64(8.0);

    for _sweep in 0..60 {
        let mut rotated = false;
        for p in 0..n {
            for q in (p + 1)..n {
                let mut app = T::zero();
                let mut aqq = T::zero();
                let mut apq = T::zero();
                for i in 0..m {
                    app = app + w[[i, p]] * w[[i, p]];
                    aqq = aqq + w[[i, q]] * w[[i, q]];
                    apq = apq + w[[i, p]] * w[[i, q]];
                }
                if apq.abs() <= eps * (app * aqq).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (aqq - app) / (<T as crate::Sample>::from_f64(2.0) * apq);
                let t = if zeta >= T::zero() {
                    T::one() / (zeta + (T::one() + zeta * zeta).sqrt())
                } else {
                    -T::one() / (-zeta + (T::one() + zeta * zeta).sqrt())
                };
                let c = T::one() / (T::one() + t * t).sqrt();
                let s = c * t;
                for i in 0..m {
                    let wp = w[[i, p]];
                    let wq = w[[i, q]];
                    w[[i, p]] = c * wp - s * wq;
                    w[[i, q]] = s * wp + c * wq;
                }
                for i in 0..n {
                    let vp = v[[i, p]];
                    let vq = v[[i, q]];
                    v[[i, p]] = c * vp - s * vq;
                    v[[i, q]] = s * vp + c * vq;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    // singular values are the column norms; order them decreasingly
    let mut sv: Vec<T> = (0..n)
        .map(|j| (0..m).map(|i| w[[i, j]] * w[[i, j]]).sum::<T>().sqrt())
        .collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| sv[y].partial_cmp(&sv[x]).unwrap_or(std::cmp::Ordering::Equal));

    let mut u = Array2::zeros((m, m));
    let mut v_sorted = Array2::zeros((n, n));
    let mut sv_sorted = Vec::with_capacity(n);
    for (col, &j) in order.iter().enumerate() {
        let s = sv[j];
        sv_sorted.push(s);
        for i in 0..m {
            u[[i, col]] = if s > T::epsilon() {
                w[[i, j]] / s
            } else {
                T::zero()
            };
        }
        for i in 0..n {
            v_sorted[[i, col]] = v[[i, j]];
        }
    }
    sv = sv_sorted;

    // orthonormal completion of U to a full square basis
    for col in n..m {
        complete_column(&mut u, col);
    }
    // a zero singular value leaves its column empty as well
    for col in 0..n {
        if sv[col] <= T::epsilon() {
            complete_column(&mut u, col);
        }
    }

    (u, sv, v_sorted)
}

/// Fills `u[.., col]` with a unit vector orthogonal to all other nonzero
/// columns, by Gram-Schmidt over the canonical basis.
fn complete_column<T: Sample>(u: &mut Array2<T>, col: usize) {
    let m = u.nrows();
    for seed in 0..m {
        let mut cand = vec![T::zero(); m];
        cand[seed] = T::one();
        for other in 0..u.ncols() {
            if other == col {
                continue;
            }
            let proj: T = (0..m).map(|i| u[[i, other]] * cand[i]).sum();
            for (i, cv) in cand.iter_mut().enumerate() {
                *cv = *cv - proj * u[[i, other]];
            }
        }
        let norm = cand.iter().map(|&v| v * v).sum::<T>().sqrt();
        if norm > <T as crate::Sample>::from_f64(1e-6) {
            for (i, cv) in cand.iter().enumerate() {
                u[[i, col]] = *cv / norm;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Dims, OutputKind};
    use crate::method::Method;
    use crate::padding::{Boundary, Resizing};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn jacobi_svd_reconstructs_the_matrix() {
        let a = array![[3.0f64, 1.0], [1.0, 2.0], [0.0, 1.0]];
        let (u, s, v) = svd_full(&a);
        // A = U_thin * diag(s) * V^T
        for i in 0..3 {
            for j in 0..2 {
                let mut got = 0.0;
                for k in 0..2 {
                    got += u[[i, k]] * s[k] * v[[j, k]];
                }
                assert_abs_diff_eq!(got, a[[i, j]], epsilon = 1e-10);
            }
        }
        // U is orthonormal including the completed column
        for p in 0..3 {
            for q in 0..3 {
                let dot: f64 = (0..3).map(|i| u[[i, p]] * u[[i, q]]).sum();
                let want = if p == q { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(dot, want, epsilon = 1e-10);
            }
        }
        assert!(s[0] >= s[1]);
    }

    #[test]
    fn fmin_locates_a_parabola_minimum() {
        let min = fmin(|x: f64| (x - 0.3) * (x - 0.3), 0.0, 1.0);
        assert_abs_diff_eq!(min, 0.3, epsilon = 1e-3);
    }

    #[test]
    fn restores_an_identity_blur() {
        let mut b = Image::<f64>::zeros(Dims::new(1, 8, 8), 2);
        b.set(0, 2, 6, 3.0);
        b.set(0, 5, 3, 1.5);
        let mut psf = Image::zeros(Dims::new(1, 3, 3), 2);
        psf.set(0, 1, 1, 1.0);
        let config = DeblurConfig {
            boundary: Boundary::Zero,
            resizing: Resizing::Auto,
            output: OutputKind::SameAsSource,
            max_iters: 10,
            threshold: -1.0,
        };
        let out = method::solve(
            &b,
            &psf,
            &config,
            &Method::Hybr(HybrOptions::default()),
            None,
        )
        .expect("deblur succeeds");
        let restored = match out {
            OutputImage::Double(a) => a,
            other => panic!("expected double output, got {other:?}"),
        };
        assert_abs_diff_eq!(restored[[2, 6]], 3.0, epsilon = 0.2);
        assert_abs_diff_eq!(restored[[5, 3]], 1.5, epsilon = 0.2);
    }
}
