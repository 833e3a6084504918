//! Modified residual norm steepest descent.
//!
//! A steepest-descent method whose step is clipped at the nonnegativity
//! boundary: the search direction is `-x .* grad`, so a nonnegative start
//! stays nonnegative by construction rather than by clamping.

use crate::error::DeblurError;
use crate::image::{Image, OutputImage};
use crate::method::precond::{BlurOp, Preconditioner};
use crate::method::{self, DeblurConfig, IterationEvent, Monitor};
use crate::psf::PsfOperator;
use crate::sqrt_eps;
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Options of the MRNSD method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MrnsdOptions {
    /// Stopping tolerance on the weighted gradient norm; `-1.0` derives
    /// one from the discrepancy principle (`sqrt(eps) * ||A^T b||`).
    pub tol: f64,
    /// Also track and log the solution norm per iteration.
    pub xnorm: bool,
    pub preconditioner: Preconditioner,
}

impl Default for MrnsdOptions {
    fn default() -> Self {
        MrnsdOptions {
            tol: -1.0,
            xnorm: false,
            preconditioner: Preconditioner::None,
        }
    }
}

pub(crate) fn deblur<T: Sample>(
    image: &Image<T>,
    psf: &Image<T>,
    config: &DeblurConfig,
    options: &MrnsdOptions,
    mut monitor: Option<&mut dyn Monitor<T>>,
) -> Result<OutputImage, DeblurError> {
    let op = PsfOperator::new(
        psf,
        config.boundary,
        config.resizing,
        image.dims(),
        image.rank(),
    )?;
    let mut a = BlurOp::new(op, options.preconditioner, image);
    let mut x = a.rhs(image);

    // shift a negative-valued start up to the nonnegative orthant
    let sigsq = sqrt_eps::<T>();
    let min_x = x.min_value();
    if min_x < T::zero() {
        x.shift(-(min_x.min(T::zero()) + sigsq));
    }

    let nrm_trab = a.adjoint(&x).norm2();
    let tol = if options.tol == -1.0 {
        sqrt_eps::<T>() * nrm_trab
    } else {
        <T as crate::Sample>::from_f64(options.tol)
    };

    // r = A^T (A x - b) with b = x at start
    let b = x.clone();
    let mut residual = a.forward(&x);
    residual.axpy(-T::one(), &b);
    let mut r = a.adjoint(&residual);

    let mut gamma = weighted_gradient(&x, &r);
    let mut rnrm = gamma.sqrt();

    for k in 0..config.max_iters {
        if rnrm <= tol {
            log::info!("mrnsd: converged after {k} iterations");
            break;
        }
        // s = -x .* r
        let mut s = x.clone();
        for (sv, &rv) in s.as_mut_slice().iter_mut().zip(r.as_slice()) {
            *sv = -*sv * rv;
        }
        let v = a.forward(&s);
        let nv = v.norm2();
        let theta = gamma / (nv * nv);
        // largest step keeping x nonnegative: min over {s < 0} of -x / s
        let mut limit = T::infinity();
        for (&sv, &xv) in s.as_slice().iter().zip(x.as_slice()) {
            if sv < T::zero() {
                let w = -xv / sv;
                if w < limit {
                    limit = w;
                }
            }
        }
        let alpha = theta.min(limit);
        x.axpy(alpha, &s);
        let w = a.adjoint(&v);
        r.axpy(alpha, &w);
        gamma = weighted_gradient(&x, &r);
        rnrm = gamma.sqrt();
        let relative = (rnrm / nrm_trab).to_f64();
        if options.xnorm {
            log::debug!(
                "mrnsd iteration {}: residual {relative}, solution norm {}",
                k + 1,
                x.norm2().to_f64()
            );
        } else {
            log::debug!("mrnsd iteration {}: residual {relative}", k + 1);
        }
        if let Some(m) = monitor.as_deref_mut() {
            m.iteration(IterationEvent {
                iteration: k + 1,
                metric: relative,
                estimate: &x,
            });
        }
    }

    Ok(method::finalize(x, config.threshold, config.output))
}

/// `sum(x .* r^2)`, the squared norm of the gradient weighted by the
/// current estimate.
fn weighted_gradient<T: Sample>(x: &Image<T>, r: &Image<T>) -> T {
    x.as_slice()
        .iter()
        .zip(r.as_slice())
        .map(|(&xv, &rv)| xv * rv * rv)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Dims, OutputKind};
    use crate::method::Method;
    use crate::padding::{Boundary, Resizing};

    fn config() -> DeblurConfig {
        DeblurConfig {
            boundary: Boundary::Zero,
            resizing: Resizing::Auto,
            output: OutputKind::SameAsSource,
            max_iters: 40,
            threshold: -1.0,
        }
    }

    #[test]
    fn estimate_is_nonnegative_by_construction() {
        let mut truth = Image::<f64>::zeros(Dims::new(1, 8, 8), 2);
        truth.set(0, 4, 4, 100.0);
        let mut psf = Image::zeros(Dims::new(1, 3, 3), 2);
        for r in 0..3 {
            for c in 0..3 {
                psf.set(0, r, c, 1.0 / 9.0);
            }
        }
        let mut op = PsfOperator::new(&psf, Boundary::Zero, Resizing::Auto, truth.dims(), 2)
            .expect("valid setup");
        let blurred = op.apply(&truth);

        struct Probe {
            violations: usize,
        }
        impl Monitor<f64> for Probe {
            fn iteration(&mut self, event: IterationEvent<'_, f64>) {
                self.violations += event
                    .estimate
                    .as_slice()
                    .iter()
                    .filter(|&&v| v < -1e-12)
                    .count();
            }
        }
        let mut probe = Probe { violations: 0 };
        let out = method::solve(
            &blurred,
            &psf,
            &config(),
            &Method::Mrnsd(MrnsdOptions::default()),
            Some(&mut probe),
        )
        .expect("deblur succeeds");
        assert_eq!(probe.violations, 0);
        let restored = match out {
            OutputImage::Double(a) => a,
            other => panic!("expected double output, got {other:?}"),
        };
        assert!(restored[[4, 4]] > 30.0, "peak: {}", restored[[4, 4]]);
    }
}
