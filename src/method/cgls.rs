//! Conjugate gradient for least squares.
//!
//! Minimizes `||A x - b||` through the normal equations without ever
//! forming them; each iteration costs one forward and one adjoint
//! application of the blur operator. The initial estimate is the blurred
//! image itself.

use crate::error::DeblurError;
use crate::image::{Image, OutputImage};
use crate::method::precond::{BlurOp, Preconditioner};
use crate::method::{self, DeblurConfig, IterationEvent, Monitor};
use crate::psf::PsfOperator;
use crate::sqrt_eps;
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Options of the CGLS method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CglsOptions {
    /// Stopping tolerance on the residual gradient norm; `-1.0` derives
    /// one from the discrepancy principle (`sqrt(eps) * ||A^T b||`).
    pub tol: f64,
    /// Also track and log the solution norm per iteration.
    pub xnorm: bool,
    pub preconditioner: Preconditioner,
}

impl Default for CglsOptions {
    fn default() -> Self {
        CglsOptions {
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
    options: &CglsOptions,
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
    let b = a.rhs(image);

    let nrm_trab = a.adjoint(&b).norm2();
    let tol = if options.tol == -1.0 {
        sqrt_eps::<T>() * nrm_trab
    } else {
        <T as crate::Sample>::from_f64(options.tol)
    };

    // x starts from the blurred image; s is the data-space residual
    let mut x = b.clone();
    let mut s = b.clone();
    let ax = a.forward(&x);
    s.axpy(-T::one(), &ax);
    let mut r = a.adjoint(&s);
    let mut p = r.clone();
    let mut rnrm = r.norm2();
    let mut gamma = rnrm * rnrm;
    let mut oldgamma = T::zero();

    for k in 0..config.max_iters {
        if rnrm <= tol {
            log::info!("cgls: converged after {k} iterations");
            break;
        }
        if k >= 1 {
            let beta = gamma / oldgamma;
            p.scale(beta);
            p.axpy(T::one(), &r);
        }
        let q = a.forward(&p);
        let nq = q.norm2();
        let alpha = gamma / (nq * nq);
        x.axpy(alpha, &p);
        s.axpy(-alpha, &q);
        r = a.adjoint(&s);
        oldgamma = gamma;
        rnrm = r.norm2();
        gamma = rnrm * rnrm;
        let relative = (rnrm / nrm_trab).to_f64();
        if options.xnorm {
            log::debug!(
                "cgls iteration {}: residual {relative}, solution norm {}",
                k + 1,
                x.norm2().to_f64()
            );
        } else {
            log::debug!("cgls iteration {}: residual {relative}", k + 1);
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
