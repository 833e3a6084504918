//! End-to-end deblurring scenarios shared by all four methods.

use approx::assert_abs_diff_eq;
use iterative_deblur::image::Dims;
use iterative_deblur::{
    solve, Boundary, CglsOptions, DeblurConfig, HybrOptions, Image, Method, MrnsdOptions,
    OutputImage, OutputKind, Resizing, WplOptions,
};
use ndarray::ArrayD;

/// 8x8 all-zero image with a single impulse of 100 at (4,4).
fn impulse_image() -> Image<f64> {
    let mut b = Image::zeros(Dims::new(1, 8, 8), 2);
    b.set(0, 4, 4, 100.0);
    b
}

/// 3x3 uniform box averaging kernel.
fn box_psf() -> Image<f64> {
    let mut psf = Image::zeros(Dims::new(1, 3, 3), 2);
    for r in 0..3 {
        for c in 0..3 {
            psf.set(0, r, c, 1.0 / 9.0);
        }
    }
    psf
}

fn blur(truth: &Image<f64>, boundary: Boundary) -> Image<f64> {
    let mut op = iterative_deblur::psf::PsfOperator::new(
        &box_psf(),
        boundary,
        Resizing::Auto,
        truth.dims(),
        truth.rank(),
    )
    .expect("valid setup");
    op.apply(truth)
}

fn unwrap_double(out: OutputImage) -> ArrayD<f64> {
    match out {
        OutputImage::Double(a) => a,
        other => panic!("expected double output, got {other:?}"),
    }
}

fn config(boundary: Boundary) -> DeblurConfig {
    DeblurConfig {
        boundary,
        resizing: Resizing::Auto,
        output: OutputKind::SameAsSource,
        max_iters: 60,
        threshold: -1.0,
    }
}

fn wpl_options() -> WplOptions {
    // gamma 0 disables the Wiener pre-filter; the convergence and
    // divergence rules pick the stopping iteration
    WplOptions {
        gamma: 0.0,
        anti_ring: false,
        change_thresh_percent: 1e-6,
        ..WplOptions::default()
    }
}

#[test]
fn wpl_recovers_impulse_energy_within_five_percent() {
    let truth = impulse_image();
    let blurred = blur(&truth, Boundary::Periodic);
    let out = solve(
        &blurred,
        &box_psf(),
        &config(Boundary::Periodic),
        &Method::Wpl(wpl_options()),
        None,
    )
    .expect("deblur succeeds");
    let restored = unwrap_double(out);
    let total: f64 = restored.iter().sum();
    assert!(
        (total - 100.0).abs() < 5.0,
        "total energy {total} off by more than 5%"
    );
    // energy concentrates back near (4,4)
    let restored = &restored;
    let near: f64 = (3..=5)
        .flat_map(|r| (3..=5).map(move |c| restored[[r, c]]))
        .sum();
    assert!(near > 0.5 * total, "energy not concentrated near (4,4)");
}

#[test]
fn zero_and_periodic_boundaries_agree_in_the_interior() {
    // boundary handling differs only in the pad region; with the Gaussian
    // weighting turned off (filter width 0 keeps every frequency), the
    // difference cannot propagate further than the iteration count times
    // the PSF radius, so the deep interior agrees exactly
    let truth = impulse_image();
    let options = WplOptions {
        gamma: 0.0,
        filter_x: 0.0,
        filter_y: 0.0,
        filter_z: 0.0,
        anti_ring: false,
        change_thresh_percent: 0.0,
        detect_divergence: false,
        ..WplOptions::default()
    };
    let cfg = |boundary| DeblurConfig {
        max_iters: 4,
        ..config(boundary)
    };
    let restored_zero = unwrap_double(
        solve(
            &blur(&truth, Boundary::Zero),
            &box_psf(),
            &cfg(Boundary::Zero),
            &Method::Wpl(options),
            None,
        )
        .expect("deblur succeeds"),
    );
    let restored_periodic = unwrap_double(
        solve(
            &blur(&truth, Boundary::Periodic),
            &box_psf(),
            &cfg(Boundary::Periodic),
            &Method::Wpl(options),
            None,
        )
        .expect("deblur succeeds"),
    );
    // interior cells at least max(psf dimension) away from every edge
    for r in 3..=4 {
        for c in 3..=4 {
            assert_abs_diff_eq!(
                restored_zero[[r, c]],
                restored_periodic[[r, c]],
                epsilon = 1e-6
            );
        }
    }
    // near the border the two policies leave different energy
    let edge_diff: f64 = (0..8)
        .map(|c| (restored_zero[[0, c]] - restored_periodic[[0, c]]).abs())
        .sum();
    assert!(edge_diff > 1e-9, "expected a boundary difference");
}

#[test]
fn threshold_is_idempotent_end_to_end() {
    let truth = impulse_image();
    let blurred = blur(&truth, Boundary::Reflexive);
    let run = |threshold: f64| -> ArrayD<f64> {
        let cfg = DeblurConfig {
            threshold,
            ..config(Boundary::Reflexive)
        };
        unwrap_double(
            solve(
                &blurred,
                &box_psf(),
                &cfg,
                &Method::Wpl(wpl_options()),
                None,
            )
            .expect("deblur succeeds"),
        )
    };
    let once = run(0.5);
    // re-applying the same threshold to the finished image changes nothing
    let twice = once.mapv(|v| if v < 0.5 { 0.0 } else { v });
    assert_eq!(once, twice);
    for v in once.iter() {
        assert!(*v == 0.0 || *v >= 0.5);
    }
}

#[test]
fn byte_output_is_clamped() {
    let truth = impulse_image();
    let blurred = blur(&truth, Boundary::Reflexive);
    let cfg = DeblurConfig {
        output: OutputKind::Byte,
        ..config(Boundary::Reflexive)
    };
    let out = solve(
        &blurred,
        &box_psf(),
        &cfg,
        &Method::Wpl(wpl_options()),
        None,
    )
    .expect("deblur succeeds");
    match out {
        OutputImage::Byte(a) => {
            assert_eq!(a.shape(), &[8, 8]);
        }
        other => panic!("expected byte output, got {other:?}"),
    }
}

#[test]
fn all_methods_sharpen_the_blurred_impulse() {
    let truth = impulse_image();
    let blurred = blur(&truth, Boundary::Zero);
    let cfg = DeblurConfig {
        max_iters: 30,
        ..config(Boundary::Zero)
    };
    let blurred_peak = blurred.get(0, 4, 4);

    let methods = [
        Method::Wpl(wpl_options()),
        Method::Cgls(CglsOptions::default()),
        Method::Mrnsd(MrnsdOptions::default()),
        Method::Hybr(HybrOptions::default()),
    ];
    for method in methods {
        let restored = unwrap_double(
            solve(&blurred, &box_psf(), &cfg, &method, None).expect("deblur succeeds"),
        );
        assert!(
            restored[[4, 4]] > 2.0 * blurred_peak,
            "{method:?} failed to sharpen: peak {} vs blurred {blurred_peak}",
            restored[[4, 4]]
        );
        assert_eq!(restored.shape(), &[8, 8]);
    }
}

#[test]
fn three_dimensional_deblurring_keeps_extent() {
    let mut truth = Image::<f64>::zeros(Dims::new(4, 6, 6), 3);
    truth.set(2, 3, 3, 50.0);
    let mut psf = Image::<f64>::zeros(Dims::new(3, 3, 3), 3);
    for s in 0..3 {
        for r in 0..3 {
            for c in 0..3 {
                psf.set(s, r, c, 1.0 / 27.0);
            }
        }
    }
    let mut op = iterative_deblur::psf::PsfOperator::new(
        &psf,
        Boundary::Reflexive,
        Resizing::Auto,
        truth.dims(),
        3,
    )
    .expect("valid setup");
    let blurred = op.apply(&truth);

    let cfg = DeblurConfig {
        max_iters: 25,
        ..config(Boundary::Reflexive)
    };
    let restored = unwrap_double(
        solve(&blurred, &psf, &cfg, &Method::Wpl(wpl_options()), None).expect("deblur succeeds"),
    );
    assert_eq!(restored.shape(), &[4, 6, 6]);
    assert!(
        restored[[2, 3, 3]] > 2.0 * blurred.get(2, 3, 3),
        "3d peak did not sharpen"
    );
}
