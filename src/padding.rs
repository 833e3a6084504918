//! Boundary padding and working-grid sizing.
//!
//! An image is embedded once, centered, into an expanded working grid
//! before the transform-domain iteration; the grid is sized per axis from
//! the PSF and image extents and the resizing policy.

use crate::image::{Dims, Image};
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Boundary condition used to fill the padded region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    /// Cyclic tiling of the source.
    Periodic,
    /// Mirror at the source edges, without repeating the edge sample.
    Reflexive,
    /// Zero fill around the centered source.
    Zero,
}

/// Policy for choosing the expanded working size per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resizing {
    /// Next power of two, unless that inflates the axis to 1.5x the
    /// minimal sum or more, in which case the minimal sum is used.
    Auto,
    /// Exactly `psf + image`.
    Minimal,
    /// Always the next power of two above `psf + image`.
    NextPowerOfTwo,
}

/// Expanded working size for one axis. Never below `psf + image`, with a
/// floor of 4.
pub fn expanded_size(psf: usize, image: usize, resizing: Resizing) -> usize {
    let minimal = psf + image;
    let result = match resizing {
        Resizing::Auto => {
            let pow2 = minimal.next_power_of_two();
            if pow2 as f64 >= 1.5 * minimal as f64 {
                minimal
            } else {
                pow2
            }
        }
        Resizing::Minimal => minimal,
        Resizing::NextPowerOfTwo => minimal.next_power_of_two(),
    };
    result.max(4)
}

/// Periodic index: wraps `i` into `0..n`.
#[inline]
fn periodic(i: isize, n: usize) -> usize {
    let n = n as isize;
    let ip = ((i % (2 * n)) + 2 * n) % (2 * n);
    if ip < n {
        ip as usize
    } else {
        (ip % n) as usize
    }
}

/// Reflexive index: mirrors `i` at the edges without repeating them.
#[inline]
fn mirror(i: isize, n: usize) -> usize {
    let n = n as isize;
    let ip = ((i % (2 * n)) + 2 * n) % (2 * n);
    if ip < n {
        ip as usize
    } else {
        (n - (ip % n) - 1) as usize
    }
}

/// Centering offset of a `src`-sized block inside a `target`-sized axis.
#[inline]
pub fn center_offset(target: usize, src: usize) -> usize {
    (target - src + 1) / 2
}

/// Embeds `x` centered in a `target`-sized buffer, filling the surround
/// according to `boundary`.
///
/// `target >= x.dims()` on every axis is a precondition, not a runtime
/// error path.
pub fn pad<T: Sample>(x: &Image<T>, boundary: Boundary, target: Dims) -> Image<T> {
    let src = x.dims();
    debug_assert!(
        target.slices >= src.slices && target.rows >= src.rows && target.cols >= src.cols
    );
    if src == target {
        return x.clone();
    }
    let s_off = center_offset(target.slices, src.slices) as isize;
    let r_off = center_offset(target.rows, src.rows) as isize;
    let c_off = center_offset(target.cols, src.cols) as isize;

    let mut out = Image::zeros(target, x.rank());
    match boundary {
        Boundary::Zero => {
            for s in 0..src.slices {
                for r in 0..src.rows {
                    for c in 0..src.cols {
                        out.set(
                            s + s_off as usize,
                            r + r_off as usize,
                            c + c_off as usize,
                            x.get(s, r, c),
                        );
                    }
                }
            }
        }
        Boundary::Periodic => {
            fill_padded(x, &mut out, s_off, r_off, c_off, periodic);
        }
        Boundary::Reflexive => {
            fill_padded(x, &mut out, s_off, r_off, c_off, mirror);
        }
    }
    out
}

fn fill_padded<T: Sample>(
    x: &Image<T>,
    out: &mut Image<T>,
    s_off: isize,
    r_off: isize,
    c_off: isize,
    index: fn(isize, usize) -> usize,
) {
    let src = x.dims();
    let target = out.dims();
    for s in -s_off..target.slices as isize - s_off {
        let s_in = index(s, src.slices);
        let s_out = (s + s_off) as usize;
        for r in -r_off..target.rows as isize - r_off {
            let r_in = index(r, src.rows);
            let r_out = (r + r_off) as usize;
            for c in -c_off..target.cols as isize - c_off {
                let c_in = index(c, src.cols);
                let c_out = (c + c_off) as usize;
                out.set(s_out, r_out, c_out, x.get(s_in, r_in, c_in));
            }
        }
    }
}

/// Embeds `x` at the origin of a `target`-sized buffer, zero-filling the
/// trailing region only. Used for the PSF before circular shifting.
pub fn pad_zero_post<T: Sample>(x: &Image<T>, target: Dims) -> Image<T> {
    let src = x.dims();
    debug_assert!(
        target.slices >= src.slices && target.rows >= src.rows && target.cols >= src.cols
    );
    if src == target {
        return x.clone();
    }
    let mut out = Image::zeros(target, x.rank());
    for s in 0..src.slices {
        for r in 0..src.rows {
            for c in 0..src.cols {
                out.set(s, r, c, x.get(s, r, c));
            }
        }
    }
    out
}

/// Circularly shifts the buffer so that the sample at `center` lands at
/// the origin.
pub fn circ_shift<T: Sample>(x: &Image<T>, center: [usize; 3]) -> Image<T> {
    let dims = x.dims();
    let mut out = Image::zeros(dims, x.rank());
    for s in 0..dims.slices {
        let s_to = (s + dims.slices - center[0]) % dims.slices;
        for r in 0..dims.rows {
            let r_to = (r + dims.rows - center[1]) % dims.rows;
            for c in 0..dims.cols {
                let c_to = (c + dims.cols - center[2]) % dims.cols;
                out.set(s_to, r_to, c_to, x.get(s, r, c));
            }
        }
    }
    out
}

/// Extracts the centered `target`-sized block, inverting the embedding
/// performed by [`pad`].
pub fn crop<T: Sample>(x: &Image<T>, target: Dims, rank: usize) -> Image<T> {
    let src = x.dims();
    let s_off = center_offset(src.slices, target.slices);
    let r_off = center_offset(src.rows, target.rows);
    let c_off = center_offset(src.cols, target.cols);
    let mut out = Image::zeros(target, rank);
    for s in 0..target.slices {
        for r in 0..target.rows {
            for c in 0..target.cols {
                out.set(s, r, c, x.get(s + s_off, r + r_off, c + c_off));
            }
        }
    }
    out
}
