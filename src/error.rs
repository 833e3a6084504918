//! Configuration errors reported before the first iteration.
//!
//! Numerical edge cases (vanishing spectral magnitudes, divergence) are not
//! errors: they are absorbed by regularization or end the iteration early
//! with the best estimate found so far.

use std::error::Error;
use std::fmt;

/// A problem with the inputs or options, detected at setup.
///
/// No partial state is ever returned alongside one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeblurError {
    /// A PSF dimension exceeds the corresponding expanded working dimension.
    PsfTooLarge {
        axis: &'static str,
        psf: usize,
        working: usize,
    },
    /// The image or the PSF has a zero-length axis.
    EmptyInput,
    /// Image and PSF do not have the same rank (both 2D or both 3D).
    RankMismatch { image: usize, psf: usize },
    /// An option value is outside its valid range.
    BadOption(String),
}

impl fmt::Display for DeblurError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeblurError::PsfTooLarge { axis, psf, working } => write!(
                f,
                "PSF {axis} dimension ({psf}) exceeds the expanded working dimension ({working})"
            ),
            DeblurError::EmptyInput => write!(f, "image and PSF must have nonzero extent"),
            DeblurError::RankMismatch { image, psf } => {
                write!(f, "image rank ({image}) does not match PSF rank ({psf})")
            }
            DeblurError::BadOption(msg) => write!(f, "invalid option: {msg}"),
        }
    }
}

impl Error for DeblurError {}
