//! Binarization of cross-section micrographs.
//!
//! A single threshold is rarely enough on polished cross sections:
//! global levels fail under uneven illumination and local levels turn
//! flat dark regions into noise. The mask is therefore the pixel-wise
//! intersection of three thresholds (adaptive Gaussian, Otsu and a fixed
//! level), cleaned by a 3×3 opening and closing.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use tracing::debug;

use crate::blur::{odd_kernel, sigma_for_kernel, smooth};
use crate::profile::{row, runs_of};
use crate::types::{BLACK, MeasureError, Parameters, WHITE, ensure_non_empty};

/// Foreground where `p > level`.
#[must_use = "returns the thresholded mask"]
pub fn threshold_above(image: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([if image.get_pixel(x, y).0[0] > level { WHITE } else { BLACK }])
    })
}

/// Foreground where `p > level` with `level` chosen by Otsu's method.
#[must_use = "returns the thresholded mask"]
pub fn otsu_threshold(image: &GrayImage) -> GrayImage {
    let level = imageproc::contrast::otsu_level(image);
    debug!(level, "otsu level");
    threshold_above(image, level)
}

/// Adaptive threshold against a Gaussian-weighted local mean.
///
/// A pixel is foreground when it exceeds its neighbourhood mean minus
/// `c`. `block_size` is made odd and at least 3.
#[must_use = "returns the thresholded mask"]
pub fn adaptive_threshold(image: &GrayImage, block_size: u32, c: i32) -> GrayImage {
    let block = odd_kernel(block_size).max(3);
    let local = imageproc::filter::gaussian_blur_f32(image, sigma_for_kernel(block));
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = i32::from(image.get_pixel(x, y).0[0]);
        let mean = i32::from(local.get_pixel(x, y).0[0]);
        Luma([if p > mean - c { WHITE } else { BLACK }])
    })
}

/// Pixel-wise logical AND of equally sized masks.
#[must_use = "returns the combined mask"]
pub fn intersect(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        let both = a.get_pixel(x, y).0[0] == WHITE && b.get_pixel(x, y).0[0] == WHITE;
        Luma([if both { WHITE } else { BLACK }])
    })
}

/// Swap foreground and background.
#[must_use = "returns the inverted mask"]
pub fn invert(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([WHITE - mask.get_pixel(x, y).0[0]])
    })
}

/// Opening then closing with a 3×3 square element.
#[must_use = "returns the cleaned mask"]
pub fn clean(mask: &GrayImage) -> GrayImage {
    let opened = imageproc::morphology::open(mask, Norm::LInf, 1);
    imageproc::morphology::close(&opened, Norm::LInf, 1)
}

/// Opening with a `1 × length` horizontal element.
///
/// On a binary mask this keeps exactly the white runs that are at least
/// `length` pixels long (after [`odd_kernel`]), isolating horizontal
/// segments from speckle and vertical walls.
#[must_use = "returns the opened mask"]
pub fn open_horizontal(mask: &GrayImage, length: u32) -> GrayImage {
    let min_run = odd_kernel(length) as usize;
    let mut out = GrayImage::new(mask.width(), mask.height());
    for y in 0..mask.height() {
        for run in runs_of(row(mask, y), WHITE) {
            if run.len() < min_run {
                continue;
            }
            for x in run {
                #[allow(clippy::cast_possible_truncation)]
                out.put_pixel(x as u32, y, Luma([WHITE]));
            }
        }
    }
    out
}

/// Produce the binary mask of `image`.
///
/// The output has the same dimensions as the input and holds only
/// `0` and `255`.
///
/// # Errors
///
/// Returns [`MeasureError::EmptyInput`] if the image has no pixels.
pub fn binarize(image: &GrayImage, params: &Parameters) -> Result<GrayImage, MeasureError> {
    ensure_non_empty(image)?;

    let smoothed = smooth(image, params.gaussian_kernel);
    let adaptive = adaptive_threshold(&smoothed, params.adaptive_block_size, params.adaptive_c);
    let otsu = otsu_threshold(&smoothed);
    let fixed = threshold_above(&smoothed, params.binary_threshold);

    let combined = intersect(&intersect(&adaptive, &otsu), &fixed);
    let cleaned = clean(&combined);

    Ok(if params.invert_binary {
        invert(&cleaned)
    } else {
        cleaned
    })
}
