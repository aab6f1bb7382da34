//! Straightening a tilted micrograph before detection.
//!
//! The image is centered on a square canvas wide enough for any angle,
//! the canvas is filled with the dominant border gray so no artificial
//! edge appears around the content, and the canvas is rotated about its
//! center.

use std::borrow::Cow;

use image::{GrayImage, Luma, imageops};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use tracing::debug;

use crate::types::Parameters;

/// Extra canvas width beyond the image diagonal, in pixels.
pub const CANVAS_MARGIN: u32 = 20;

/// Border bands sampled for the background gray: this fraction of each
/// side, at least [`MIN_BORDER_BAND`] pixels.
pub const BORDER_FRACTION: f64 = 0.1;
pub const MIN_BORDER_BAND: u32 = 5;

/// Most frequent gray level in the four border bands of `image`.
///
/// Ties go to the darker level. An empty image gives zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn background_level(image: &GrayImage) -> u8 {
    let (w, h) = image.dimensions();
    let band_x = ((f64::from(w) * BORDER_FRACTION) as u32).max(MIN_BORDER_BAND);
    let band_y = ((f64::from(h) * BORDER_FRACTION) as u32).max(MIN_BORDER_BAND);

    let mut histogram = [0_u64; 256];
    for (x, y, px) in image.enumerate_pixels() {
        let on_border = y < band_y
            || y >= h.saturating_sub(band_y)
            || x < band_x
            || x >= w.saturating_sub(band_x);
        if on_border {
            histogram[usize::from(px.0[0])] += 1;
        }
    }
    histogram
        .iter()
        .enumerate()
        .max_by(|(la, a), (lb, b)| a.cmp(b).then(lb.cmp(la)))
        .and_then(|(level, _)| u8::try_from(level).ok())
        .unwrap_or(0)
}

/// Side of the square canvas that holds `image` at any rotation.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn canvas_side(width: u32, height: u32) -> u32 {
    (f64::from(width).hypot(f64::from(height)) as u32) + CANVAS_MARGIN
}

/// Rotate `image` counter-clockwise by `angle_deg` onto an enlarged
/// canvas filled with [`background_level`].
#[must_use = "returns the rotated image"]
#[allow(clippy::cast_possible_truncation)]
pub fn rotate(image: &GrayImage, angle_deg: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    let side = canvas_side(w, h);
    let fill = Luma([background_level(image)]);

    let mut canvas = GrayImage::from_pixel(side, side, fill);
    imageops::replace(
        &mut canvas,
        image,
        i64::from((side - w) / 2),
        i64::from((side - h) / 2),
    );
    debug!(angle_deg, side, background = fill.0[0], "rotating input");
    // imageproc turns clockwise on screen for positive angles.
    rotate_about_center(
        &canvas,
        (-angle_deg.to_radians()) as f32,
        Interpolation::Bilinear,
        fill,
    )
}

/// The image detection should run on: `image` itself, or its rotation by
/// [`Parameters::rotation_deg`].
#[must_use]
pub fn oriented<'a>(image: &'a GrayImage, params: &Parameters) -> Cow<'a, GrayImage> {
    if params.rotation_deg.abs() < f64::EPSILON || image.width() == 0 || image.height() == 0 {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(rotate(image, params.rotation_deg))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn background_is_the_border_mode() {
        // Dark frame, bright center patch larger than the frame.
        let img = GrayImage::from_fn(100, 100, |x, y| {
            let center = (20..80).contains(&x) && (20..80).contains(&y);
            Luma([if center { 200 } else { 30 }])
        });
        assert_eq!(background_level(&img), 30);
    }

    #[test]
    fn canvas_fits_the_diagonal() {
        assert_eq!(canvas_side(300, 400), 500 + CANVAS_MARGIN);
        let rotated = rotate(&GrayImage::new(300, 400), 30.0);
        assert_eq!(rotated.dimensions(), (520, 520));
    }

    #[test]
    fn quarter_turn_makes_a_row_a_column() {
        // Bright rows 39..=41 across a dark 101×101 image.
        let img = GrayImage::from_fn(101, 101, |_, y| {
            Luma([if (39..=41).contains(&y) { 250 } else { 10 }])
        });
        let rotated = rotate(&img, 90.0);
        let side = rotated.width();
        let bright: Vec<(u32, u32)> = rotated
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] > 128)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert!(!bright.is_empty());
        let first_x = bright[0].0;
        assert!(bright.iter().all(|&(x, _)| x.abs_diff(first_x) <= 3));
        // Counter-clockwise: the row above the center lands left of it.
        assert!(first_x < side / 2);
        // Padding takes the background, not black.
        assert_eq!(rotated.get_pixel(0, 0).0[0], 10);
    }

    #[test]
    fn zero_rotation_borrows_the_input() {
        let img = GrayImage::new(10, 10);
        assert!(matches!(
            oriented(&img, &Parameters::default()),
            Cow::Borrowed(_)
        ));
        let p = Parameters {
            rotation_deg: 5.0,
            ..Parameters::default()
        };
        assert!(matches!(oriented(&img, &p), Cow::Owned(_)));
    }
}
