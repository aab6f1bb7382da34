//! Gaussian smoothing expressed as an odd kernel size.
//!
//! Parameters carry kernel sizes in pixels. [`sigma_for_kernel`] turns a
//! size into the matching standard deviation so that
//! [`imageproc::filter::gaussian_blur_f32`] can do the work.

use image::GrayImage;

/// Bump an even size to the next odd value. Zero becomes one.
#[must_use]
pub const fn odd_kernel(size: u32) -> u32 {
    if size % 2 == 0 { size + 1 } else { size }
}

/// Standard deviation of a Gaussian whose support is `size` pixels.
///
/// `0.3 * ((size - 1) * 0.5 - 1) + 0.8`, applied after [`odd_kernel`].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sigma_for_kernel(size: u32) -> f32 {
    let k = odd_kernel(size) as f32;
    0.3f32.mul_add((k - 1.0).mul_add(0.5, -1.0), 0.8)
}

/// Smooth `image` with a Gaussian of the given kernel size.
///
/// Sizes of one pixel or less return the image unchanged.
#[must_use = "returns the smoothed image"]
pub fn smooth(image: &GrayImage, kernel_size: u32) -> GrayImage {
    if kernel_size <= 1 {
        return image.clone();
    }
    imageproc::filter::gaussian_blur_f32(image, sigma_for_kernel(kernel_size))
}
