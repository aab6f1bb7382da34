//! Image decoding and grayscale conversion.
//!
//! Accepts raw image bytes (PNG, JPEG, BMP, WebP, TIFF) and produces a
//! single-channel grayscale image. Micrographs and OCT slices are often
//! saved as RGB even when the content is monochrome, so everything goes
//! through luminance conversion.

use image::GrayImage;

use crate::types::MeasureError;

/// Decode raw image bytes and convert to grayscale.
///
/// # Errors
///
/// Returns [`MeasureError::EmptyInput`] if `bytes` is empty or decodes to
/// a zero-sized image.
/// Returns [`MeasureError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
pub fn decode_and_grayscale(bytes: &[u8]) -> Result<GrayImage, MeasureError> {
    if bytes.is_empty() {
        return Err(MeasureError::EmptyInput);
    }

    let gray = image::load_from_memory(bytes)?.to_luma8();
    crate::types::ensure_non_empty(&gray)?;
    Ok(gray)
}
