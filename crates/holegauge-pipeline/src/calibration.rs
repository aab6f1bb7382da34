//! Pixel scale from a feature of known size.

use tracing::debug;

use crate::types::{MeasureError, Point};

/// Micrometres per pixel for a feature `known_um` long that spans
/// `pixel_distance` pixels.
///
/// # Errors
///
/// Returns [`MeasureError::Configuration`] unless both values are
/// positive and finite.
pub fn conversion_factor(known_um: f64, pixel_distance: f64) -> Result<f64, MeasureError> {
    if !known_um.is_finite() || known_um <= 0.0 {
        return Err(MeasureError::Configuration(format!(
            "known length must be positive, got {known_um}"
        )));
    }
    if !pixel_distance.is_finite() || pixel_distance <= 0.0 {
        return Err(MeasureError::Configuration(format!(
            "pixel distance must be positive, got {pixel_distance}"
        )));
    }
    let factor = known_um / pixel_distance;
    debug!(known_um, pixel_distance, factor, "conversion factor");
    Ok(factor)
}

/// [`conversion_factor`] for a feature marked by two image points.
///
/// Only the horizontal separation counts, so the result applies to the
/// lateral axis.
///
/// # Errors
///
/// As [`conversion_factor`]; coincident columns give a zero distance.
pub fn lateral_factor(known_um: f64, a: Point, b: Point) -> Result<f64, MeasureError> {
    conversion_factor(known_um, (b.x - a.x).abs())
}
