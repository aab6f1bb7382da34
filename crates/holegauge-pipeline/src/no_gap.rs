//! Measurement of holes whose opening does not break the top surface.
//!
//! The top surface is the chosen surface line. Below it the mask is
//! opened with a long horizontal element, and the lowest remaining
//! segment is taken as the hole bottom: its width is the diameter and
//! its distance to the top surface the depth.

use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::binarize::{binarize, open_horizontal};
use crate::dimension::ratio;
use crate::rotate::oriented;
use crate::surface::find_surface_lines;
use crate::types::{MeasureError, Parameters};

/// Rows skipped below the top surface before searching for the bottom
/// segment.
pub const MIN_SEGMENT_OFFSET: u32 = 50;

/// Bounding box of a horizontal segment, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Result of a no-gap measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoGapMeasurement {
    pub top_row: u32,
    pub segment: Segment,
    pub diameter_um: f64,
    pub depth_um: f64,
    pub depth_to_diameter_ratio: f64,
}

/// Shoelace area of a closed contour.
fn polygon_area(points: &[imageproc::point::Point<u32>]) -> f64 {
    let n = points.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            f64::from(a.x).mul_add(f64::from(b.y), -(f64::from(b.x) * f64::from(a.y)))
        })
        .sum();
    twice.abs() / 2.0
}

/// Outer segments of `opened` whose area exceeds `min_area`, as bounding
/// boxes.
#[must_use]
pub fn horizontal_segments(opened: &GrayImage, min_area: f64) -> Vec<Segment> {
    find_contours::<u32>(opened)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| polygon_area(&c.points) > min_area)
        .filter_map(|c| {
            let left = c.points.iter().map(|p| p.x).min()?;
            let right = c.points.iter().map(|p| p.x).max()?;
            let top = c.points.iter().map(|p| p.y).min()?;
            let bottom = c.points.iter().map(|p| p.y).max()?;
            Some(Segment {
                left,
                top,
                width: right - left + 1,
                height: bottom - top + 1,
            })
        })
        .collect()
}

/// Measure a hole from its top surface and lowest bottom segment.
///
/// # Errors
///
/// Returns [`MeasureError::NotDetected`] when the `top_line_index`-th
/// surface line or a bottom segment is missing, and the errors of
/// [`Parameters::validate`] and [`binarize`].
pub fn measure_without_gap(
    image: &GrayImage,
    params: &Parameters,
) -> Result<NoGapMeasurement, MeasureError> {
    params.validate()?;
    let calibration = params.calibration()?;
    let image = oriented(image, params);
    let mask = binarize(&image, params)?;

    let lines = find_surface_lines(&mask, params.row_projection_threshold);
    let top_row = lines.get(params.top_line_index).ok_or_else(|| {
        MeasureError::NotDetected(format!(
            "top surface line {} (found {})",
            params.top_line_index,
            lines.len()
        ))
    })?;

    let start = top_row.saturating_add(MIN_SEGMENT_OFFSET);
    if start >= mask.height() {
        return Err(MeasureError::NotDetected(
            "no rows below the top surface".to_string(),
        ));
    }
    let below = image::imageops::crop_imm(&mask, 0, start, mask.width(), mask.height() - start)
        .to_image();
    let opened = open_horizontal(&below, params.horizontal_kernel_size);

    let segment = horizontal_segments(&opened, f64::from(params.short_line_min_length))
        .into_iter()
        .fold(None::<Segment>, |best, s| match best {
            Some(b) if b.top >= s.top => Some(b),
            _ => Some(s),
        })
        .map(|s| Segment {
            top: s.top + start,
            ..s
        })
        .ok_or_else(|| MeasureError::NotDetected("bottom segment".to_string()))?;

    let diameter_um = calibration.lateral_um(f64::from(segment.width));
    let depth_um = calibration.vertical_um(f64::from(segment.top - top_row));
    info!(top_row, ?segment, diameter_um, depth_um, "no-gap measurement");
    Ok(NoGapMeasurement {
        top_row,
        segment,
        diameter_um,
        depth_um,
        depth_to_diameter_ratio: ratio(depth_um, diameter_um),
    })
}
