//! Pixel bounds to physical dimensions.
//!
//! Lateral distances use `pixel_to_um_x`, vertical distances use
//! `pixel_to_um_y`. Besides the opening width the hole is measured
//! again 0.1 mm inside each surface, where the wall is no longer
//! rounded by polishing; the mean of those two readings feeds a short
//! rolling history that stabilizes the reported standard diameter.

use std::collections::VecDeque;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::profile::row;
use crate::types::{BLACK, Calibration, HoleBounds, MeasureError, Measurement, WHITE};

/// Inset from each surface for the secondary diameters, in micrometres.
pub const SECONDARY_OFFSET_UM: f64 = 100.0;

/// Columns searched on each side of a known bound when re-locating it.
pub const EDGE_TOLERANCE: u32 = 10;

/// Rows above the bottom searched for a wall pair giving the bottom width.
pub const BOTTOM_WIDTH_SEARCH_ROWS: u32 = 20;

/// Bottom width as a fraction of the opening when no wall pair is found
/// near the bottom.
pub const BOTTOM_WIDTH_FALLBACK_FRACTION: f64 = 0.85;

/// Wall edges found on one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEdges {
    pub row: u32,
    pub left: u32,
    pub right: u32,
    /// `false` when the known bounds were reused unchanged.
    pub refined: bool,
}

impl RowEdges {
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.right - self.left
    }
}

/// The 0.1 mm inset expressed in rows.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn secondary_offset_rows(calibration: Calibration) -> u32 {
    (SECONDARY_OFFSET_UM / calibration.pixel_to_um_y) as u32
}

fn find_step(line: &[u8], around: u32, from: u8, to: u8) -> Option<u32> {
    let last = line.len().saturating_sub(1);
    let lo = around.saturating_sub(EDGE_TOLERANCE) as usize;
    let hi = (around.saturating_add(EDGE_TOLERANCE) as usize).min(last);
    (lo..hi)
        .find(|&i| line[i] == from && line[i + 1] == to)
        .and_then(|i| u32::try_from(i).ok())
}

/// Re-locate the hole walls on `y` near the known bounds.
///
/// The left wall is the first white→black step within
/// [`EDGE_TOLERANCE`] of `hole_start`, the right wall the first
/// black→white step within [`EDGE_TOLERANCE`] of `hole_end`. Sides that
/// are not found keep their known bound; if that leaves the walls
/// crossed, both known bounds are used. Returns `None` if `y` is not a
/// row of `mask`.
#[must_use]
pub fn edges_at_row(mask: &GrayImage, y: u32, hole_start: u32, hole_end: u32) -> Option<RowEdges> {
    if y >= mask.height() {
        return None;
    }
    let line = row(mask, y);
    let found_left = find_step(line, hole_start, WHITE, BLACK);
    let found_right = find_step(line, hole_end, BLACK, WHITE);

    let left = found_left.unwrap_or(hole_start);
    let right = found_right.unwrap_or(hole_end);
    if left >= right {
        return Some(RowEdges {
            row: y,
            left: hole_start,
            right: hole_end,
            refined: false,
        });
    }
    Some(RowEdges {
        row: y,
        left,
        right,
        refined: found_left.is_some() || found_right.is_some(),
    })
}

/// Width of the hole just above its bottom, in pixels.
///
/// Walks up from the row above `bottom_row` for at most
/// [`BOTTOM_WIDTH_SEARCH_ROWS`] rows, staying below `upper_row`, and
/// returns the first row whose walls are both re-located. Without one
/// the width is [`BOTTOM_WIDTH_FALLBACK_FRACTION`] of the opening.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn bottom_width_px(mask: &GrayImage, bounds: &HoleBounds) -> u32 {
    let lowest = bounds.bottom_row.min(mask.height());
    let highest = bounds
        .upper_row
        .saturating_add(1)
        .max(lowest.saturating_sub(BOTTOM_WIDTH_SEARCH_ROWS));
    (highest..lowest)
        .rev()
        .filter_map(|y| edges_at_row(mask, y, bounds.hole_start, bounds.hole_end))
        .find(|e| e.refined)
        .map_or_else(
            || {
                debug!("no wall pair above the bottom, estimating its width");
                (f64::from(bounds.width_px()) * BOTTOM_WIDTH_FALLBACK_FRACTION).round() as u32
            },
            |e| e.width(),
        )
}

/// Bounded FIFO of recent standard-diameter estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiameterHistory {
    values: VecDeque<f64>,
}

impl DiameterHistory {
    /// Maximum number of remembered values.
    pub const CAPACITY: usize = 3;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value, evicting the oldest beyond [`Self::CAPACITY`].
    /// Non-positive or non-finite values are ignored; returns whether the
    /// value was recorded.
    pub fn push(&mut self, value: f64) -> bool {
        if !value.is_finite() || value <= 0.0 {
            return false;
        }
        if self.values.len() == Self::CAPACITY {
            self.values.pop_front();
        }
        self.values.push_back(value);
        true
    }

    /// Mean of the remembered values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Push `measurement`'s standard diameter and replace it with the
    /// history mean, updating the depth ratio to match.
    pub fn stabilize(&mut self, measurement: &mut Measurement) {
        self.push(measurement.standard_diameter_um);
        if let Some(mean) = self.mean() {
            measurement.standard_diameter_um = mean;
            measurement.depth_to_diameter_ratio = ratio(measurement.depth_um, mean);
        }
    }
}

/// Taper of a hole wall between two lateral widths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaperReport {
    /// `(top - bottom) / (2 h)`.
    pub taper: f64,
    /// `atan(taper)` in degrees.
    pub angle_deg: f64,
    /// `(top - bottom) / h × 100`.
    pub percent: f64,
    /// Full-width angle `atan2((top - bottom) / 2, h)` in degrees.
    pub wall_angle_deg: f64,
}

/// Compute the taper between a top and a bottom width `height` apart.
///
/// All three values share one unit.
///
/// # Errors
///
/// Returns [`MeasureError::Configuration`] if `height` or either width is
/// not positive.
pub fn taper(top_width: f64, bottom_width: f64, height: f64) -> Result<TaperReport, MeasureError> {
    if height.is_nan() || height <= 0.0 {
        return Err(MeasureError::Configuration(format!(
            "taper height must be positive, got {height}"
        )));
    }
    if top_width.is_nan() || bottom_width.is_nan() || top_width <= 0.0 || bottom_width <= 0.0 {
        return Err(MeasureError::Configuration(format!(
            "taper widths must be positive, got top {top_width}, bottom {bottom_width}"
        )));
    }
    let delta = top_width - bottom_width;
    let t = delta / (2.0 * height);
    Ok(TaperReport {
        taper: t,
        angle_deg: t.atan().to_degrees(),
        percent: delta / height * 100.0,
        wall_angle_deg: (delta / 2.0).atan2(height).to_degrees(),
    })
}

/// `depth / diameter`, or zero when the diameter is zero.
#[must_use]
pub fn ratio(depth: f64, diameter: f64) -> f64 {
    if diameter > 0.0 { depth / diameter } else { 0.0 }
}

/// Standard diameter from the two secondary readings.
///
/// Mean of both when both are positive, else whichever is positive,
/// else `primary`.
#[must_use]
pub fn standard_diameter(upper: f64, lower: f64, primary: f64) -> f64 {
    match (upper > 0.0, lower > 0.0) {
        (true, true) => f64::midpoint(upper, lower),
        (true, false) => upper,
        (false, true) => lower,
        (false, false) => primary,
    }
}

/// Secondary measurement rows: `offset` below the top and above the
/// bottom, clamped to the image.
#[must_use]
pub fn secondary_rows(bounds: &HoleBounds, offset: u32, image_height: u32) -> (u32, u32) {
    let last = image_height.saturating_sub(1);
    (
        bounds.upper_row.saturating_add(offset).min(last),
        bounds.bottom_row.saturating_sub(offset).min(last),
    )
}

/// Measure the hole described by `bounds`.
///
/// `bottom_width_px` is the lateral extent of the bottom surface when
/// it is known (see [`bottom_width_px`]); without it the taper fields
/// are `None`. The returned
/// standard diameter is this image's own estimate; pass the result
/// through [`DiameterHistory::stabilize`] for the rolling value.
#[must_use]
pub fn measure_dimensions(
    mask: &GrayImage,
    bounds: &HoleBounds,
    calibration: Calibration,
    bottom_width_px: Option<u32>,
) -> Measurement {
    let diameter_um = calibration.lateral_um(f64::from(bounds.width_px()));
    let depth_um = calibration.vertical_um(f64::from(bounds.depth_px()));

    let offset = secondary_offset_rows(calibration);
    let (upper_y, lower_y) = secondary_rows(bounds, offset, mask.height());
    let secondary = |y| {
        edges_at_row(mask, y, bounds.hole_start, bounds.hole_end)
            .map_or(0.0, |e| calibration.lateral_um(f64::from(e.width())))
    };
    let upper_diam_um = secondary(upper_y);
    let lower_diam_um = secondary(lower_y);
    let standard = standard_diameter(upper_diam_um, lower_diam_um, diameter_um);

    let taper_report = bottom_width_px.and_then(|w| {
        taper(diameter_um, calibration.lateral_um(f64::from(w)), depth_um).ok()
    });

    debug!(
        diameter_um,
        depth_um, upper_diam_um, lower_diam_um, standard, "dimensions"
    );

    Measurement {
        diameter_um,
        depth_um,
        upper_diam_um,
        lower_diam_um,
        standard_diameter_um: standard,
        depth_to_diameter_ratio: ratio(depth_um, standard),
        taper: taper_report.map(|t| t.taper),
        taper_angle_deg: taper_report.map(|t| t.angle_deg),
        roughness_score: None,
    }
}
