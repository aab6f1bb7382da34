//! True hole diameter from OCT slices.
//!
//! Each slice is a cross-section at a known scan position whose two
//! endpoints mark where the hole boundary crosses the slice. Endpoints
//! are placed in a plane as `(x * pixel_to_um_x, scan_position)` and a
//! circle is fitted through them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circle::{CircleFitResult, FitMethod, fit_circle};
use crate::gap::Gap;
use crate::types::{MeasureError, Point};

/// One OCT cross-section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    /// Position along the scan axis, in micrometres.
    pub scan_position: f64,
    /// First boundary crossing, in pixels.
    pub endpoint_a: Option<Point>,
    /// Second boundary crossing, in pixels.
    pub endpoint_b: Option<Point>,
    /// Lateral scale of this slice.
    pub pixel_to_um_x: f64,
}

impl SliceRecord {
    /// A slice without endpoints yet.
    #[must_use]
    pub const fn new(scan_position: f64, pixel_to_um_x: f64) -> Self {
        Self {
            scan_position,
            endpoint_a: None,
            endpoint_b: None,
            pixel_to_um_x,
        }
    }

    #[must_use]
    pub fn with_endpoints(mut self, a: Point, b: Point) -> Self {
        self.endpoint_a = Some(a);
        self.endpoint_b = Some(b);
        self
    }

    /// Set both endpoints. Endpoints are written once per slice.
    ///
    /// # Errors
    ///
    /// Returns [`MeasureError::InvalidInput`] if the slice already has
    /// endpoints.
    pub fn record_endpoints(&mut self, a: Point, b: Point) -> Result<(), MeasureError> {
        if self.endpoint_a.is_some() || self.endpoint_b.is_some() {
            return Err(MeasureError::InvalidInput(format!(
                "slice at {} already has endpoints",
                self.scan_position
            )));
        }
        self.endpoint_a = Some(a);
        self.endpoint_b = Some(b);
        Ok(())
    }

    /// Endpoints taken from a detected opening on the slice image.
    #[must_use]
    pub fn from_gap(scan_position: f64, pixel_to_um_x: f64, gap: &Gap) -> Self {
        let y = f64::from(gap.row);
        Self::new(scan_position, pixel_to_um_x).with_endpoints(
            Point::new(f64::from(gap.hole_start), y),
            Point::new(f64::from(gap.hole_end), y),
        )
    }

    /// Both endpoints, if set.
    #[must_use]
    pub const fn endpoints(&self) -> Option<(Point, Point)> {
        match (self.endpoint_a, self.endpoint_b) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }

    /// Chord length in micrometres.
    #[must_use]
    pub fn chord_um(&self) -> Option<f64> {
        self.endpoints()
            .map(|(a, b)| (b.x - a.x).abs() * self.pixel_to_um_x)
    }
}

/// Build slices from `[x1, y1, x2, y2]` endpoint rows and their scan
/// positions.
///
/// # Errors
///
/// Returns [`MeasureError::InvalidInput`] if the two lists differ in
/// length, and [`MeasureError::Configuration`] for a non-positive scale.
pub fn slices_from_rows(
    rows: &[[f64; 4]],
    scan_positions: &[f64],
    pixel_to_um_x: f64,
) -> Result<Vec<SliceRecord>, MeasureError> {
    if rows.len() != scan_positions.len() {
        return Err(MeasureError::InvalidInput(format!(
            "{} endpoint rows but {} scan positions",
            rows.len(),
            scan_positions.len()
        )));
    }
    if !pixel_to_um_x.is_finite() || pixel_to_um_x <= 0.0 {
        return Err(MeasureError::Configuration(format!(
            "pixel_to_um_x must be positive, got {pixel_to_um_x}"
        )));
    }
    Ok(rows
        .iter()
        .zip(scan_positions)
        .map(|(&[x1, y1, x2, y2], &position)| {
            SliceRecord::new(position, pixel_to_um_x)
                .with_endpoints(Point::new(x1, y1), Point::new(x2, y2))
        })
        .collect())
}

/// Planar point cloud in micrometres, two points per slice with
/// endpoints, in slice order.
///
/// With `align_midpoints` every pair is shifted horizontally so its
/// midpoint matches the first pair's midpoint, removing stage drift.
#[must_use]
pub fn point_cloud(slices: &[SliceRecord], align_midpoints: bool) -> Vec<[Point; 2]> {
    let mut pairs: Vec<[Point; 2]> = slices
        .iter()
        .filter_map(|s| {
            let (a, b) = s.endpoints()?;
            Some([
                Point::new(a.x * s.pixel_to_um_x, s.scan_position),
                Point::new(b.x * s.pixel_to_um_x, s.scan_position),
            ])
        })
        .collect();

    if align_midpoints && let Some(first) = pairs.first() {
        let reference = f64::midpoint(first[0].x, first[1].x);
        for pair in &mut pairs {
            let shift = reference - f64::midpoint(pair[0].x, pair[1].x);
            pair[0].x += shift;
            pair[1].x += shift;
        }
    }
    pairs
}

/// How to reconstruct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionOptions {
    pub method: FitMethod,
    pub align_midpoints: bool,
}

/// Fit the hole's circle through the slice endpoints.
///
/// Slices without endpoints are skipped.
///
/// # Errors
///
/// Returns [`MeasureError::Fit`] when fewer than three points remain or
/// the points do not determine a circle.
pub fn reconstruct(
    slices: &[SliceRecord],
    options: ReconstructionOptions,
) -> Result<CircleFitResult, MeasureError> {
    let pairs = point_cloud(slices, options.align_midpoints);
    debug!(
        slices = slices.len(),
        usable = pairs.len(),
        aligned = options.align_midpoints,
        "reconstruction input"
    );
    let points: Vec<Point> = pairs.into_iter().flatten().collect();
    let fit = fit_circle(&points, options.method)?;
    info!(
        method = fit.method.as_str(),
        diameter_um = fit.diameter_um(),
        mean_residual = fit.mean_residual,
        "reconstructed hole"
    );
    Ok(fit)
}
