//! Inner-wall roughness.
//!
//! The mask is cut down to the hole's bounding rectangle, its edges are
//! traced, and tall narrow contours are kept as wall segments. All wall
//! points are projected onto their principal axis; the spread of the
//! perpendicular deviations gives the score `100 / (1 + std)`, so a
//! perfectly straight wall scores 100.

use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::profile::mean_std;
use crate::types::{HoleBounds, MeasureError, Point};

/// Canny thresholds for wall edges.
pub const CANNY_LOW: f32 = 50.0;
pub const CANNY_HIGH: f32 = 150.0;

/// A wall contour must have more points than this fraction of the depth.
pub const MIN_LENGTH_FRACTION: f64 = 0.3;

/// Tortuosity of a perfectly straight wall.
pub const STRAIGHT_WALL_TORTUOSITY: f64 = 1.0;

/// Black border added around Canny input.
///
/// `imageproc::edges::canny` hysteresis can index past the image edge
/// when edge pixels touch the border
/// (<https://github.com/image-rs/imageproc/issues/705>).
const CANNY_PAD: u32 = 8;

/// Qualitative roughness band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoughnessGrade {
    VerySmooth,
    Smooth,
    Average,
    Rough,
}

impl RoughnessGrade {
    /// Grade a score: above 80, 60 and 40 are the band boundaries.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score > 80.0 {
            Self::VerySmooth
        } else if score > 60.0 {
            Self::Smooth
        } else if score > 40.0 {
            Self::Average
        } else {
            Self::Rough
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::VerySmooth => "very smooth",
            Self::Smooth => "smooth",
            Self::Average => "average",
            Self::Rough => "rough",
        }
    }
}

/// Result of roughness analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoughnessReport {
    /// `100 / (1 + deviation_std)`, in `(0, 100]`.
    pub score: f64,
    pub grade: RoughnessGrade,
    /// Standard deviation of perpendicular wall deviation, in pixels.
    pub deviation_std: f64,
    /// Number of contours accepted as wall segments.
    pub contour_count: usize,
    /// Mean ratio of traced wall length to straight wall length; 1 for a
    /// straight wall.
    pub mean_tortuosity: f64,
}

/// Canny with a temporary black border so hysteresis never reaches the
/// image edge.
#[must_use = "returns the edge map"]
pub fn canny_padded(image: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut padded = GrayImage::new(w + 2 * CANNY_PAD, h + 2 * CANNY_PAD);
    image::imageops::replace(&mut padded, image, i64::from(CANNY_PAD), i64::from(CANNY_PAD));
    let edges = imageproc::edges::canny(&padded, low, high);
    image::imageops::crop_imm(&edges, CANNY_PAD, CANNY_PAD, w, h).to_image()
}

/// `mask` with everything outside the hole rectangle cleared.
#[must_use = "returns the masked region"]
pub fn hole_region(mask: &GrayImage, bounds: &HoleBounds) -> GrayImage {
    let cols = bounds.hole_start..=bounds.hole_end;
    let rows = bounds.upper_row..=bounds.bottom_row;
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if cols.contains(&x) && rows.contains(&y) {
            *mask.get_pixel(x, y)
        } else {
            Luma([0])
        }
    })
}

/// Outer contours of `edges` that look like wall segments: taller than
/// twice their width and longer than [`MIN_LENGTH_FRACTION`] of
/// `depth_px`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn wall_contours(edges: &GrayImage, depth_px: u32) -> Vec<Vec<Point>> {
    let min_len = MIN_LENGTH_FRACTION * f64::from(depth_px);
    find_contours::<u32>(edges)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| c.points.len() as f64 > min_len)
        .filter_map(|c| {
            let xs = c.points.iter().map(|p| p.x);
            let ys = c.points.iter().map(|p| p.y);
            let width = xs.clone().max()? - xs.min()? + 1;
            let height = ys.clone().max()? - ys.min()? + 1;
            (height > 2 * width).then(|| {
                c.points
                    .iter()
                    .map(|p| Point::new(f64::from(p.x), f64::from(p.y)))
                    .collect()
            })
        })
        .collect()
}

/// Perpendicular distances of `points` from their principal axis.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn principal_axis_deviations(points: &[Point]) -> Vec<f64> {
    if points.is_empty() {
        return Vec::new();
    }
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let my = points.iter().map(|p| p.y).sum::<f64>() / n;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p.x - mx, p.y - my);
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    let eig = Matrix2::new(sxx / n, sxy / n, sxy / n, syy / n).symmetric_eigen();
    let axis = eig.eigenvectors.column(eig.eigenvalues.imax()).into_owned();
    let normal = (-axis[1], axis[0]);
    points
        .iter()
        .map(|p| (p.x - mx).mul_add(normal.0, (p.y - my) * normal.1).abs())
        .collect()
}

/// Half the traced border length over the vertical extent.
fn tortuosity(points: &[Point]) -> Option<f64> {
    let perimeter: f64 = points.windows(2).map(|w| w[0].distance(w[1])).sum();
    let top = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let bottom = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    let extent = bottom - top;
    (extent > 0.0).then(|| perimeter / 2.0 / extent)
}

/// Mean tortuosity over `walls`; a straight wall (1.0) when none has a
/// vertical extent.
fn mean_tortuosity(walls: &[Vec<Point>]) -> f64 {
    let ratios: Vec<f64> = walls.iter().filter_map(|w| tortuosity(w)).collect();
    if ratios.is_empty() {
        return STRAIGHT_WALL_TORTUOSITY;
    }
    mean_std(&ratios).0
}

/// Score the inner-wall roughness of the hole in `mask`.
///
/// # Errors
///
/// Returns [`MeasureError::RoughnessUnavailable`] if no contour inside
/// the hole rectangle qualifies as a wall segment.
#[allow(clippy::cast_precision_loss)]
pub fn analyze_roughness(
    mask: &GrayImage,
    bounds: &HoleBounds,
) -> Result<RoughnessReport, MeasureError> {
    let edges = canny_padded(&hole_region(mask, bounds), CANNY_LOW, CANNY_HIGH);
    let walls = wall_contours(&edges, bounds.depth_px());
    if walls.is_empty() {
        return Err(MeasureError::RoughnessUnavailable);
    }

    let points: Vec<Point> = walls.iter().flatten().copied().collect();
    let (_, deviation_std) = mean_std(&principal_axis_deviations(&points));
    let score = 100.0 / (1.0 + deviation_std);

    let mean_tortuosity = mean_tortuosity(&walls);

    debug!(
        contours = walls.len(),
        points = points.len(),
        deviation_std,
        score,
        "roughness"
    );
    Ok(RoughnessReport {
        score,
        grade: RoughnessGrade::from_score(score),
        deviation_std,
        contour_count: walls.len(),
        mean_tortuosity,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::types::WHITE;

    fn bounds() -> HoleBounds {
        HoleBounds {
            hole_start: 100,
            hole_end: 200,
            upper_row: 40,
            bottom_row: 300,
            lateral_fallback: false,
            bottom_fallback: false,
        }
    }

    /// Solid walls over columns 100..130 and 171..=200, black between.
    fn walled_mask() -> GrayImage {
        GrayImage::from_fn(300, 360, |x, _| {
            Luma([if x < 130 || x > 170 { WHITE } else { 0 }])
        })
    }

    #[test]
    fn grades_partition_scores() {
        assert_eq!(RoughnessGrade::from_score(95.0), RoughnessGrade::VerySmooth);
        assert_eq!(RoughnessGrade::from_score(80.0), RoughnessGrade::Smooth);
        assert_eq!(RoughnessGrade::from_score(60.5), RoughnessGrade::Smooth);
        assert_eq!(RoughnessGrade::from_score(41.0), RoughnessGrade::Average);
        assert_eq!(RoughnessGrade::from_score(40.0), RoughnessGrade::Rough);
        assert_eq!(RoughnessGrade::Rough.label(), "rough");
    }

    #[test]
    fn deviations_vanish_for_collinear_points() {
        let pts: Vec<Point> = (0..20)
            .map(|i| Point::new(f64::from(i), 2.0 * f64::from(i)))
            .collect();
        for d in principal_axis_deviations(&pts) {
            assert!(d < 1e-9);
        }
    }

    #[test]
    fn deviations_measure_offset_from_axis() {
        // Two vertical lines at x = -1 and x = 1.
        let pts: Vec<Point> = (0..50)
            .flat_map(|i| [Point::new(-1.0, f64::from(i)), Point::new(1.0, f64::from(i))])
            .collect();
        for d in principal_axis_deviations(&pts) {
            assert_relative_eq!(d, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn hole_region_clears_outside_rectangle() {
        let region = hole_region(&walled_mask(), &bounds());
        assert_eq!(region.get_pixel(110, 100).0[0], WHITE);
        assert_eq!(region.get_pixel(50, 100).0[0], 0);
        assert_eq!(region.get_pixel(110, 20).0[0], 0);
    }

    #[test]
    fn canny_on_border_touching_content_does_not_panic() {
        let img = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 0 } else { 255 }]));
        let edges = canny_padded(&img, 1.0, 2.0);
        assert_eq!(edges.dimensions(), (20, 20));
        assert!(edges.pixels().any(|p| p.0[0] == WHITE));
    }

    #[test]
    fn walls_produce_a_score() {
        let report = analyze_roughness(&walled_mask(), &bounds()).unwrap();
        assert!(report.contour_count >= 1);
        assert!(report.score > 0.0 && report.score <= 100.0);
        assert_eq!(report.grade, RoughnessGrade::from_score(report.score));
        assert!(report.mean_tortuosity > 0.9);
    }

    #[test]
    fn flat_walls_default_to_straight_tortuosity() {
        let flat = vec![vec![Point::new(0.0, 5.0), Point::new(4.0, 5.0)]];
        assert_relative_eq!(mean_tortuosity(&flat), STRAIGHT_WALL_TORTUOSITY);
        assert_relative_eq!(mean_tortuosity(&[]), STRAIGHT_WALL_TORTUOSITY);

        // Down and back up a vertical segment traces twice its length.
        let straight = vec![vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(0.0, 0.0),
        ]];
        assert_relative_eq!(mean_tortuosity(&straight), 1.0);
    }

    #[test]
    fn empty_hole_cannot_be_scored() {
        let mask = GrayImage::new(300, 360);
        let result = analyze_roughness(&mask, &bounds());
        assert!(matches!(result, Err(MeasureError::RoughnessUnavailable)));
    }

    #[test]
    fn short_contours_are_not_walls() {
        let mut edges = GrayImage::new(50, 50);
        for y in 10..20 {
            edges.put_pixel(25, y, Luma([WHITE]));
        }
        assert!(wall_contours(&edges, 200).is_empty());
        assert_eq!(wall_contours(&edges, 20).len(), 1);
    }
}
