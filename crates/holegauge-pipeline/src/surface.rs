//! Horizontal surface line detection.
//!
//! The polished top surface and any interior bottom surface show up in
//! the mask as rows that are mostly foreground. [`find_surface_lines`]
//! smooths the row projection, keeps rows above a percentage of its
//! maximum and collapses nearby rows into one line per cluster.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::profile::{moving_average, row_projection};
use crate::types::Source;

/// Width of the moving average applied to the row projection.
pub const PROJECTION_SMOOTHING: usize = 5;

/// Rows at most this far apart belong to the same line.
pub const GROUPING_GAP: usize = 5;

/// Detected surface rows, strictly increasing from top to bottom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceSet(Vec<u32>);

impl SurfaceSet {
    /// Row indices, top to bottom.
    #[must_use]
    pub fn rows(&self) -> &[u32] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `index`-th line from the top, if there is one.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<u32> {
        self.0.get(index).copied()
    }
}

/// A chosen surface row and whether it was detected or defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceSelection {
    pub row: u32,
    pub source: Source,
}

/// Row projection of `mask` after the moving average.
#[must_use]
pub fn smoothed_projection(mask: &GrayImage) -> Vec<f64> {
    moving_average(&row_projection(mask), PROJECTION_SMOOTHING)
}

/// Find the rows of horizontal surface lines in `mask`.
///
/// `threshold_pct` is a percentage of the smoothed projection maximum;
/// rows strictly above it are significant. An all-black mask yields an
/// empty set.
#[must_use]
pub fn find_surface_lines(mask: &GrayImage, threshold_pct: u32) -> SurfaceSet {
    let smoothed = smoothed_projection(mask);
    let max = smoothed.iter().copied().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return SurfaceSet::default();
    }
    let threshold = max * f64::from(threshold_pct) / 100.0;

    let significant: Vec<usize> = smoothed
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v > threshold)
        .map(|(i, _)| i)
        .collect();

    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in significant {
        match groups.last_mut() {
            Some(group) if group.last().is_some_and(|&last| i - last <= GROUPING_GAP) => {
                group.push(i);
            }
            _ => groups.push(vec![i]),
        }
    }

    let rows: Vec<u32> = groups
        .iter()
        .filter_map(|g| {
            let sum: usize = g.iter().sum();
            u32::try_from(sum / g.len()).ok()
        })
        .collect();
    debug!(?rows, threshold, "surface lines");
    SurfaceSet(rows)
}

/// Pick the top surface: the `index`-th line, or a quarter of the image
/// height when there are not enough lines.
#[must_use]
pub fn select_top(lines: &SurfaceSet, index: usize, image_height: u32) -> SurfaceSelection {
    lines.get(index).map_or_else(
        || {
            let row = image_height / 4;
            warn!(index, found = lines.len(), row, "top surface line missing, using default");
            SurfaceSelection {
                row,
                source: Source::Fallback,
            }
        },
        |row| SurfaceSelection {
            row,
            source: Source::Detected,
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::types::WHITE;

    /// Mask with full-width white bands of `thickness` rows centered on
    /// each row in `centers`.
    fn banded_mask(width: u32, height: u32, centers: &[u32], thickness: u32) -> GrayImage {
        let half = thickness / 2;
        GrayImage::from_fn(width, height, |_, y| {
            let on = centers.iter().any(|&c| y + half >= c && y <= c + half);
            Luma([if on { WHITE } else { 0 }])
        })
    }

    #[test]
    fn finds_each_band_center() {
        let mask = banded_mask(50, 200, &[40, 120], 5);
        let lines = find_surface_lines(&mask, 70);
        assert_eq!(lines.rows(), &[40, 120]);
    }

    #[test]
    fn lines_are_strictly_increasing() {
        let mask = banded_mask(50, 300, &[20, 60, 150, 260], 3);
        let lines = find_surface_lines(&mask, 50);
        assert!(lines.rows().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn near_bands_merge_into_one_line() {
        // Bands two rows apart fall inside the grouping gap.
        let mask = banded_mask(50, 100, &[40, 43], 1);
        let lines = find_surface_lines(&mask, 30);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn weak_rows_below_threshold_are_ignored() {
        let mut mask = banded_mask(100, 120, &[30], 5);
        // short segment: 10 of 100 pixels on row 90
        for x in 0..10 {
            mask.put_pixel(x, 90, Luma([WHITE]));
        }
        let lines = find_surface_lines(&mask, 70);
        assert_eq!(lines.rows(), &[30]);
    }

    #[test]
    fn empty_mask_has_no_lines() {
        let mask = GrayImage::new(40, 40);
        assert!(find_surface_lines(&mask, 70).is_empty());
    }

    #[test]
    fn select_top_uses_index() {
        let lines = SurfaceSet(vec![10, 50, 90]);
        let sel = select_top(&lines, 1, 400);
        assert_eq!(sel.row, 50);
        assert_eq!(sel.source, Source::Detected);
    }

    #[test]
    fn select_top_out_of_range_falls_back_to_quarter_height() {
        let lines = SurfaceSet(vec![10]);
        let sel = select_top(&lines, 1, 400);
        assert_eq!(sel.row, 100);
        assert!(sel.source.is_fallback());
    }
}
