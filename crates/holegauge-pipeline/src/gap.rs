//! Lateral opening detection on the top surface.
//!
//! The hole mouth breaks the bright surface line. Around the estimated
//! surface row the detector looks for the widest white→black→white
//! crossing; on a binary mask every black run bounded by white is such a
//! crossing. Without one it assumes the central third of the image.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::profile::row;
use crate::types::{BLACK, WHITE};

/// Rows searched on each side of the surface estimate.
pub const SEARCH_HALF_WINDOW: u32 = 10;

/// How the opening was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapMethod {
    /// A white→black→white crossing on a scan line.
    Transition,
    /// No opening found; the central third of the image is assumed.
    CentralThird,
}

impl GapMethod {
    /// Returns `true` when the bounds are a default, not a detection.
    #[must_use]
    pub const fn is_fallback(self) -> bool {
        matches!(self, Self::CentralThird)
    }
}

/// Lateral bounds of the opening. `hole_start < hole_end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Last white column before the opening.
    pub hole_start: u32,
    /// Last black column of the opening.
    pub hole_end: u32,
    /// Row the bounds were measured on.
    pub row: u32,
    pub method: GapMethod,
}

impl Gap {
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.hole_end - self.hole_start
    }
}

/// Rows around `center` in the order they are searched: the center
/// first, then alternating above and below at growing distance. Rows
/// outside `[0, height)` are skipped.
fn search_rows(center: u32, height: u32) -> Vec<u32> {
    let lo = center.saturating_sub(SEARCH_HALF_WINDOW);
    let hi = center.saturating_add(SEARCH_HALF_WINDOW).min(height);
    let mut rows: Vec<u32> = (lo..hi).collect();
    rows.sort_by_key(|&r| (r.abs_diff(center), r > center));
    rows
}

/// Widest white→black→white crossing on `line` that is at least
/// `min_width` wide, as `(hole_start, hole_end)`.
///
/// `hole_start` is the last white pixel before the drop and `hole_end`
/// the last black pixel before the rise.
#[must_use]
pub fn widest_transition(line: &[u8], min_width: u32) -> Option<(u32, u32)> {
    let steps: Vec<usize> = (0..line.len().saturating_sub(1))
        .filter(|&i| line[i] != line[i + 1])
        .collect();

    let mut best: Option<(u32, u32)> = None;
    for (j, &fall) in steps.iter().enumerate() {
        if !(line[fall] == WHITE && line[fall + 1] == BLACK) {
            continue;
        }
        let Some(&rise) = steps[j + 1..]
            .iter()
            .find(|&&k| line[k] == BLACK && line[k + 1] == WHITE)
        else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u32::try_from(fall), u32::try_from(rise)) else {
            continue;
        };
        let width = end - start;
        if width >= min_width && best.is_none_or(|(s, e)| width > e - s) {
            best = Some((start, end));
        }
    }
    best
}

/// Scan every row of the window for crossings and keep the widest
/// result. Rows are visited nearest-first, so equal widths resolve to
/// the row closest to the estimate.
fn best_in_window(
    mask: &GrayImage,
    rows: &[u32],
    min_width: u32,
) -> Option<(u32, u32, u32)> {
    let mut best: Option<(u32, u32, u32)> = None;
    for &y in rows {
        if let Some((s, e)) = widest_transition(row(mask, y), min_width) {
            if best.is_none_or(|(bs, be, _)| e - s > be - bs) {
                best = Some((s, e, y));
            }
        }
    }
    best
}

/// Locate the hole opening near `upper_row`.
///
/// Never fails: when no crossing is found the central third of the image
/// is returned with [`GapMethod::CentralThird`].
#[must_use]
pub fn detect_gap(mask: &GrayImage, upper_row: u32, min_width: u32) -> Gap {
    let rows = search_rows(upper_row, mask.height());

    if let Some((hole_start, hole_end, row)) = best_in_window(mask, &rows, min_width) {
        debug!(hole_start, hole_end, row, "gap from transitions");
        return Gap {
            hole_start,
            hole_end,
            row,
            method: GapMethod::Transition,
        };
    }

    let w = mask.width();
    let hole_start = w / 3;
    let hole_end = (2 * w / 3).max(hole_start + 1);
    warn!(upper_row, hole_start, hole_end, "no gap found, assuming central third");
    Gap {
        hole_start,
        hole_end,
        row: upper_row,
        method: GapMethod::CentralThird,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;

    /// 300 wide, 500 tall; a 5-row white line centered on row 40 with a
    /// black opening over columns 121..=180.
    fn surface_with_gap() -> GrayImage {
        GrayImage::from_fn(300, 500, |x, y| {
            let on_line = (38..=42).contains(&y);
            let in_gap = (121..=180).contains(&x);
            Luma([if on_line && !in_gap { WHITE } else { BLACK }])
        })
    }

    #[test]
    fn finds_gap_on_surface_row() {
        let gap = detect_gap(&surface_with_gap(), 40, 50);
        assert_eq!(gap.method, GapMethod::Transition);
        assert_eq!((gap.hole_start, gap.hole_end), (120, 180));
        assert_eq!(gap.width(), 60);
        assert_eq!(gap.row, 40);
    }

    #[test]
    fn ties_resolve_to_row_nearest_estimate() {
        // Line rows 38..=42 all have the same gap; estimate 44 is nearest 42.
        let gap = detect_gap(&surface_with_gap(), 44, 50);
        assert_eq!(gap.row, 42);
    }

    #[test]
    fn narrow_gap_is_rejected() {
        let gap = detect_gap(&surface_with_gap(), 40, 61);
        assert!(gap.method.is_fallback());
    }

    #[test]
    fn all_white_row_falls_back_to_central_third() {
        let mask = GrayImage::from_pixel(300, 100, Luma([WHITE]));
        let gap = detect_gap(&mask, 50, 50);
        assert_eq!(gap.method, GapMethod::CentralThird);
        assert_eq!((gap.hole_start, gap.hole_end), (100, 200));
        assert_eq!(gap.row, 50);
    }

    #[test]
    fn central_third_keeps_start_before_end_on_tiny_images() {
        let mask = GrayImage::from_pixel(2, 4, Luma([WHITE]));
        let gap = detect_gap(&mask, 1, 50);
        assert!(gap.hole_start < gap.hole_end);
    }

    #[test]
    fn widest_transition_prefers_first_of_equal_widths() {
        let mut line = vec![WHITE; 40];
        line[5..10].fill(BLACK);
        line[20..25].fill(BLACK);
        assert_eq!(widest_transition(&line, 3), Some((4, 9)));
    }

    #[test]
    fn widest_transition_needs_rise() {
        let mut line = vec![WHITE; 20];
        line[10..].fill(BLACK);
        assert_eq!(widest_transition(&line, 1), None);
    }

    #[test]
    fn bounded_black_run_is_a_transition_and_edge_runs_are_not() {
        // Black at the left edge has no fall; black at the right edge no rise.
        let mut line = vec![WHITE; 40];
        line[0..8].fill(BLACK);
        line[12..20].fill(BLACK);
        line[30..].fill(BLACK);
        assert_eq!(widest_transition(&line, 5), Some((11, 19)));
    }

    #[test]
    fn search_rows_are_nearest_first_and_clipped() {
        let rows = search_rows(2, 100);
        assert_eq!(&rows[..4], &[2, 1, 3, 0]);
        assert_eq!(rows.len(), 12);
        assert!(rows.iter().all(|&r| r < 12));
    }
}
