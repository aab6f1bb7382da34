//! Hole bottom detection.
//!
//! The bottom of a blind hole is much harder to see than the top
//! surface: it is short, often faint, and competes with wall debris.
//! Each [`BottomStrategy`] proposes scored [`BottomCandidate`]s
//! independently, and [`select_candidate`] applies one explicit rule to
//! the pooled candidates:
//!
//! 1. Candidates less than [`MIN_VALID_DEPTH`] rows below the top
//!    surface, or outside the search rows, are discarded.
//! 2. If any [`BottomStrategy::ShortLine`] candidate remains, the best
//!    of those wins.
//! 3. Otherwise the highest score wins. Equal scores go to the
//!    strategy listed first in [`BottomStrategy::ALL`], then to the
//!    shallower row.
//!
//! When nothing survives, [`fallback_row`] estimates the bottom from the
//! reference depth.

use std::cmp::Ordering;
use std::ops::Range;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::binarize::{open_horizontal, otsu_threshold};
use crate::profile::{
    band_projection, gradient, longest_white_run, mean_std, moving_average, row, row_projection,
    runs_of, strongest_per_run, white_ratio,
};
use crate::surface::{PROJECTION_SMOOTHING, SurfaceSet, smoothed_projection};
use crate::types::{Parameters, Source, WHITE};

/// Minimum distance in rows between the top surface and any bottom.
pub const MIN_VALID_DEPTH: u32 = 100;

/// An ordinal line must lie more than this many rows below the top.
pub const ORDINAL_MIN_OFFSET: u32 = 20;

/// Lower bound on the half-width of the search band.
pub const MIN_BAND_HALF_WIDTH: u32 = 30;

/// Projection peaks closer than this are merged.
pub const PEAK_MERGE_DISTANCE: usize = 20;

/// Minimum intensity step per row for the gradient strategy.
pub const GRADIENT_THRESHOLD: f64 = 5.0;

/// Multiplier on the reference depth for the fallback estimate.
pub const FALLBACK_DEPTH_FACTOR: f64 = 1.2;

/// Expected bottom width as a fraction of the opening width.
const EXPECTED_WIDTH_FRACTION: f64 = 0.85;

/// Largest central difference an 8-bit profile can produce.
const MAX_GRADIENT: f64 = 127.5;

/// A way of proposing bottom rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottomStrategy {
    /// The configured ordinal surface line.
    OrdinalLine,
    /// Peaks of the mask projection inside the hole band.
    ProjectionPeak,
    /// Dark→bright steps down the center column.
    ColumnGradient,
    /// Short horizontal segments isolated by horizontal opening.
    ShortLine,
}

impl BottomStrategy {
    /// All strategies, in tie-break order.
    pub const ALL: [Self; 4] = [
        Self::OrdinalLine,
        Self::ProjectionPeak,
        Self::ColumnGradient,
        Self::ShortLine,
    ];

    /// Run this strategy.
    #[must_use]
    pub fn propose(self, ctx: &BottomContext<'_>) -> Vec<BottomCandidate> {
        match self {
            Self::OrdinalLine => ordinal_line(ctx).into_iter().collect(),
            Self::ProjectionPeak => projection_peaks(ctx),
            Self::ColumnGradient => column_gradient(ctx),
            Self::ShortLine => short_lines(ctx),
        }
    }

    fn rank(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).unwrap_or(usize::MAX)
    }
}

/// A proposed bottom row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BottomCandidate {
    pub row: u32,
    /// Confidence in `[0, 1]`.
    pub score: f64,
    pub strategy: BottomStrategy,
    /// Lateral extent `[start, end)` of the bottom segment, when the
    /// strategy measures one.
    pub span: Option<(u32, u32)>,
}

/// Everything the strategies look at.
#[derive(Debug, Clone, Copy)]
pub struct BottomContext<'a> {
    /// Smoothed grayscale image.
    pub image: &'a GrayImage,
    /// Binary mask of `image`.
    pub mask: &'a GrayImage,
    pub surfaces: &'a SurfaceSet,
    pub upper_row: u32,
    pub hole_start: u32,
    pub hole_end: u32,
    pub params: &'a Parameters,
}

impl BottomContext<'_> {
    /// Rows below the top surface that may hold the bottom.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn search_rows(&self) -> Range<u32> {
        let h = self.mask.height();
        let reach = (f64::from(h) * self.params.bottom_search_range) as u32;
        let start = self.upper_row.saturating_add(1).min(h);
        let end = self.upper_row.saturating_add(reach).min(h).max(start);
        start..end
    }

    /// Hole center column.
    #[must_use]
    pub const fn center(&self) -> u32 {
        self.hole_start + (self.hole_end - self.hole_start) / 2
    }

    /// Columns of the band centered on the hole.
    #[must_use]
    pub fn band(&self) -> Range<u32> {
        let half = ((self.hole_end - self.hole_start) / 2).max(MIN_BAND_HALF_WIDTH);
        let c = self.center();
        let w = self.mask.width();
        c.saturating_sub(half).min(w)..c.saturating_add(half).min(w)
    }

    fn hole_width(&self) -> f64 {
        f64::from(self.hole_end - self.hole_start)
    }
}

/// The chosen bottom row and how it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottomSelection {
    pub row: u32,
    pub source: Source,
    /// The winning candidate, absent on fallback.
    pub winner: Option<BottomCandidate>,
    /// Every candidate proposed, before filtering.
    pub candidates: Vec<BottomCandidate>,
}

fn ordinal_line(ctx: &BottomContext<'_>) -> Option<BottomCandidate> {
    let row = ctx.surfaces.get(ctx.params.bottom_line_index)?;
    if row <= ctx.upper_row.saturating_add(ORDINAL_MIN_OFFSET) {
        return None;
    }
    let projection = smoothed_projection(ctx.mask);
    let max = projection.iter().copied().fold(0.0_f64, f64::max);
    let value = projection.get(row as usize).copied().unwrap_or(0.0);
    let score = if max > 0.0 { value / max } else { 0.0 };
    Some(BottomCandidate {
        row,
        score,
        strategy: BottomStrategy::OrdinalLine,
        span: None,
    })
}

fn projection_peaks(ctx: &BottomContext<'_>) -> Vec<BottomCandidate> {
    let rows = ctx.search_rows();
    let band = ctx.band();
    if rows.is_empty() || band.is_empty() {
        return Vec::new();
    }
    let band_width = f64::from(band.end - band.start);
    let proj = moving_average(
        &band_projection(ctx.mask, band, rows.clone()),
        PROJECTION_SMOOTHING,
    );
    let (mean, std) = mean_std(&proj);
    let max = proj.iter().copied().fold(0.0_f64, f64::max);
    let floor = max * f64::from(ctx.params.column_projection_threshold) / 100.0;
    let window = ctx.params.column_peak_window as usize;

    let mut peaks: Vec<(usize, f64)> = Vec::new();
    for (i, &v) in proj.iter().enumerate() {
        if v <= 0.0 || v <= std.mul_add(1.5, mean) || v < floor {
            continue;
        }
        let lo = i.saturating_sub(window);
        let hi = (i + window + 1).min(proj.len());
        let neighbourhood = &proj[lo..hi];
        if neighbourhood.iter().any(|&n| n > v) {
            continue;
        }
        let local_min = neighbourhood.iter().copied().fold(f64::INFINITY, f64::min);
        let prominence = ((v - local_min) / (band_width * f64::from(WHITE))).clamp(0.0, 1.0);
        match peaks.last_mut() {
            Some(last) if i - last.0 < PEAK_MERGE_DISTANCE => {
                if prominence > last.1 {
                    *last = (i, prominence);
                }
            }
            _ => peaks.push((i, prominence)),
        }
    }

    peaks
        .into_iter()
        .filter_map(|(i, score)| {
            Some(BottomCandidate {
                row: rows.start + u32::try_from(i).ok()?,
                score,
                strategy: BottomStrategy::ProjectionPeak,
                span: None,
            })
        })
        .collect()
}

fn column_gradient(ctx: &BottomContext<'_>) -> Vec<BottomCandidate> {
    let rows = ctx.search_rows();
    let x = ctx.center();
    if rows.is_empty() || x >= ctx.image.width() {
        return Vec::new();
    }
    let column: Vec<f64> = rows
        .clone()
        .map(|y| f64::from(ctx.image.get_pixel(x, y).0[0]))
        .collect();
    let (mean, _) = mean_std(&column);
    let gain = ctx.params.bottom_enhance_contrast;
    let enhanced: Vec<f64> = column
        .iter()
        .map(|&v| (v - mean).mul_add(gain, mean).clamp(0.0, 255.0))
        .collect();
    let grad = gradient(&moving_average(&enhanced, PROJECTION_SMOOTHING));

    let rising: Vec<usize> = (0..grad.len().saturating_sub(1))
        .filter(|&i| grad[i] > GRADIENT_THRESHOLD && grad[i + 1] > GRADIENT_THRESHOLD)
        .collect();

    strongest_per_run(&rising, &grad)
        .into_iter()
        .filter_map(|i| {
            Some(BottomCandidate {
                row: rows.start + u32::try_from(i).ok()?,
                score: (grad[i] / MAX_GRADIENT).min(1.0),
                strategy: BottomStrategy::ColumnGradient,
                span: None,
            })
        })
        .collect()
}

/// Score of a horizontal segment `[start, end)` on image row `y`.
#[allow(clippy::cast_precision_loss)]
fn segment_score(ctx: &BottomContext<'_>, y: u32, start: u32, end: u32, band: &Range<u32>) -> f64 {
    let length = f64::from(end - start);
    let expected = ctx.hole_width() * EXPECTED_WIDTH_FRACTION;
    let length_score = if expected > 0.0 {
        (length / expected).min(1.0)
    } else {
        0.0
    };

    let half_band = f64::from(band.end - band.start) / 2.0;
    let seg_center = f64::from(start) + length / 2.0;
    let distance = (seg_center - f64::from(ctx.center())).abs();
    let center_score = if half_band > 0.0 {
        1.0 - (distance / half_band).min(1.0)
    } else {
        0.0
    };

    let line = row(ctx.image, y);
    let inside: Vec<f64> = (start..end).map(|x| f64::from(line[x as usize])).collect();
    let outside: Vec<f64> = band
        .clone()
        .filter(|x| !(start..end).contains(x))
        .map(|x| f64::from(line[x as usize]))
        .collect();
    let (seg_mean, _) = mean_std(&inside);
    let contrast_score = if outside.is_empty() {
        0.0
    } else {
        let (surround_mean, _) = mean_std(&outside);
        ((seg_mean - surround_mean) / 50.0).clamp(0.0, 1.0)
    };

    0.4f64.mul_add(length_score, 0.4f64.mul_add(center_score, 0.2 * contrast_score))
}

fn short_lines(ctx: &BottomContext<'_>) -> Vec<BottomCandidate> {
    let rows = ctx.search_rows();
    let band = ctx.band();
    if rows.is_empty() || band.is_empty() {
        return Vec::new();
    }
    let params = ctx.params;

    let region = image::imageops::crop_imm(
        ctx.image,
        band.start,
        rows.start,
        band.end - band.start,
        rows.end - rows.start,
    )
    .to_image();
    let opened = open_horizontal(&otsu_threshold(&region), params.horizontal_kernel_size);

    let proj = moving_average(&row_projection(&opened), 3);
    let (mean, _) = mean_std(&proj);
    let strong: Vec<usize> = (0..proj.len())
        .filter(|&i| proj[i] > 0.0 && proj[i] > 1.5 * mean)
        .collect();

    let band_cols = band.start as usize..band.end as usize;
    let min_len = params.short_line_min_length as usize;
    let mut out = Vec::new();
    for i in strongest_per_run(&strong, &proj) {
        let Ok(offset) = u32::try_from(i) else {
            continue;
        };
        let y = rows.start + offset;
        let mask_line = &row(ctx.mask, y)[band_cols.clone()];
        let ratio = white_ratio(mask_line);
        if ratio <= params.short_line_min_white_ratio
            || ratio >= params.short_line_max_white_ratio
            || longest_white_run(mask_line) <= min_len
        {
            continue;
        }

        let best = runs_of(row(&opened, offset), WHITE)
            .into_iter()
            .filter(|r| r.len() >= min_len)
            .filter_map(|r| {
                let start = band.start + u32::try_from(r.start).ok()?;
                let end = band.start + u32::try_from(r.end).ok()?;
                Some((segment_score(ctx, y, start, end, &band), start, end))
            })
            .max_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((score, start, end)) = best {
            out.push(BottomCandidate {
                row: y,
                score,
                strategy: BottomStrategy::ShortLine,
                span: Some((start, end)),
            });
        }
    }
    out
}

fn compare(a: &BottomCandidate, b: &BottomCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.strategy.rank().cmp(&a.strategy.rank()))
        .then_with(|| b.row.cmp(&a.row))
}

/// Apply the selection rule to pooled candidates.
#[must_use]
pub fn select_candidate(
    candidates: &[BottomCandidate],
    upper_row: u32,
    search_rows: &Range<u32>,
) -> Option<BottomCandidate> {
    let min_row = upper_row.saturating_add(MIN_VALID_DEPTH);
    let valid: Vec<&BottomCandidate> = candidates
        .iter()
        .filter(|c| c.row >= min_row && search_rows.contains(&c.row))
        .collect();

    let short: Vec<&BottomCandidate> = valid
        .iter()
        .copied()
        .filter(|c| c.strategy == BottomStrategy::ShortLine)
        .collect();
    let pool = if short.is_empty() { valid } else { short };
    pool.into_iter().max_by(|a, b| compare(a, b)).copied()
}

/// Bottom estimate from the reference depth, never shallower than
/// [`MIN_VALID_DEPTH`] and clipped to the last image row.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn fallback_row(upper_row: u32, image_height: u32, params: &Parameters) -> u32 {
    let reference_px = params.reference_depth_um / params.pixel_to_um_y;
    let depth = (reference_px * FALLBACK_DEPTH_FACTOR).max(f64::from(MIN_VALID_DEPTH));
    let row = f64::from(upper_row) + depth;
    let last = f64::from(image_height.saturating_sub(1));
    row.min(last) as u32
}

/// Run every strategy and pick the bottom row.
#[must_use]
pub fn locate_bottom(ctx: &BottomContext<'_>) -> BottomSelection {
    let candidates: Vec<BottomCandidate> = BottomStrategy::ALL
        .iter()
        .flat_map(|s| s.propose(ctx))
        .collect();
    debug!(count = candidates.len(), ?candidates, "bottom candidates");

    match select_candidate(&candidates, ctx.upper_row, &ctx.search_rows()) {
        Some(winner) => {
            debug!(row = winner.row, strategy = ?winner.strategy, score = winner.score, "bottom selected");
            BottomSelection {
                row: winner.row,
                source: Source::Detected,
                winner: Some(winner),
                candidates,
            }
        }
        None => {
            let row = fallback_row(ctx.upper_row, ctx.mask.height(), ctx.params);
            warn!(upper_row = ctx.upper_row, row, "no bottom candidate, using reference depth estimate");
            BottomSelection {
                row,
                source: Source::Fallback,
                winner: None,
                candidates,
            }
        }
    }
}
