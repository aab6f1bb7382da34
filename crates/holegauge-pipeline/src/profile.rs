//! One-dimensional intensity profiles.
//!
//! Surface, gap and bottom detection all reduce the image to a profile
//! (a row projection, a single scan line, a column) and then look for
//! runs, peaks and steps in it. The helpers here are shared by those
//! stages.

use std::ops::Range;

use image::GrayImage;

use crate::types::WHITE;

/// Pixel values of row `y`.
///
/// Callers keep `y < image.height()`.
#[must_use]
pub fn row(image: &GrayImage, y: u32) -> &[u8] {
    let w = image.width() as usize;
    let start = y as usize * w;
    &image.as_raw()[start..start + w]
}

/// Sum of pixel values per row.
#[must_use]
pub fn row_projection(image: &GrayImage) -> Vec<f64> {
    (0..image.height())
        .map(|y| row(image, y).iter().map(|&v| f64::from(v)).sum())
        .collect()
}

/// Sum of pixel values per row restricted to `columns`, for each row in
/// `rows`. Index `i` of the result corresponds to row `rows.start + i`.
#[must_use]
pub fn band_projection(image: &GrayImage, columns: Range<u32>, rows: Range<u32>) -> Vec<f64> {
    let cols = columns.start as usize..columns.end as usize;
    rows.map(|y| row(image, y)[cols.clone()].iter().map(|&v| f64::from(v)).sum())
        .collect()
}

/// Centered moving average with zero padding at both ends.
///
/// The output has the same length as the input. Even windows are
/// widened by one so the average stays centered.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window | 1;
    let half = window / 2;
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            values[lo..hi].iter().sum::<f64>() / window as f64
        })
        .collect()
}

/// Discrete gradient: central differences inside, one-sided at the ends.
#[must_use]
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => (0..n)
            .map(|i| {
                if i == 0 {
                    values[1] - values[0]
                } else if i == n - 1 {
                    values[n - 1] - values[n - 2]
                } else {
                    (values[i + 1] - values[i - 1]) / 2.0
                }
            })
            .collect(),
    }
}

/// Population mean and standard deviation. Empty input gives `(0, 0)`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Maximal runs of pixels equal to `value`, as half-open index ranges.
#[must_use]
pub fn runs_of(line: &[u8], value: u8) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &v) in line.iter().enumerate() {
        match (v == value, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..line.len());
    }
    runs
}

/// Length of the longest white run in `line`.
#[must_use]
pub fn longest_white_run(line: &[u8]) -> usize {
    runs_of(line, WHITE).iter().map(ExactSizeIterator::len).max().unwrap_or(0)
}

/// Fraction of white pixels in `line`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn white_ratio(line: &[u8]) -> f64 {
    if line.is_empty() {
        return 0.0;
    }
    line.iter().filter(|&&v| v == WHITE).count() as f64 / line.len() as f64
}

/// Collapse runs of adjacent indices into the index of each run's
/// largest value. `indices` must be ascending.
#[must_use]
pub fn strongest_per_run(indices: &[usize], values: &[f64]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    let mut prev: Option<usize> = None;
    for &i in indices {
        match (prev, out.last_mut()) {
            (Some(p), Some(best)) if i == p + 1 => {
                if values[i] > values[*best] {
                    *best = i;
                }
            }
            _ => out.push(i),
        }
        prev = Some(i);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_is_zero_padded_and_centered() {
        let v = [5.0, 5.0, 5.0, 5.0, 5.0];
        let out = moving_average(&v, 5);
        assert_eq!(out.len(), 5);
        assert!((out[2] - 5.0).abs() < 1e-12);
        // first sample sees two padding zeros
        assert!((out[0] - 3.0).abs() < 1e-12);
        assert!((out[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn moving_average_of_impulse_spreads_symmetrically() {
        let mut v = vec![0.0; 9];
        v[4] = 10.0;
        let out = moving_average(&v, 3);
        assert!((out[3] - out[5]).abs() < 1e-12);
        assert!(out[2].abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_central_differences() {
        let g = gradient(&[0.0, 1.0, 4.0, 9.0]);
        assert_eq!(g, vec![1.0, 2.0, 4.0, 5.0]);
        assert!(gradient(&[]).is_empty());
    }

    #[test]
    fn mean_std_population() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.0).abs() < 1e-12);
    }

    #[test]
    fn runs_cover_both_ends() {
        let line = [255, 255, 0, 0, 0, 255, 0];
        assert_eq!(runs_of(&line, 0), vec![2..5, 6..7]);
        assert_eq!(runs_of(&line, 255), vec![0..2, 5..6]);
        assert_eq!(longest_white_run(&line), 2);
    }

    #[test]
    fn white_ratio_counts_foreground() {
        assert!((white_ratio(&[255, 0, 255, 0]) - 0.5).abs() < 1e-12);
        assert!(white_ratio(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn strongest_per_run_picks_peak_of_each_run() {
        let values = [0.0, 1.0, 3.0, 2.0, 0.0, 0.0, 5.0, 4.0];
        let picked = strongest_per_run(&[1, 2, 3, 6, 7], &values);
        assert_eq!(picked, vec![2, 6]);
    }

    #[test]
    fn band_projection_restricts_columns() {
        let img = GrayImage::from_fn(6, 3, |x, _| image::Luma([if x < 3 { 255 } else { 0 }]));
        let full = row_projection(&img);
        assert!((full[0] - 765.0).abs() < 1e-9);
        let band = band_projection(&img, 2..5, 1..3);
        assert_eq!(band.len(), 2);
        assert!((band[0] - 255.0).abs() < 1e-9);
    }
}
