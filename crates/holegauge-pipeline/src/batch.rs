//! Sequential processing of many images with cooperative cancellation.
//!
//! Images are independent, so a batch is a loop: the cancellation flag is
//! checked before each image, never inside an algorithm. Results are
//! delivered to a caller-supplied handler as they are produced.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binarize::binarize;
use crate::reconstruct::SliceRecord;
use crate::rotate::oriented;
use crate::session::MeasurementSession;
use crate::types::{GrayImage, MeasureError, Parameters};
use crate::{AnalysisOptions, HoleAnalysis, grayscale, locate_opening};

/// Counts from a finished or cancelled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Items attempted.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The flag was observed before every item was attempted.
    pub cancelled: bool,
}

impl BatchSummary {
    fn record<T, E>(&mut self, result: &Result<T, E>) {
        self.processed += 1;
        if result.is_ok() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Turn an observed cancellation into an error.
    ///
    /// # Errors
    ///
    /// Returns [`MeasureError::Cancelled`] if the batch stopped early.
    pub const fn ensure_complete(&self) -> Result<(), MeasureError> {
        if self.cancelled {
            Err(MeasureError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run `process` over `items`, handing each result to `handler`.
///
/// `cancel` is checked before every item. Items are `(name, input)`
/// pairs; the name is passed through to the handler untouched.
pub fn run_batch<N, I, T>(
    items: impl IntoIterator<Item = (N, I)>,
    cancel: &AtomicBool,
    mut process: impl FnMut(I) -> Result<T, MeasureError>,
    mut handler: impl FnMut(&N, Result<T, MeasureError>),
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for (name, input) in items {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            warn!(processed = summary.processed, "batch cancelled");
            break;
        }
        let result = process(input);
        summary.record(&result);
        handler(&name, result);
    }
    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "batch finished"
    );
    summary
}

/// Measure encoded images in order through one [`MeasurementSession`],
/// so the standard diameter rolls across the batch.
pub fn measure_batch<N, B: AsRef<[u8]>>(
    items: impl IntoIterator<Item = (N, B)>,
    params: &Parameters,
    options: AnalysisOptions,
    cancel: &AtomicBool,
    handler: impl FnMut(&N, Result<HoleAnalysis, MeasureError>),
) -> BatchSummary {
    let mut session = MeasurementSession::new(params.clone(), options);
    run_batch(
        items,
        cancel,
        |bytes: B| {
            let gray = grayscale::decode_and_grayscale(bytes.as_ref())?;
            session.analyze(&gray)
        },
        handler,
    )
}

/// Detect the opening on one OCT slice image.
///
/// # Errors
///
/// Returns [`MeasureError::NotDetected`] when the opening could only be
/// defaulted, since a guessed chord would corrupt the circle fit, and
/// the errors of [`binarize`].
pub fn slice_from_image(
    image: &GrayImage,
    scan_position: f64,
    params: &Parameters,
) -> Result<SliceRecord, MeasureError> {
    params.validate()?;
    let mask = binarize(&oriented(image, params), params)?;
    let (_, _, gap) = locate_opening(&mask, params);
    if gap.method.is_fallback() {
        return Err(MeasureError::NotDetected(format!(
            "opening on slice at {scan_position}"
        )));
    }
    debug!(
        scan_position,
        hole_start = gap.hole_start,
        hole_end = gap.hole_end,
        row = gap.row,
        "slice endpoints"
    );
    Ok(SliceRecord::from_gap(scan_position, params.pixel_to_um_x, &gap))
}

/// Fill slice endpoints from OCT images given as `(scan_position,
/// image)` pairs.
///
/// Every attempted image yields a [`SliceRecord`]; a slice whose opening
/// was not detected has no endpoints and is skipped by
/// [`reconstruct`](crate::reconstruct::reconstruct). Failures are also reported to
/// `on_error`.
pub fn detect_slice_endpoints<'a>(
    images: impl IntoIterator<Item = (f64, &'a GrayImage)>,
    params: &Parameters,
    cancel: &AtomicBool,
    mut on_error: impl FnMut(f64, &MeasureError),
) -> (Vec<SliceRecord>, BatchSummary) {
    let mut slices = Vec::new();
    let summary = run_batch(
        images
            .into_iter()
            .map(|(position, image)| (position, (position, image))),
        cancel,
        |(position, image)| slice_from_image(image, position, params),
        |&position, result| match result {
            Ok(slice) => slices.push(slice),
            Err(e) => {
                on_error(position, &e);
                slices.push(SliceRecord::new(position, params.pixel_to_um_x));
            }
        },
    );
    (slices, summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::test_images::{blind_hole, png_bytes};

    fn params() -> Parameters {
        Parameters {
            top_line_index: 0,
            ..Parameters::default()
        }
    }

    /// OCT-like slice: a bright surface band broken over `[start, end)`.
    fn slice_image(start: u32, end: u32) -> GrayImage {
        GrayImage::from_fn(300, 200, |x, y| {
            let band = (48..54).contains(&y) && !(start..end).contains(&x);
            Luma([if band { 220 } else { 20 }])
        })
    }

    #[test]
    fn batch_reports_successes_and_failures() {
        let png = png_bytes(&blind_hole());
        let items = vec![
            ("a.png", png.clone()),
            ("broken.png", vec![1, 2, 3]),
            ("b.png", png),
        ];
        let mut seen = Vec::new();
        let summary = measure_batch(
            items,
            &params(),
            AnalysisOptions::default(),
            &AtomicBool::new(false),
            |name, result| seen.push((*name, result.is_ok())),
        );
        assert_eq!(
            summary,
            BatchSummary {
                processed: 3,
                succeeded: 2,
                failed: 1,
                cancelled: false
            }
        );
        assert_eq!(seen, vec![("a.png", true), ("broken.png", false), ("b.png", true)]);
        assert!(summary.ensure_complete().is_ok());
    }

    #[test]
    fn cancellation_is_checked_between_items() {
        let cancel = AtomicBool::new(false);
        let mut calls = 0;
        let summary = run_batch(
            [(0, 1), (1, 2), (2, 3)],
            &cancel,
            |v: i32| Ok(v * 2),
            |_, _| {
                calls += 1;
                cancel.store(true, Ordering::Relaxed);
            },
        );
        assert_eq!(calls, 1);
        assert!(summary.cancelled);
        assert_eq!(summary.processed, 1);
        assert!(matches!(
            summary.ensure_complete(),
            Err(MeasureError::Cancelled)
        ));
    }

    #[test]
    fn slices_get_endpoints_from_their_openings() {
        let images = [
            slice_image(100, 170),
            slice_image(110, 180),
            GrayImage::from_pixel(300, 200, Luma([20])),
        ];
        let mut errors = Vec::new();
        let (slices, summary) = detect_slice_endpoints(
            [(0.0, &images[0]), (10.0, &images[1]), (20.0, &images[2])],
            &params(),
            &AtomicBool::new(false),
            |position, _| errors.push(position),
        );
        assert_eq!(slices.len(), 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(errors.len(), 1);
        assert!((errors[0] - 20.0).abs() < f64::EPSILON);

        let (a, b) = slices[0].endpoints().unwrap();
        assert!((a.x - 99.0).abs() <= 2.0, "left endpoint {a:?}");
        assert!((b.x - 169.0).abs() <= 2.0, "right endpoint {b:?}");
        assert!(slices[2].endpoints().is_none());
    }
}
