//! holegauge-pipeline: Hole measurement from cross-section micrographs
//! and OCT slice reconstruction (sans-IO).
//!
//! The crate takes decoded images or encoded bytes plus an explicit
//! [`Parameters`] value and returns plain data. It never reads files,
//! keeps no global state and never installs a log subscriber.
//!
//! Detection steps degrade gracefully: when a surface line, opening or
//! bottom cannot be found, a documented default is substituted and the
//! result says so. Circle reconstruction fails loudly instead.

pub mod batch;
pub mod binarize;
pub mod blur;
pub mod bottom;
pub mod calibration;
pub mod circle;
pub mod dimension;
pub mod gap;
pub mod grayscale;
pub mod no_gap;
pub mod profile;
pub mod reconstruct;
pub mod records;
pub mod rotate;
pub mod roughness;
pub mod session;
pub mod surface;
pub mod types;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use batch::{BatchSummary, detect_slice_endpoints, measure_batch};
pub use circle::{CircleFitResult, FitMethod, fit_circle};
pub use dimension::{DiameterHistory, TaperReport, taper};
pub use no_gap::{NoGapMeasurement, measure_without_gap};
pub use reconstruct::{ReconstructionOptions, SliceRecord, reconstruct};
pub use records::{MeasurementRecord, ReconstructionRecord};
pub use roughness::RoughnessReport;
pub use session::MeasurementSession;
pub use types::{
    Calibration, FitError, GrayImage, HoleBounds, MeasureError, Measurement, Parameters, Point,
    Source,
};

use bottom::{BottomContext, BottomSelection, locate_bottom};
use gap::{Gap, detect_gap};
use surface::{SurfaceSelection, SurfaceSet, find_surface_lines, select_top};

/// Optional work done by [`analyze`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Score inner-wall roughness.
    pub roughness: bool,
}

/// Every intermediate of one hole measurement.
#[derive(Debug, Clone)]
pub struct HoleAnalysis {
    pub mask: GrayImage,
    pub surfaces: SurfaceSet,
    pub top: SurfaceSelection,
    pub gap: Gap,
    pub bottom: BottomSelection,
    pub bounds: HoleBounds,
    pub measurement: Measurement,
    /// Present when requested and at least one wall contour qualified.
    pub roughness: Option<RoughnessReport>,
}

/// Top surface and opening of a binary mask.
#[must_use]
pub fn locate_opening(
    mask: &GrayImage,
    params: &Parameters,
) -> (SurfaceSet, SurfaceSelection, Gap) {
    let surfaces = find_surface_lines(mask, params.row_projection_threshold);
    let top = select_top(&surfaces, params.top_line_index, mask.height());
    let gap = detect_gap(mask, top.row, params.gap_min_width);
    (surfaces, top, gap)
}

/// Run the full measurement and keep every intermediate.
///
/// # Pipeline steps
///
/// 1. Validate parameters, rotate the input if asked
/// 2. Smooth and binarize (adaptive ∧ Otsu ∧ fixed, open, close)
/// 3. Surface lines and top surface selection
/// 4. Opening on the top surface
/// 5. Bottom candidates from every strategy, then selection
/// 6. Dimensions in micrometres
/// 7. Optional roughness
///
/// The returned measurement carries this image's own standard diameter;
/// use [`MeasurementSession`] for the rolling value.
///
/// # Errors
///
/// Returns [`MeasureError::EmptyInput`] for an image without pixels and
/// [`MeasureError::Configuration`] for invalid parameters.
pub fn analyze(
    image: &GrayImage,
    params: &Parameters,
    options: AnalysisOptions,
) -> Result<HoleAnalysis, MeasureError> {
    // 1. Parameters.
    params.validate()?;
    let calibration = params.calibration()?;
    let image = rotate::oriented(image, params);

    // 2. Binary mask.
    let mask = binarize::binarize(&image, params)?;
    let smoothed = blur::smooth(&image, params.gaussian_kernel);

    // 3-4. Top surface and opening.
    let (surfaces, top, gap) = locate_opening(&mask, params);

    // 5. Bottom.
    let bottom = locate_bottom(&BottomContext {
        image: &smoothed,
        mask: &mask,
        surfaces: &surfaces,
        upper_row: gap.row,
        hole_start: gap.hole_start,
        hole_end: gap.hole_end,
        params,
    });

    let bounds = HoleBounds {
        hole_start: gap.hole_start,
        hole_end: gap.hole_end,
        upper_row: gap.row,
        bottom_row: bottom.row,
        lateral_fallback: gap.method.is_fallback(),
        bottom_fallback: bottom.source.is_fallback(),
    };

    // 6. Dimensions.
    let bottom_width = bottom
        .winner
        .and_then(|w| w.span)
        .map(|(start, end)| end - start)
        .or_else(|| {
            (!bounds.bottom_fallback).then(|| dimension::bottom_width_px(&mask, &bounds))
        });
    let mut measurement =
        dimension::measure_dimensions(&mask, &bounds, calibration, bottom_width);

    // 7. Roughness.
    let roughness = if options.roughness {
        match roughness::analyze_roughness(&mask, &bounds) {
            Ok(report) => {
                measurement.roughness_score = Some(report.score);
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "roughness skipped");
                None
            }
        }
    } else {
        None
    };

    info!(
        hole_start = bounds.hole_start,
        hole_end = bounds.hole_end,
        upper_row = bounds.upper_row,
        bottom_row = bounds.bottom_row,
        diameter_um = measurement.diameter_um,
        depth_um = measurement.depth_um,
        fallback = bounds.any_fallback(),
        "measured hole"
    );

    Ok(HoleAnalysis {
        mask,
        surfaces,
        top,
        gap,
        bottom,
        bounds,
        measurement,
        roughness,
    })
}

/// Measure one hole image.
///
/// Pure: identical inputs always give an identical result.
///
/// # Errors
///
/// As [`analyze`].
pub fn measure(image: &GrayImage, params: &Parameters) -> Result<Measurement, MeasureError> {
    analyze(image, params, AnalysisOptions::default()).map(|a| a.measurement)
}

/// Decode encoded image bytes and measure the hole.
///
/// # Errors
///
/// Returns [`MeasureError::EmptyInput`] if `bytes` is empty,
/// [`MeasureError::ImageDecode`] if the format is unrecognized, and the
/// errors of [`analyze`].
pub fn measure_bytes(bytes: &[u8], params: &Parameters) -> Result<Measurement, MeasureError> {
    let gray = grayscale::decode_and_grayscale(bytes)?;
    measure(&gray, params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_images {
    use image::{GrayImage, Luma};

    /// Dark 300×500 section: a bright 6-row surface at rows 37..43 broken
    /// over columns 121..=180, 8-px walls on both sides of the opening
    /// down to row 302 and a bright 5-row bottom at rows 298..303.
    pub fn blind_hole() -> GrayImage {
        GrayImage::from_fn(300, 500, |x, y| {
            let opening = (121..=180).contains(&x);
            let surface = (37..43).contains(&y) && !opening;
            let walls = (43..303).contains(&y)
                && ((113..=120).contains(&x) || (181..=188).contains(&x));
            let bottom = (298..303).contains(&y) && opening;
            Luma([if surface || walls || bottom { 220 } else { 20 }])
        })
    }

    pub fn png_bytes(image: &GrayImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }
}
