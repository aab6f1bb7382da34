//! Integration tests: synthetic micrographs and slice sets through the
//! public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use approx::assert_abs_diff_eq;
use holegauge_pipeline::bottom::MIN_VALID_DEPTH;
use holegauge_pipeline::gap::GapMethod;
use holegauge_pipeline::rotate::rotate;
use holegauge_pipeline::types::{BLACK, WHITE};
use holegauge_pipeline::{
    AnalysisOptions, DiameterHistory, FitError, FitMethod, GrayImage, MeasureError, Parameters,
    ReconstructionOptions, analyze, fit_circle, measure, reconstruct, taper,
};
use image::Luma;

fn params() -> Parameters {
    Parameters {
        top_line_index: 0,
        ..Parameters::default()
    }
}

/// 300 wide, 500 tall: a bright 5-row surface at rows 38..=42 with an
/// opening over columns 121..=180 and nothing below it.
fn open_surface() -> GrayImage {
    GrayImage::from_fn(300, 500, |x, y| {
        let line = (38..=42).contains(&y) && !(121..=180).contains(&x);
        Luma([if line { 220 } else { 20 }])
    })
}

/// The open surface plus walls and a bright bottom at rows 298..=302.
fn blind_hole() -> GrayImage {
    GrayImage::from_fn(300, 500, |x, y| {
        let opening = (121..=180).contains(&x);
        let surface = (38..=42).contains(&y) && !opening;
        let walls =
            (43..=302).contains(&y) && ((113..=120).contains(&x) || (181..=188).contains(&x));
        let bottom = (298..=302).contains(&y) && opening;
        Luma([if surface || walls || bottom { 220 } else { 20 }])
    })
}

// ───────────────────────── Hole measurement ─────────────────────────

#[test]
fn opening_on_row_40_gives_diameter_in_micrometres() {
    let p = params();
    let analysis = analyze(&open_surface(), &p, AnalysisOptions::default()).unwrap();

    assert_eq!(analysis.gap.method, GapMethod::Transition);
    assert_eq!(analysis.gap.row, 40);
    assert_eq!((analysis.bounds.hole_start, analysis.bounds.hole_end), (120, 180));
    assert_abs_diff_eq!(
        analysis.measurement.diameter_um,
        60.0 * p.pixel_to_um_x,
        epsilon = 1e-9
    );
}

#[test]
fn missing_bottom_uses_reference_depth_estimate() {
    let analysis = analyze(&open_surface(), &params(), AnalysisOptions::default()).unwrap();
    assert!(analysis.bounds.bottom_fallback);
    assert!(analysis.bottom.winner.is_none());
    // 40 + 1000 / 1.94 * 1.2 runs past the image; clipped to the last row.
    assert_eq!(analysis.bounds.bottom_row, 499);
}

#[test]
fn bright_bottom_is_detected() {
    let analysis = analyze(&blind_hole(), &params(), AnalysisOptions::default()).unwrap();
    assert!(!analysis.bounds.bottom_fallback);
    assert!(
        analysis.bounds.bottom_row.abs_diff(300) <= 5,
        "bottom row {}",
        analysis.bounds.bottom_row
    );
    let expected_depth =
        f64::from(analysis.bounds.bottom_row - analysis.bounds.upper_row) * params().pixel_to_um_y;
    assert_abs_diff_eq!(analysis.measurement.depth_um, expected_depth, epsilon = 1e-9);
}

#[test]
fn blind_hole_reports_taper() {
    let analysis = analyze(&blind_hole(), &params(), AnalysisOptions::default()).unwrap();
    let m = &analysis.measurement;
    // Straight walls: the bottom is as wide as the opening.
    let taper = m.taper.unwrap();
    assert!(taper.abs() < 0.01, "taper {taper}");
    assert!(m.taper_angle_deg.unwrap().abs() < 0.6);
}

#[test]
fn missing_bottom_reports_no_taper() {
    let analysis = analyze(&open_surface(), &params(), AnalysisOptions::default()).unwrap();
    assert!(analysis.measurement.taper.is_none());
}

#[test]
fn tilted_input_is_straightened_before_detection() {
    // Sideways: the surface runs down a column.
    let tilted = rotate(&blind_hole(), 90.0);
    let p = Parameters {
        rotation_deg: -90.0,
        ..params()
    };
    let analysis = analyze(&tilted, &p, AnalysisOptions::default()).unwrap();
    assert_eq!(analysis.gap.method, GapMethod::Transition);
    assert!(
        analysis.gap.width().abs_diff(60) <= 2,
        "width {}",
        analysis.gap.width()
    );
}

#[test]
fn bottom_never_within_minimum_depth_of_top() {
    let images = [
        open_surface(),
        blind_hole(),
        // A bright band just below the surface must not be taken as bottom.
        GrayImage::from_fn(300, 500, |x, y| {
            let surface = (38..=42).contains(&y) && !(121..=180).contains(&x);
            let shallow = (80..=84).contains(&y) && (130..=170).contains(&x);
            Luma([if surface || shallow { 220 } else { 20 }])
        }),
    ];
    for img in &images {
        let a = analyze(img, &params(), AnalysisOptions::default()).unwrap();
        assert!(a.bounds.bottom_row >= a.bounds.upper_row + MIN_VALID_DEPTH);
        assert!(a.bounds.hole_start < a.bounds.hole_end);
    }
}

#[test]
fn mask_matches_image_shape_and_is_binary() {
    for p in [
        params(),
        Parameters {
            gaussian_kernel: 4,
            adaptive_block_size: 20,
            invert_binary: true,
            ..params()
        },
    ] {
        let a = analyze(&blind_hole(), &p, AnalysisOptions::default()).unwrap();
        assert_eq!(a.mask.dimensions(), (300, 500));
        assert!(a.mask.pixels().all(|px| px.0[0] == WHITE || px.0[0] == BLACK));
    }
}

#[test]
fn reprocessing_is_idempotent() {
    let img = blind_hole();
    let options = AnalysisOptions { roughness: true };
    let a = analyze(&img, &params(), options).unwrap();
    let b = analyze(&img, &params(), options).unwrap();
    assert_eq!(a.measurement, b.measurement);
    assert_eq!(a.bounds, b.bounds);
    assert_eq!(a.mask, b.mask);
    assert_eq!(measure(&img, &params()).unwrap(), a.measurement);
}

#[test]
fn empty_image_is_rejected() {
    assert!(matches!(
        measure(&GrayImage::new(0, 0), &params()),
        Err(MeasureError::EmptyInput)
    ));
}

// ───────────────────────── Derived quantities ─────────────────────────

#[test]
fn history_of_five_keeps_last_three() {
    let mut history = DiameterHistory::new();
    for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
        history.push(v);
        assert!(history.len() <= 3);
    }
    assert_abs_diff_eq!(history.mean().unwrap(), 40.0, epsilon = 1e-12);
}

#[test]
fn taper_of_100_80_over_200() {
    let report = taper(100.0, 80.0, 200.0).unwrap();
    assert_abs_diff_eq!(report.taper, 0.05, epsilon = 1e-12);
    assert_abs_diff_eq!(report.angle_deg, 2.862, epsilon = 1e-3);
    assert!(matches!(
        taper(100.0, 80.0, 0.0),
        Err(MeasureError::Configuration(_))
    ));
}

// ───────────────────────── Reconstruction ─────────────────────────

/// Diameter endpoints of the circle center (100, 200) radius 50 at five
/// scan positions, with 1 um per pixel.
fn circle_rows() -> (Vec<[f64; 4]>, Vec<f64>) {
    let positions = vec![165.0, 180.0, 200.0, 220.0, 235.0];
    let rows = positions
        .iter()
        .map(|&y: &f64| {
            let half = (2500.0 - (y - 200.0).powi(2)).sqrt();
            [100.0 - half, 12.0, 100.0 + half, 12.0]
        })
        .collect();
    (rows, positions)
}

#[test]
fn slices_on_a_circle_round_trip_for_every_method() {
    let (rows, positions) = circle_rows();
    let slices =
        holegauge_pipeline::reconstruct::slices_from_rows(&rows, &positions, 1.0).unwrap();
    for method in [
        FitMethod::Algebraic,
        FitMethod::Geometric,
        FitMethod::GeometricForced,
    ] {
        let fit = reconstruct(
            &slices,
            ReconstructionOptions {
                method,
                align_midpoints: false,
            },
        )
        .unwrap();
        assert_abs_diff_eq!(fit.center_x_um, 100.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.center_y_um, 200.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.radius_um, 50.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.diameter_um(), 100.0, epsilon = 1e-6);
        assert!(!fit.suspect);
    }
}

#[test]
fn two_points_cannot_define_a_circle() {
    let points = [
        holegauge_pipeline::Point::new(50.0, 200.0),
        holegauge_pipeline::Point::new(150.0, 200.0),
    ];
    assert!(matches!(
        fit_circle(&points, FitMethod::Geometric),
        Err(FitError::TooFewPoints { found: 2 })
    ));
}
