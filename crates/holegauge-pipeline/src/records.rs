//! Flat, serializable result records for export.

use serde::{Deserialize, Serialize};

use crate::circle::{CircleFitResult, FitMethod};
use crate::types::{HoleBounds, Measurement};

/// One exported row per measured image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub filename: String,
    pub upper_surface_row: u32,
    pub hole_start: u32,
    pub hole_end: u32,
    pub diameter_px: u32,
    pub diameter_um: f64,
    pub bottom_surface_row: u32,
    pub depth_px: u32,
    pub depth_um: f64,
    /// `depth_um / reference_depth_um`.
    pub reference_depth_ratio: f64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl MeasurementRecord {
    #[must_use]
    pub fn new(
        filename: impl Into<String>,
        bounds: &HoleBounds,
        measurement: &Measurement,
        reference_depth_um: f64,
        timestamp: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            upper_surface_row: bounds.upper_row,
            hole_start: bounds.hole_start,
            hole_end: bounds.hole_end,
            diameter_px: bounds.width_px(),
            diameter_um: measurement.diameter_um,
            bottom_surface_row: bounds.bottom_row,
            depth_px: bounds.depth_px(),
            depth_um: measurement.depth_um,
            reference_depth_ratio: if reference_depth_um > 0.0 {
                measurement.depth_um / reference_depth_um
            } else {
                0.0
            },
            timestamp,
        }
    }
}

/// Exported result of a slice reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionRecord {
    pub center_x_um: f64,
    pub center_y_um: f64,
    pub radius_um: f64,
    pub diameter_um: f64,
    pub fit_method: FitMethod,
    pub fell_back: bool,
    pub mean_residual: f64,
    pub max_residual: f64,
    pub suspect: bool,
    /// `reference_depth_um / diameter_um` when a depth was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_to_diameter_ratio: Option<f64>,
}

impl ReconstructionRecord {
    #[must_use]
    pub fn new(fit: &CircleFitResult, reference_depth_um: Option<f64>) -> Self {
        let diameter_um = fit.diameter_um();
        Self {
            center_x_um: fit.center_x_um,
            center_y_um: fit.center_y_um,
            radius_um: fit.radius_um,
            diameter_um,
            fit_method: fit.method,
            fell_back: fit.fell_back(),
            mean_residual: fit.mean_residual,
            max_residual: fit.max_residual,
            suspect: fit.suspect,
            depth_to_diameter_ratio: reference_depth_um
                .filter(|&d| d > 0.0 && diameter_um > 0.0)
                .map(|d| d / diameter_um),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn measurement() -> Measurement {
        Measurement {
            diameter_um: 96.0,
            depth_um: 504.4,
            upper_diam_um: 96.0,
            lower_diam_um: 96.0,
            standard_diameter_um: 96.0,
            depth_to_diameter_ratio: 504.4 / 96.0,
            taper: None,
            taper_angle_deg: None,
            roughness_score: None,
        }
    }

    #[test]
    fn measurement_record_has_export_columns() {
        let bounds = HoleBounds {
            hole_start: 120,
            hole_end: 180,
            upper_row: 40,
            bottom_row: 300,
            lateral_fallback: false,
            bottom_fallback: false,
        };
        let record = MeasurementRecord::new("a.png", &bounds, &measurement(), 1000.0, 7);
        assert_eq!(record.diameter_px, 60);
        assert_eq!(record.depth_px, 260);
        assert_relative_eq!(record.reference_depth_ratio, 0.5044);

        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "filename",
            "upper_surface_row",
            "hole_start",
            "hole_end",
            "diameter_px",
            "diameter_um",
            "bottom_surface_row",
            "depth_px",
            "depth_um",
            "timestamp",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn reconstruction_record_ratio_is_optional() {
        let fit = CircleFitResult {
            center_x_um: 100.0,
            center_y_um: 200.0,
            radius_um: 50.0,
            method: FitMethod::Algebraic,
            requested: FitMethod::Geometric,
            mean_residual: 0.0,
            max_residual: 0.0,
            suspect: false,
        };
        let record = ReconstructionRecord::new(&fit, Some(400.0));
        assert_relative_eq!(record.diameter_um, 100.0);
        assert_relative_eq!(record.depth_to_diameter_ratio.unwrap(), 4.0);
        assert!(record.fell_back);

        let json = serde_json::to_value(ReconstructionRecord::new(&fit, None)).unwrap();
        assert!(json.get("depth_to_diameter_ratio").is_none());
        assert_eq!(json["fit_method"], "algebraic");
    }
}
