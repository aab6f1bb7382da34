//! Shared types for the holegauge measurement pipeline.

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can pass images and
/// binary masks without depending on `image` directly.
pub use image::GrayImage;

/// Value of a foreground (white) pixel in a binary mask.
pub const WHITE: u8 = 255;

/// Value of a background (black) pixel in a binary mask.
pub const BLACK: u8 = 0;

/// A 2D point. Units depend on context (pixels or micrometres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Per-axis conversion from pixels to micrometres.
///
/// Cross-section micrographs are anisotropic: the lateral (X) and
/// vertical (Y) scales differ, so lateral distances always use
/// `pixel_to_um_x` and vertical distances always use `pixel_to_um_y`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Micrometres per pixel along image columns.
    pub pixel_to_um_x: f64,
    /// Micrometres per pixel along image rows.
    pub pixel_to_um_y: f64,
}

impl Calibration {
    /// Create a calibration, rejecting non-positive or non-finite factors.
    ///
    /// # Errors
    ///
    /// Returns [`MeasureError::Configuration`] if either factor is not a
    /// positive finite number.
    pub fn new(pixel_to_um_x: f64, pixel_to_um_y: f64) -> Result<Self, MeasureError> {
        for (name, value) in [("pixel_to_um_x", pixel_to_um_x), ("pixel_to_um_y", pixel_to_um_y)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MeasureError::Configuration(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(Self {
            pixel_to_um_x,
            pixel_to_um_y,
        })
    }

    /// Lateral pixel distance in micrometres.
    #[must_use]
    pub fn lateral_um(self, pixels: f64) -> f64 {
        pixels * self.pixel_to_um_x
    }

    /// Vertical pixel distance in micrometres.
    #[must_use]
    pub fn vertical_um(self, pixels: f64) -> f64 {
        pixels * self.pixel_to_um_y
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pixel_to_um_x: Parameters::DEFAULT_PIXEL_TO_UM_X,
            pixel_to_um_y: Parameters::DEFAULT_PIXEL_TO_UM_Y,
        }
    }
}

/// Tunable thresholds for one measurement session.
///
/// Owned by the caller and passed explicitly into every pipeline call.
/// Field names match the persisted JSON keys; missing keys take their
/// defaults. Even kernel and block sizes are accepted and bumped to the
/// next odd value where they are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Gaussian smoothing kernel size in pixels. `<= 1` disables smoothing.
    pub gaussian_kernel: u32,
    /// Neighbourhood size of the adaptive threshold.
    pub adaptive_block_size: u32,
    /// Constant subtracted from the adaptive local mean.
    pub adaptive_c: i32,
    /// Fixed global threshold; pixels strictly above it are foreground.
    pub binary_threshold: u8,
    /// Which detected surface line (top to bottom) is the hole's top surface.
    pub top_line_index: usize,
    /// Which detected surface line is considered for the hole's bottom.
    pub bottom_line_index: usize,
    /// Row projection threshold as a percentage of the projection maximum.
    pub row_projection_threshold: u32,
    /// Minimum gap width in pixels.
    pub gap_min_width: u32,
    /// Length of the horizontal structuring element used to isolate
    /// short horizontal segments.
    pub horizontal_kernel_size: u32,
    /// Band projection threshold as a percentage of the band maximum.
    pub column_projection_threshold: u32,
    /// Half-width of the local-maximum window for band projection peaks.
    pub column_peak_window: u32,
    /// Contrast gain applied to the center column before gradient search.
    pub bottom_enhance_contrast: f64,
    /// Fraction of the image height searched below the top surface.
    pub bottom_search_range: f64,
    /// Longest white run a bottom row must exceed.
    pub short_line_min_length: u32,
    /// Exclusive lower bound on a bottom row's white ratio inside the band.
    pub short_line_min_white_ratio: f64,
    /// Exclusive upper bound on a bottom row's white ratio inside the band.
    pub short_line_max_white_ratio: f64,
    /// Invert the final binary mask.
    pub invert_binary: bool,
    /// Micrometres per pixel along image columns.
    pub pixel_to_um_x: f64,
    /// Micrometres per pixel along image rows.
    pub pixel_to_um_y: f64,
    /// Expected hole depth, used by the bottom fallback estimate and the
    /// reference depth ratio.
    pub reference_depth_um: f64,
    /// Counter-clockwise rotation applied to the input before detection,
    /// in degrees. Zero leaves the image untouched.
    pub rotation_deg: f64,
}

impl Parameters {
    pub const DEFAULT_GAUSSIAN_KERNEL: u32 = 5;
    pub const DEFAULT_ADAPTIVE_BLOCK_SIZE: u32 = 51;
    pub const DEFAULT_ADAPTIVE_C: i32 = 5;
    pub const DEFAULT_BINARY_THRESHOLD: u8 = 128;
    pub const DEFAULT_TOP_LINE_INDEX: usize = 1;
    pub const DEFAULT_BOTTOM_LINE_INDEX: usize = 0;
    pub const DEFAULT_ROW_PROJECTION_THRESHOLD: u32 = 70;
    pub const DEFAULT_GAP_MIN_WIDTH: u32 = 50;
    pub const DEFAULT_HORIZONTAL_KERNEL_SIZE: u32 = 25;
    pub const DEFAULT_COLUMN_PROJECTION_THRESHOLD: u32 = 30;
    pub const DEFAULT_COLUMN_PEAK_WINDOW: u32 = 10;
    pub const DEFAULT_BOTTOM_ENHANCE_CONTRAST: f64 = 1.5;
    pub const DEFAULT_BOTTOM_SEARCH_RANGE: f64 = 0.8;
    pub const DEFAULT_SHORT_LINE_MIN_LENGTH: u32 = 5;
    pub const DEFAULT_SHORT_LINE_MIN_WHITE_RATIO: f64 = 0.4;
    pub const DEFAULT_SHORT_LINE_MAX_WHITE_RATIO: f64 = 0.9;
    pub const DEFAULT_PIXEL_TO_UM_X: f64 = 1.60;
    pub const DEFAULT_PIXEL_TO_UM_Y: f64 = 1.94;
    pub const DEFAULT_REFERENCE_DEPTH_UM: f64 = 1000.0;
    pub const DEFAULT_ROTATION_DEG: f64 = 0.0;

    /// The explicit calibration value carried by these parameters.
    ///
    /// # Errors
    ///
    /// Returns [`MeasureError::Configuration`] if a factor is not positive.
    pub fn calibration(&self) -> Result<Calibration, MeasureError> {
        Calibration::new(self.pixel_to_um_x, self.pixel_to_um_y)
    }

    /// Check value ranges that cannot be repaired automatically.
    ///
    /// # Errors
    ///
    /// Returns [`MeasureError::Configuration`] naming the first offending key.
    pub fn validate(&self) -> Result<(), MeasureError> {
        self.calibration()?;
        let ratio_ok = |v: f64| (0.0..=1.0).contains(&v);
        if !ratio_ok(self.short_line_min_white_ratio) || !ratio_ok(self.short_line_max_white_ratio)
        {
            return Err(MeasureError::Configuration(
                "short line white ratios must lie in [0, 1]".to_string(),
            ));
        }
        if self.short_line_min_white_ratio >= self.short_line_max_white_ratio {
            return Err(MeasureError::Configuration(format!(
                "short_line_min_white_ratio ({}) must be below short_line_max_white_ratio ({})",
                self.short_line_min_white_ratio, self.short_line_max_white_ratio,
            )));
        }
        let range = self.bottom_search_range;
        if range.is_nan() || range <= 0.0 || range > 1.0 {
            return Err(MeasureError::Configuration(format!(
                "bottom_search_range must lie in (0, 1], got {}",
                self.bottom_search_range,
            )));
        }
        if self.row_projection_threshold > 100 || self.column_projection_threshold > 100 {
            return Err(MeasureError::Configuration(
                "projection thresholds are percentages in [0, 100]".to_string(),
            ));
        }
        if !self.bottom_enhance_contrast.is_finite() || self.bottom_enhance_contrast <= 0.0 {
            return Err(MeasureError::Configuration(format!(
                "bottom_enhance_contrast must be positive, got {}",
                self.bottom_enhance_contrast,
            )));
        }
        if !self.reference_depth_um.is_finite() || self.reference_depth_um <= 0.0 {
            return Err(MeasureError::Configuration(format!(
                "reference_depth_um must be positive, got {}",
                self.reference_depth_um,
            )));
        }
        if !self.rotation_deg.is_finite() {
            return Err(MeasureError::Configuration(format!(
                "rotation_deg must be finite, got {}",
                self.rotation_deg,
            )));
        }
        Ok(())
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            gaussian_kernel: Self::DEFAULT_GAUSSIAN_KERNEL,
            adaptive_block_size: Self::DEFAULT_ADAPTIVE_BLOCK_SIZE,
            adaptive_c: Self::DEFAULT_ADAPTIVE_C,
            binary_threshold: Self::DEFAULT_BINARY_THRESHOLD,
            top_line_index: Self::DEFAULT_TOP_LINE_INDEX,
            bottom_line_index: Self::DEFAULT_BOTTOM_LINE_INDEX,
            row_projection_threshold: Self::DEFAULT_ROW_PROJECTION_THRESHOLD,
            gap_min_width: Self::DEFAULT_GAP_MIN_WIDTH,
            horizontal_kernel_size: Self::DEFAULT_HORIZONTAL_KERNEL_SIZE,
            column_projection_threshold: Self::DEFAULT_COLUMN_PROJECTION_THRESHOLD,
            column_peak_window: Self::DEFAULT_COLUMN_PEAK_WINDOW,
            bottom_enhance_contrast: Self::DEFAULT_BOTTOM_ENHANCE_CONTRAST,
            bottom_search_range: Self::DEFAULT_BOTTOM_SEARCH_RANGE,
            short_line_min_length: Self::DEFAULT_SHORT_LINE_MIN_LENGTH,
            short_line_min_white_ratio: Self::DEFAULT_SHORT_LINE_MIN_WHITE_RATIO,
            short_line_max_white_ratio: Self::DEFAULT_SHORT_LINE_MAX_WHITE_RATIO,
            invert_binary: false,
            pixel_to_um_x: Self::DEFAULT_PIXEL_TO_UM_X,
            pixel_to_um_y: Self::DEFAULT_PIXEL_TO_UM_Y,
            reference_depth_um: Self::DEFAULT_REFERENCE_DEPTH_UM,
            rotation_deg: Self::DEFAULT_ROTATION_DEG,
        }
    }
}

/// Whether a value came from a confident detection or a documented default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Detected,
    Fallback,
}

impl Source {
    /// Returns `true` for [`Source::Fallback`].
    #[must_use]
    pub const fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback)
    }
}

/// Pixel bounds of a detected hole.
///
/// `hole_start < hole_end` always holds. `bottom_row > upper_row` holds
/// whenever the top surface lies above the last image row. The two
/// flags record which bounds were substituted by a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoleBounds {
    /// Column of the last foreground pixel left of the opening.
    pub hole_start: u32,
    /// Column of the last background pixel of the opening.
    pub hole_end: u32,
    /// Row on which the opening was measured.
    pub upper_row: u32,
    /// Row of the hole's bottom surface.
    pub bottom_row: u32,
    /// The lateral bounds are the central-third default.
    pub lateral_fallback: bool,
    /// The bottom row is the reference-depth estimate.
    pub bottom_fallback: bool,
}

impl HoleBounds {
    /// Opening width in pixels.
    #[must_use]
    pub const fn width_px(&self) -> u32 {
        self.hole_end - self.hole_start
    }

    /// Depth in pixels.
    #[must_use]
    pub const fn depth_px(&self) -> u32 {
        self.bottom_row.saturating_sub(self.upper_row)
    }

    /// Column midway between the lateral bounds.
    #[must_use]
    pub const fn center_column(&self) -> u32 {
        self.hole_start + self.width_px() / 2
    }

    /// Returns `true` if any bound is a fallback value.
    #[must_use]
    pub const fn any_fallback(&self) -> bool {
        self.lateral_fallback || self.bottom_fallback
    }
}

/// Physical dimensions of one processed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Opening width on the top surface.
    pub diameter_um: f64,
    pub depth_um: f64,
    /// Diameter 0.1 mm below the top surface.
    pub upper_diam_um: f64,
    /// Diameter 0.1 mm above the bottom surface.
    pub lower_diam_um: f64,
    /// Rolling mean of recent secondary-diameter estimates.
    pub standard_diameter_um: f64,
    pub depth_to_diameter_ratio: f64,
    /// `(top - bottom) / (2 h)`; `None` when no bottom width was measured.
    pub taper: Option<f64>,
    pub taper_angle_deg: Option<f64>,
    /// `100 / (1 + std)` of wall deviation; `None` when not computed.
    pub roughness_score: Option<f64>,
}

/// Errors raised by circle fitting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    /// Fewer than three points were supplied.
    #[error("circle fit needs at least 3 points, got {found}")]
    TooFewPoints { found: usize },

    /// The point configuration does not determine a circle.
    #[error("degenerate point configuration: {0}")]
    Degenerate(String),

    /// The iterative solver produced no finite solution.
    #[error("geometric fit did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
}

/// Errors that can occur during measurement or reconstruction.
///
/// Detection failures are not errors: they are recovered by fallbacks
/// and reported through [`Source`] and the `*_fallback` flags.
#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image or buffer has no pixels.
    #[error("input image data is empty")]
    EmptyInput,

    /// Malformed input, such as mismatched array lengths.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A parameter or calibration value is out of range.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A detection step with no fallback found nothing.
    #[error("not detected: {0}")]
    NotDetected(String),

    /// Circle fitting failed.
    #[error(transparent)]
    Fit(#[from] FitError),

    /// No wall contour qualified for roughness analysis.
    #[error("cannot compute roughness: no qualifying wall contours")]
    RoughnessUnavailable,

    /// A batch run observed its cancellation flag.
    #[error("processing cancelled")]
    Cancelled,
}

/// Reject zero-sized images.
///
/// # Errors
///
/// Returns [`MeasureError::EmptyInput`] if `image` has no pixels.
pub fn ensure_non_empty(image: &GrayImage) -> Result<(), MeasureError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(MeasureError::EmptyInput);
    }
    Ok(())
}
