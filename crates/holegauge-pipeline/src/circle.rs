//! Circle fitting for slice reconstruction.
//!
//! Two fits are available:
//!
//! - [`fit_algebraic`] solves `2a·x + 2b·y + c = x² + y²` by linear least
//!   squares. It needs no seed and never iterates, but minimizes an
//!   algebraic rather than a geometric error.
//! - [`fit_geometric`] minimizes the true distance-to-circle residuals
//!   `|p - c| - r` with the `tiny-solver` Levenberg–Marquardt optimizer,
//!   keeping `r >= 0`.
//!
//! [`fit_circle`] wraps both behind [`FitMethod`]. The ordinary geometric
//! method is seeded by the algebraic fit and falls back to it when the
//! iteration fails; the forced variant starts from the centroid, runs
//! with tight tolerances and reports whatever it reaches.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use tiny_solver::factors::{Factor, na};
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer, OptimizerOptions};
use tracing::{debug, warn};

use crate::types::{FitError, Point};

/// A fit whose radius exceeds this multiple of the point-cloud extent is
/// flagged as suspect.
pub const SUSPECT_RADIUS_FACTOR: f64 = 10.0;

/// Singular values below this fraction of the largest mark the linear
/// system as rank deficient.
const RANK_TOLERANCE: f64 = 1e-12;

/// Parameter block `[cx, cy, r]` of the geometric problem.
const CIRCLE_KEY: &str = "circle";

/// Allowed ratio between the cost gradient at a reported minimum and the
/// square root of the tolerance.
const STATIONARITY_SLACK: f64 = 10.0;

/// Circle fitting strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Direct linear least squares.
    #[default]
    Algebraic,
    /// Levenberg–Marquardt seeded by the algebraic fit, falling back to it
    /// on failure.
    Geometric,
    /// Levenberg–Marquardt from the centroid with tight tolerances and no
    /// fallback.
    GeometricForced,
}

impl FitMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Algebraic => "algebraic",
            Self::Geometric => "geometric",
            Self::GeometricForced => "geometric_forced",
        }
    }
}

/// A circle in the plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

/// Iteration limits for [`fit_geometric`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Relative cost decrease below which the optimizer stops.
    pub tolerance: f64,
}

impl LmOptions {
    /// Limits for the seeded geometric fit.
    pub const STANDARD: Self = Self {
        max_iterations: 200,
        tolerance: 1e-10,
    };

    /// Limits for the forced geometric fit.
    pub const STRICT: Self = Self {
        max_iterations: 1000,
        tolerance: 1e-12,
    };
}

/// Outcome of a Levenberg–Marquardt run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOutcome {
    pub circle: Circle,
    /// `false` when the optimizer stopped away from a minimum.
    pub converged: bool,
}

/// Result of fitting a circle to a point cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleFitResult {
    pub center_x_um: f64,
    pub center_y_um: f64,
    pub radius_um: f64,
    /// The method that produced the circle.
    pub method: FitMethod,
    /// The method the caller asked for.
    pub requested: FitMethod,
    /// Mean of `| |p - c| - r |` over all points.
    pub mean_residual: f64,
    /// Largest `| |p - c| - r |`.
    pub max_residual: f64,
    /// The radius is implausibly large for the point spread, typically
    /// from nearly collinear points.
    pub suspect: bool,
}

impl CircleFitResult {
    #[must_use]
    pub fn diameter_um(&self) -> f64 {
        2.0 * self.radius_um
    }

    /// Returns `true` if the requested method failed and another one
    /// produced the result.
    #[must_use]
    pub fn fell_back(&self) -> bool {
        self.method != self.requested
    }
}

fn require_three(points: &[Point]) -> Result<(), FitError> {
    if points.len() < 3 {
        return Err(FitError::TooFewPoints {
            found: points.len(),
        });
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn centroid(points: &[Point]) -> Point {
    let n = points.len() as f64;
    Point::new(
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
    )
}

/// Centroid with the mean distance to it as radius.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn centroid_seed(points: &[Point]) -> Circle {
    let center = centroid(points);
    let radius = if points.is_empty() {
        0.0
    } else {
        points.iter().map(|p| p.distance(center)).sum::<f64>() / points.len() as f64
    };
    Circle { center, radius }
}

/// Algebraic least-squares circle.
///
/// Coordinates are centered on the centroid before solving.
///
/// # Errors
///
/// Returns [`FitError::TooFewPoints`] for fewer than three points and
/// [`FitError::Degenerate`] when the points are collinear or coincident.
pub fn fit_algebraic(points: &[Point]) -> Result<Circle, FitError> {
    require_three(points)?;
    let origin = centroid(points);
    let n = points.len();

    let a = DMatrix::from_fn(n, 3, |i, j| {
        let (u, v) = (points[i].x - origin.x, points[i].y - origin.y);
        match j {
            0 => 2.0 * u,
            1 => 2.0 * v,
            _ => 1.0,
        }
    });
    let b = DVector::from_fn(n, |i, _| {
        let (u, v) = (points[i].x - origin.x, points[i].y - origin.y);
        u.mul_add(u, v * v)
    });

    let svd = a.svd(true, true);
    let largest = svd.singular_values.max();
    let smallest = svd.singular_values.min();
    if largest.is_nan() || largest <= 0.0 || smallest <= largest * RANK_TOLERANCE {
        return Err(FitError::Degenerate(
            "points are collinear or coincident".to_string(),
        ));
    }
    let solution = svd
        .solve(&b, RANK_TOLERANCE * largest)
        .map_err(|e| FitError::Degenerate(e.to_string()))?;

    let (ca, cb, c) = (solution[0], solution[1], solution[2]);
    let r2 = ca.mul_add(ca, cb.mul_add(cb, c));
    if !r2.is_finite() || r2 <= 0.0 {
        return Err(FitError::Degenerate(format!(
            "squared radius is not positive ({r2})"
        )));
    }
    Ok(Circle {
        center: Point::new(ca + origin.x, cb + origin.y),
        radius: r2.sqrt(),
    })
}

/// Distance-to-circle residual `|p - c| - r` of one point.
#[derive(Debug, Clone)]
struct CircleResidual {
    x: f64,
    y: f64,
}

impl<T: na::RealField> Factor<T> for CircleResidual {
    fn residual_func(&self, params: &[na::DVector<T>]) -> na::DVector<T> {
        let p = &params[0];
        let dx = na::convert::<f64, T>(self.x) - p[0].clone();
        let dy = na::convert::<f64, T>(self.y) - p[1].clone();
        let dist = (dx.clone() * dx + dy.clone() * dy).sqrt();
        na::DVector::from_vec(vec![dist - p[2].clone()])
    }
}

/// Infinity norm of the cost gradient `J^T r` and the cost `|r|^2`.
fn gradient_and_cost(points: &[Point], circle: Circle) -> (f64, f64) {
    let mut gradient = Vector3::<f64>::zeros();
    let mut cost = 0.0;
    for q in points {
        let d = q.distance(circle.center).max(f64::MIN_POSITIVE);
        let r = d - circle.radius;
        let j = Vector3::new((circle.center.x - q.x) / d, (circle.center.y - q.y) / d, -1.0);
        gradient += j * r;
        cost += r * r;
    }
    (gradient.amax(), cost)
}

/// Geometric least-squares circle by Levenberg–Marquardt from `seed`.
///
/// The radius is bounded below by zero. The run is reported as converged
/// when the cost gradient at the result is within the tolerance; an
/// unconverged result is still returned.
///
/// # Errors
///
/// Returns [`FitError::TooFewPoints`] for fewer than three points and
/// [`FitError::NotConverged`] if the optimizer gives up or leaves the
/// finite range.
pub fn fit_geometric(
    points: &[Point],
    seed: Circle,
    options: LmOptions,
) -> Result<LmOutcome, FitError> {
    require_three(points)?;
    let not_converged = FitError::NotConverged {
        iterations: options.max_iterations,
    };

    let mut problem = tiny_solver::Problem::new();
    for q in points {
        problem.add_residual_block(
            1,
            &[CIRCLE_KEY],
            Box::new(CircleResidual { x: q.x, y: q.y }),
            None,
        );
    }
    problem.set_variable_bounds(CIRCLE_KEY, 2, 0.0, f64::MAX);

    let initial = HashMap::from([(
        CIRCLE_KEY.to_string(),
        na::DVector::from_vec(vec![seed.center.x, seed.center.y, seed.radius.max(0.0)]),
    )]);
    let solver_options = OptimizerOptions {
        max_iteration: options.max_iterations,
        min_abs_error_decrease_threshold: options.tolerance * options.tolerance,
        min_rel_error_decrease_threshold: options.tolerance,
        min_error_threshold: options.tolerance * options.tolerance,
        verbosity_level: 0,
        ..Default::default()
    };
    let solution = LevenbergMarquardtOptimizer::default()
        .optimize(&problem, &initial, Some(solver_options))
        .ok_or_else(|| not_converged.clone())?;
    let p = solution
        .get(CIRCLE_KEY)
        .filter(|p| p.len() == 3 && p.iter().all(|v| v.is_finite()))
        .ok_or(not_converged)?;

    let circle = Circle {
        center: Point::new(p[0], p[1]),
        radius: p[2].max(0.0),
    };
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let (gradient, cost) = gradient_and_cost(points, circle);
    let converged =
        gradient <= STATIONARITY_SLACK * options.tolerance.sqrt() * (n * cost).sqrt().max(1.0);
    Ok(LmOutcome { circle, converged })
}

fn summarize(points: &[Point], circle: Circle, method: FitMethod, requested: FitMethod) -> CircleFitResult {
    let residuals: Vec<f64> = points
        .iter()
        .map(|p| (p.distance(circle.center) - circle.radius).abs())
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let mean_residual = residuals.iter().sum::<f64>() / residuals.len().max(1) as f64;
    let max_residual = residuals.iter().copied().fold(0.0, f64::max);

    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(a, b, c, d), p| (a.min(p.x), b.max(p.x), c.min(p.y), d.max(p.y)),
    );
    let extent = (max_x - min_x).max(max_y - min_y);
    let suspect = circle.radius > SUSPECT_RADIUS_FACTOR * extent;
    if suspect {
        warn!(radius = circle.radius, extent, "fitted radius is implausibly large");
    }

    CircleFitResult {
        center_x_um: circle.center.x,
        center_y_um: circle.center.y,
        radius_um: circle.radius,
        method,
        requested,
        mean_residual,
        max_residual,
        suspect,
    }
}

/// Fit a circle to `points` with the chosen method.
///
/// # Errors
///
/// Returns a [`FitError`] when the points cannot determine a circle.
/// [`FitMethod::Geometric`] only fails when the algebraic fallback fails
/// as well.
pub fn fit_circle(points: &[Point], method: FitMethod) -> Result<CircleFitResult, FitError> {
    require_three(points)?;
    let result = match method {
        FitMethod::Algebraic => summarize(points, fit_algebraic(points)?, method, method),
        FitMethod::Geometric => {
            let algebraic = fit_algebraic(points);
            let seed = algebraic.clone().unwrap_or_else(|e| {
                debug!(error = %e, "algebraic seed failed, seeding from centroid");
                centroid_seed(points)
            });
            match fit_geometric(points, seed, LmOptions::STANDARD) {
                Ok(outcome) if outcome.converged => {
                    summarize(points, outcome.circle, method, method)
                }
                outcome => {
                    let circle = algebraic?;
                    warn!(?outcome, "geometric fit failed, using algebraic fit");
                    summarize(points, circle, FitMethod::Algebraic, method)
                }
            }
        }
        FitMethod::GeometricForced => {
            let outcome = fit_geometric(points, centroid_seed(points), LmOptions::STRICT)?;
            if !outcome.converged {
                warn!(
                    max_iterations = LmOptions::STRICT.max_iterations,
                    "forced geometric fit stopped away from a minimum"
                );
            }
            summarize(points, outcome.circle, method, method)
        }
    };
    debug!(
        method = result.method.as_str(),
        cx = result.center_x_um,
        cy = result.center_y_um,
        r = result.radius_um,
        mean_residual = result.mean_residual,
        "circle fit"
    );
    Ok(result)
}
