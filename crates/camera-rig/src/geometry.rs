//! Calibration records and the cross-camera transform.
//!
//! Extrinsics follow the stereo convention `X_to = R * X_from + T`.

use crate::{Error, Result};
use core::fmt;
use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use vision_capture::SourceId;

/// Ordered camera pair: extrinsics map points from `from` into `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePair {
    pub from: SourceId,
    pub to: SourceId,
}

impl SourcePair {
    pub const fn new(from: SourceId, to: SourceId) -> Self {
        Self { from, to }
    }

    pub const fn reversed(self) -> Self {
        Self {
            from: self.to,
            to: self.from,
        }
    }

    /// Every unordered pair of distinct ids, each as `(lower, higher)`.
    pub fn unordered_pairs(ids: &[SourceId]) -> Vec<SourcePair> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let mut out = Vec::new();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                out.push(SourcePair::new(a, b));
            }
        }
        out
    }
}

impl fmt::Display for SourcePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.from, self.to)
    }
}

/// Camera matrix `K` and distortion coefficients `D`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub k: Matrix3<f64>,
    pub distortion: Vec<f64>,
}

impl CameraIntrinsics {
    pub fn new(k: Matrix3<f64>, distortion: Vec<f64>) -> Self {
        Self { k, distortion }
    }

    /// Pinhole intrinsics with square pixels and no distortion.
    pub fn pinhole(focal: f64, cx: f64, cy: f64) -> Self {
        Self::new(
            Matrix3::new(focal, 0.0, cx, 0.0, focal, cy, 0.0, 0.0, 1.0),
            vec![0.0; 5],
        )
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.k[(0, 2)], self.k[(1, 2)])
    }

    /// Back-project normalized image coordinates (`u, v` in `[0, 1]`) to a
    /// point on the viewing ray at unit depth.
    ///
    /// `u, v` are remapped to `[-1, 1]` and scaled around the principal point,
    /// so `(0.5, 0.5)` lands on the optical axis.
    pub fn ray_through(&self, u: f64, v: f64) -> Result<Vector3<f64>> {
        if !u.is_finite() || !v.is_finite() {
            return Err(Error::Geometry(format!(
                "image coordinates must be finite, got ({u}, {v})"
            )));
        }
        let (cx, cy) = self.principal_point();
        let ndc_x = 2.0 * u - 1.0;
        let ndc_y = 2.0 * v - 1.0;
        let pixel = Vector3::new(cx + ndc_x * cx, cy + ndc_y * cy, 1.0);
        let k_inv = self
            .k
            .try_inverse()
            .ok_or_else(|| Error::Geometry("intrinsic matrix is singular".into()))?;
        Ok(k_inv * pixel)
    }
}

/// Solver output for one pair, before it is keyed into the manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoSolution {
    pub intrinsics_a: CameraIntrinsics,
    pub intrinsics_b: CameraIntrinsics,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// RMS reprojection error reported by the solver, if any.
    pub rms_error: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoCalibration {
    pub pair: SourcePair,
    pub intrinsics_from: CameraIntrinsics,
    pub intrinsics_to: CameraIntrinsics,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl StereoCalibration {
    pub fn from_solution(pair: SourcePair, solution: StereoSolution) -> Self {
        Self {
            pair,
            intrinsics_from: solution.intrinsics_a,
            intrinsics_to: solution.intrinsics_b,
            rotation: solution.rotation,
            translation: solution.translation,
        }
    }

    /// The `(to, from)` record: `R' = Rᵀ`, `T' = -Rᵀ·T`.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.transpose();
        Self {
            pair: self.pair.reversed(),
            intrinsics_from: self.intrinsics_to.clone(),
            intrinsics_to: self.intrinsics_from.clone(),
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    pub fn transform_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * p.coords + self.translation)
    }
}

/// Camera origin and ray point of the source camera, expressed in the
/// target camera's frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Projection {
    pub origin: Point3<f64>,
    pub point: Point3<f64>,
}

impl Projection {
    pub fn direction(&self) -> Vector3<f64> {
        self.point - self.origin
    }
}

/// Known 3D geometry of a chessboard: `rows x cols` inner corners on the
/// `z = 0` plane, row-major.
pub fn chessboard_object_points(rows: u32, cols: u32, square_size: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(rows as usize * cols as usize);
    for r in 0..rows {
        for c in 0..cols {
            points.push(Point3::new(
                f64::from(c) * square_size,
                f64::from(r) * square_size,
                0.0,
            ));
        }
    }
    points
}
