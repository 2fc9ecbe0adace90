use crate::inference::PoseResult;
use crate::StereoSolution;
use async_trait::async_trait;
use nalgebra::{Point2, Point3};
use std::error::Error;
use vision_capture::{Frame, FrameSource, Image, Resolution, SourceId};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Builds the frame source for one camera when the rig starts.
pub trait SourceFactory: Send + Sync {
    fn create(&self, source_id: SourceId) -> vision_capture::Result<Box<dyn FrameSource>>;
}

/// Calibration pattern detection (e.g. chessboard corners).
pub trait PatternDetector: Send + Sync {
    /// Corners in pixel coordinates, ordered like the board's object points,
    /// or `None` when the pattern is not visible.
    fn detect_pattern(&self, image: &Image) -> Option<Vec<Point2<f64>>>;

    /// Sub-pixel refinement of detected corners.
    fn refine(&self, _image: &Image, corners: Vec<Point2<f64>>) -> Vec<Point2<f64>> {
        corners
    }
}

/// Stereo calibration from accumulated correspondences.
pub trait StereoSolver: Send + Sync {
    fn solve(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points_a: &[Vec<Point2<f64>>],
        image_points_b: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<StereoSolution, BoxError>;
}

/// Per-camera pose inference. Consumes frames from synchronized batches.
#[async_trait]
pub trait PoseEstimator: Send + Sync {
    async fn estimate(&self, frame: Frame) -> Result<PoseResult, BoxError>;
}
