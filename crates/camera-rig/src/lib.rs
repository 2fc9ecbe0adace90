//! camera-rig: synchronized multi-camera batches, background stereo
//! calibration and cross-camera projection

mod error;
pub use error::{Error, Result};

mod config;
pub use config::{
    load_config_file, BoardConfig, CalibrationConfig, CaptureSettings, CollectorConfig, RigConfig,
    MAX_BOARD_CORNERS,
};

mod batch;
pub use batch::FrameBatch;

mod collector;
pub use collector::{FrameCollector, SourceMap};

mod geometry;
pub use geometry::{
    chessboard_object_points, CameraIntrinsics, Projection, SourcePair, StereoCalibration,
    StereoSolution,
};

mod traits;
pub use traits::{BoxError, PatternDetector, PoseEstimator, SourceFactory, StereoSolver};

mod sources;
pub use sources::DeviceSourceFactory;

pub mod calibration;
pub use calibration::{
    CalibrationReport, CalibrationStatus, CorrespondenceSet, PairFailure,
};

pub mod inference;
pub use inference::{
    collect_pose_results, fuse_landmarks_3d, Landmark, Landmarks3d, PoseResult,
};

mod manager;
pub use manager::CameraManager;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "opencv")]
mod opencv_backend;
#[cfg(feature = "opencv")]
pub use opencv_backend::{OpenCvChessboardDetector, OpenCvStereoSolver};
