//! Chessboard detection and stereo calibration on OpenCV's calib3d.

use crate::{BoxError, CameraIntrinsics, PatternDetector, StereoSolution, StereoSolver};
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use opencv::prelude::*;
use opencv::{calib3d, core, imgproc};
use tracing::debug;
use vision_capture::{Image, PixelFormat, Resolution};

fn to_gray(image: &Image) -> opencv::Result<core::Mat> {
    let channels = image.pixel_format.channels() as i32;
    let mut mat = core::Mat::new_rows_cols_with_default(
        image.height as i32,
        image.width as i32,
        core::CV_MAKETYPE(core::CV_8U, channels),
        core::Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(&image.data);
    let code = match image.pixel_format {
        PixelFormat::Gray8 => return Ok(mat),
        PixelFormat::Rgb8 => imgproc::COLOR_RGB2GRAY,
        PixelFormat::Bgr8 => imgproc::COLOR_BGR2GRAY,
    };
    let mut gray = core::Mat::default();
    imgproc::cvt_color(&mat, &mut gray, code, 0)?;
    Ok(gray)
}

/// Inner-corner chessboard detector with sub-pixel refinement.
pub struct OpenCvChessboardDetector {
    pattern: core::Size,
}

impl OpenCvChessboardDetector {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self {
            pattern: core::Size::new(cols as i32, rows as i32),
        }
    }

    fn find(&self, image: &Image) -> opencv::Result<Option<Vec<Point2<f64>>>> {
        let gray = to_gray(image)?;
        let mut corners = core::Vector::<core::Point2f>::new();
        let found = calib3d::find_chessboard_corners(
            &gray,
            self.pattern,
            &mut corners,
            calib3d::CALIB_CB_ADAPTIVE_THRESH | calib3d::CALIB_CB_NORMALIZE_IMAGE,
        )?;
        if !found {
            return Ok(None);
        }
        Ok(Some(
            corners
                .iter()
                .map(|p| Point2::new(f64::from(p.x), f64::from(p.y)))
                .collect(),
        ))
    }

    fn sub_pix(&self, image: &Image, corners: &[Point2<f64>]) -> opencv::Result<Vec<Point2<f64>>> {
        let gray = to_gray(image)?;
        let mut refined: core::Vector<core::Point2f> = corners
            .iter()
            .map(|p| core::Point2f::new(p.x as f32, p.y as f32))
            .collect();
        let term = core::TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
            30,
            0.01,
        )?;
        imgproc::corner_sub_pix(
            &gray,
            &mut refined,
            core::Size::new(11, 11),
            core::Size::new(-1, -1),
            term,
        )?;
        Ok(refined
            .iter()
            .map(|p| Point2::new(f64::from(p.x), f64::from(p.y)))
            .collect())
    }
}

impl PatternDetector for OpenCvChessboardDetector {
    fn detect_pattern(&self, image: &Image) -> Option<Vec<Point2<f64>>> {
        match self.find(image) {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, "chessboard detection failed");
                None
            }
        }
    }

    fn refine(&self, image: &Image, corners: Vec<Point2<f64>>) -> Vec<Point2<f64>> {
        match self.sub_pix(image, &corners) {
            Ok(refined) => refined,
            Err(e) => {
                debug!(error = %e, "corner refinement failed, keeping raw corners");
                corners
            }
        }
    }
}

/// `cv::stereoCalibrate` with per-camera intrinsics estimated jointly.
#[derive(Default)]
pub struct OpenCvStereoSolver {
    pub flags: i32,
}

impl OpenCvStereoSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StereoSolver for OpenCvStereoSolver {
    fn solve(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points_a: &[Vec<Point2<f64>>],
        image_points_b: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<StereoSolution, BoxError> {
        let objects: core::Vector<core::Vector<core::Point3f>> = object_points
            .iter()
            .map(|view| {
                view.iter()
                    .map(|p| core::Point3f::new(p.x as f32, p.y as f32, p.z as f32))
                    .collect()
            })
            .collect();
        let to_cv = |views: &[Vec<Point2<f64>>]| -> core::Vector<core::Vector<core::Point2f>> {
            views
                .iter()
                .map(|view| {
                    view.iter()
                        .map(|p| core::Point2f::new(p.x as f32, p.y as f32))
                        .collect()
                })
                .collect()
        };
        let points_a = to_cv(image_points_a);
        let points_b = to_cv(image_points_b);

        let mut k1 = core::Mat::eye(3, 3, core::CV_64F)?.to_mat()?;
        let mut d1 = core::Mat::zeros(5, 1, core::CV_64F)?.to_mat()?;
        let mut k2 = core::Mat::eye(3, 3, core::CV_64F)?.to_mat()?;
        let mut d2 = core::Mat::zeros(5, 1, core::CV_64F)?.to_mat()?;
        let mut r = core::Mat::default();
        let mut t = core::Mat::default();
        let mut e = core::Mat::default();
        let mut f = core::Mat::default();
        let criteria = core::TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
            100,
            1e-6,
        )?;
        let rms = calib3d::stereo_calibrate(
            &objects,
            &points_a,
            &points_b,
            &mut k1,
            &mut d1,
            &mut k2,
            &mut d2,
            core::Size::new(image_size.width as i32, image_size.height as i32),
            &mut r,
            &mut t,
            &mut e,
            &mut f,
            self.flags,
            criteria,
        )?;
        debug!(rms, views = object_points.len(), "stereo calibration solved");

        let translation = mat_to_vec(&t)?;
        if translation.len() != 3 {
            return Err(format!("expected 3 translation components, got {}", translation.len()).into());
        }

        Ok(StereoSolution {
            intrinsics_a: CameraIntrinsics::new(mat3(&k1)?, mat_to_vec(&d1)?),
            intrinsics_b: CameraIntrinsics::new(mat3(&k2)?, mat_to_vec(&d2)?),
            rotation: mat3(&r)?,
            translation: Vector3::from_column_slice(&translation),
            rms_error: Some(rms),
        })
    }
}

fn mat3(m: &core::Mat) -> opencv::Result<Matrix3<f64>> {
    let mut out = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            out[(r, c)] = *m.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(out)
}

fn mat_to_vec(m: &core::Mat) -> opencv::Result<Vec<f64>> {
    let total = m.rows() * m.cols();
    (0..total).map(|i| m.at::<f64>(i).copied()).collect()
}
