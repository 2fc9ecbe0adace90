use crate::{CameraDevice, Error, Image, PixelFormat, Resolution, Result, SourceId};
use opencv::prelude::*;
use opencv::{core, imgproc, videoio};

pub struct OpenCvDevice {
    cap: videoio::VideoCapture,
    resolution: Resolution,
}

impl OpenCvDevice {
    fn read_mat(&mut self) -> Result<core::Mat> {
        read_mat(&mut self.cap)
    }
}

fn read_mat(cap: &mut videoio::VideoCapture) -> Result<core::Mat> {
    let mut mat = core::Mat::default();
    cap.read(&mut mat)
        .map_err(|e| Error::Backend(e.to_string()))?;
    if mat.empty() {
        return Err(Error::Io("empty frame".into()));
    }
    Ok(mat)
}

impl CameraDevice for OpenCvDevice {
    fn open(index: SourceId, requested: Resolution) -> Result<Self> {
        let mut cap = videoio::VideoCapture::new(index as i32, videoio::CAP_ANY)
            .map_err(|e| Error::Backend(e.to_string()))?;
        let opened =
            videoio::VideoCapture::is_opened(&cap).map_err(|e| Error::Backend(e.to_string()))?;
        if !opened {
            return Err(Error::NotFound(index.to_string()));
        }
        cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(requested.width))
            .map_err(|e| Error::Backend(e.to_string()))?;
        cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(requested.height))
            .map_err(|e| Error::Backend(e.to_string()))?;

        // Drivers may ignore the request; trust the first frame, not the properties.
        let first = read_mat(&mut cap)?;
        let resolution = Resolution::new(first.cols() as u32, first.rows() as u32);
        Ok(Self { cap, resolution })
    }

    fn backend_name(&self) -> &'static str {
        "opencv"
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn capture(&mut self) -> Result<Image> {
        let mat = self.read_mat()?;
        let width = mat.cols() as u32;
        let height = mat.rows() as u32;

        // Convert to RGB8
        let mut rgb = core::Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)
            .map_err(|e| Error::Backend(e.to_string()))?;

        let data = rgb
            .data_bytes()
            .map_err(|e| Error::Backend(e.to_string()))?
            .to_vec();
        Ok(Image {
            width,
            height,
            pixel_format: PixelFormat::Rgb8,
            data,
        })
    }
}
