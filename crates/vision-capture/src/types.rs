use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

/// Integer identifier of a camera (device index).
pub type SourceId = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Row-major pixel buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

impl Image {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Solid gray image, mostly useful for tests and placeholders.
    pub fn filled_gray(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            data: vec![value; (width as usize) * (height as usize)],
        }
    }
}

/// One acquisition from one source. The pixel buffer is shared so cached
/// batches can be handed out repeatedly without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub source_id: SourceId,
    pub image: Arc<Image>,
    /// Acquisition time, Unix milliseconds.
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn new(source_id: SourceId, image: impl Into<Arc<Image>>, timestamp_ms: i64) -> Self {
        Self {
            source_id,
            image: image.into(),
            timestamp_ms,
        }
    }

    /// Label `image` with the current wall-clock time.
    pub fn stamped_now(source_id: SourceId, image: impl Into<Arc<Image>>) -> Self {
        Self::new(source_id, image, now_ms())
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: SourceId,
    pub backend: String,
    pub resolution: Resolution,
}
