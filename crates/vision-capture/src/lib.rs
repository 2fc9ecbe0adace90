//! vision-capture: camera device abstraction, threaded latest-frame capture,
//! and an optional OpenCV backend

mod types;
pub use types::{now_ms, DeviceInfo, Frame, Image, PixelFormat, Resolution, SourceId};

mod error;
pub use error::{Error, Result};

mod traits;
pub use traits::{CameraDevice, FrameSource};

mod capture;
pub use capture::{CaptureConfig, CaptureSource};

mod enumerate;
pub use enumerate::enumerate_devices;

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "mock")]
pub use mock::{MockDevice, ScriptProbe, ScriptedSource};

#[cfg(feature = "opencv")]
mod opencv_backend;
#[cfg(feature = "opencv")]
pub use opencv_backend::OpenCvDevice;
