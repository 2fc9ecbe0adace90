use crate::{Frame, Image, Resolution, Result, SourceId};

/// A raw camera handle. Dropping the handle closes the device.
pub trait CameraDevice: Send {
    /// Open a camera by device index, asking for `requested` resolution.
    /// Devices may clamp or override the request; read it back with
    /// [`CameraDevice::resolution`].
    fn open(index: SourceId, requested: Resolution) -> Result<Self>
    where
        Self: Sized;

    /// Backend name reported during enumeration.
    fn backend_name(&self) -> &'static str {
        "unknown"
    }

    /// Resolution the device actually settled on.
    fn resolution(&self) -> Resolution;

    /// Capture a single image, blocking until the device delivers one.
    fn capture(&mut self) -> Result<Image>;
}

/// Something that produces timestamped frames for one camera.
pub trait FrameSource: Send {
    fn source_id(&self) -> SourceId;

    /// Acquire the device and begin continuous capture.
    fn start(&mut self) -> Result<()>;

    /// Release the device. Safe to call on a stopped source.
    fn stop(&mut self);

    /// Blocking read of the newest frame.
    fn get_frame(&mut self) -> Result<Frame>;
}
