use crate::SourceFactory;
use std::marker::PhantomData;
use vision_capture::{CameraDevice, CaptureConfig, CaptureSource, FrameSource, SourceId};

/// Builds threaded [`CaptureSource`]s over device type `D`.
pub struct DeviceSourceFactory<D> {
    config: CaptureConfig,
    _device: PhantomData<fn() -> D>,
}

impl<D: CameraDevice + 'static> DeviceSourceFactory<D> {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            _device: PhantomData,
        }
    }
}

impl<D: CameraDevice + 'static> SourceFactory for DeviceSourceFactory<D> {
    fn create(&self, source_id: SourceId) -> vision_capture::Result<Box<dyn FrameSource>> {
        let source = CaptureSource::<D>::new(source_id, self.config)?;
        Ok(Box::new(source))
    }
}
