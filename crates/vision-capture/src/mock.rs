use crate::{
    CameraDevice, Error, Frame, FrameSource, Image, PixelFormat, Resolution, Result, SourceId,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Synthetic camera producing a moving gray ramp at a fixed pace.
pub struct MockDevice {
    index: SourceId,
    resolution: Resolution,
    counter: u64,
}

impl MockDevice {
    /// Indices `0..DEVICE_COUNT` open successfully.
    pub const DEVICE_COUNT: SourceId = 4;
    pub const MAX_RESOLUTION: Resolution = Resolution::new(1280, 720);
    pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);
}

impl CameraDevice for MockDevice {
    fn open(index: SourceId, requested: Resolution) -> Result<Self> {
        if index >= Self::DEVICE_COUNT {
            return Err(Error::NotFound(format!("mock{index}")));
        }
        // Clamp like a real sensor would
        let resolution = Resolution::new(
            requested.width.clamp(1, Self::MAX_RESOLUTION.width),
            requested.height.clamp(1, Self::MAX_RESOLUTION.height),
        );
        Ok(Self {
            index,
            resolution,
            counter: 0,
        })
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn capture(&mut self) -> Result<Image> {
        std::thread::sleep(Self::FRAME_INTERVAL);
        self.counter += 1;
        let Resolution { width, height } = self.resolution;
        let shift = self.counter + u64::from(self.index) * 17;
        let mut data = vec![0u8; (width as usize) * (height as usize)];
        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                data[idx] = ((u64::from(x + y) + shift) % 256) as u8;
            }
        }
        Ok(Image {
            width,
            height,
            pixel_format: PixelFormat::Gray8,
            data,
        })
    }
}

/// Observation handle for a [`ScriptedSource`] that has been moved into a manager.
#[derive(Clone, Debug, Default)]
pub struct ScriptProbe {
    calls: Arc<AtomicUsize>,
    started: Arc<AtomicBool>,
}

impl ScriptProbe {
    /// Number of `get_frame` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Deterministic test double: timestamps begin at `start_ms` and advance by
/// `step_ms` on every acquisition, without touching the wall clock.
pub struct ScriptedSource {
    source_id: SourceId,
    next_ts: i64,
    step_ms: i64,
    fail_after: Option<usize>,
    image: Arc<Image>,
    probe: ScriptProbe,
}

impl ScriptedSource {
    pub fn new(source_id: SourceId, start_ms: i64, step_ms: i64) -> Self {
        Self {
            source_id,
            next_ts: start_ms,
            step_ms,
            fail_after: None,
            image: Arc::new(Image::filled_gray(4, 4, source_id as u8)),
            probe: ScriptProbe::default(),
        }
    }

    /// Report the device as disconnected once `n` frames have been served.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_image(mut self, image: Image) -> Self {
        self.image = Arc::new(image);
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        self.probe.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn start(&mut self) -> Result<()> {
        if self.probe.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.source_id));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.probe.started.store(false, Ordering::SeqCst);
    }

    fn get_frame(&mut self) -> Result<Frame> {
        if !self.probe.is_started() {
            return Err(Error::NotStarted(self.source_id));
        }
        let served = self.probe.calls.load(Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| served >= n) {
            return Err(Error::Disconnected(self.source_id));
        }
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new(self.source_id, self.image.clone(), self.next_ts);
        self.next_ts += self.step_ms;
        Ok(frame)
    }
}
