//! Threaded capture: one OS thread per camera writing into a single-slot,
//! latest-wins buffer. A newer frame replaces an unread older one.

use crate::{CameraDevice, Error, Frame, FrameSource, Resolution, Result, SourceId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct CaptureConfig {
    pub requested: Resolution,
    /// How long `get_frame` waits for a fresh frame before reporting a stall.
    pub stall_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            requested: Resolution::new(640, 480),
            stall_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    seq: u64,
    error: Option<Error>,
    running: bool,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panicking capture thread must not take the consumer down with it.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hardware-backed [`FrameSource`]: owns device `D` on a dedicated thread
/// between `start` and `stop`.
pub struct CaptureSource<D: CameraDevice> {
    source_id: SourceId,
    resolution: Resolution,
    config: CaptureConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    last_seq: u64,
    _device: PhantomData<fn() -> D>,
}

impl<D: CameraDevice + 'static> CaptureSource<D> {
    /// Negotiate the capture resolution by opening the device once,
    /// requesting `config.requested` and reading back what it accepted.
    pub fn new(source_id: SourceId, config: CaptureConfig) -> Result<Self> {
        let probe = D::open(source_id, config.requested)?;
        let resolution = probe.resolution();
        drop(probe);
        if resolution != config.requested {
            info!(
                source_id,
                requested = ?config.requested,
                accepted = ?resolution,
                "device overrode requested resolution"
            );
        }
        Ok(Self {
            source_id,
            resolution,
            config,
            shared: Arc::new(Shared::default()),
            worker: None,
            last_seq: 0,
            _device: PhantomData,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl<D: CameraDevice + 'static> FrameSource for CaptureSource<D> {
    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyStarted(self.source_id));
        }
        // Open on the caller's thread so open failures surface synchronously.
        let device = D::open(self.source_id, self.resolution)?;
        let shared = Arc::new(Shared::default());
        shared.lock().running = true;
        let thread_shared = shared.clone();
        let source_id = self.source_id;
        let worker = thread::Builder::new()
            .name(format!("capture-{source_id}"))
            .spawn(move || capture_loop(device, source_id, thread_shared))
            .map_err(|e| Error::Io(e.to_string()))?;
        self.shared = shared;
        self.worker = Some(worker);
        self.last_seq = 0;
        info!(source_id, resolution = ?self.resolution, "capture started");
        Ok(())
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        if worker.join().is_err() {
            warn!(source_id = self.source_id, "capture thread panicked");
        }
        info!(source_id = self.source_id, "capture stopped");
    }

    fn get_frame(&mut self) -> Result<Frame> {
        if self.worker.is_none() {
            return Err(Error::NotStarted(self.source_id));
        }
        let deadline = Instant::now() + self.config.stall_timeout;
        let mut slot = self.shared.lock();
        loop {
            if let Some(err) = slot.error.take() {
                return Err(err);
            }
            if slot.seq > self.last_seq {
                if let Some(frame) = slot.frame.clone() {
                    self.last_seq = slot.seq;
                    return Ok(frame);
                }
            }
            if !slot.running {
                return Err(Error::Disconnected(self.source_id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Stalled {
                    source_id: self.source_id,
                    waited: self.config.stall_timeout,
                });
            }
            slot = match self.shared.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl<D: CameraDevice> Drop for CaptureSource<D> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.stop.store(true, Ordering::Release);
            let _ = worker.join();
        }
    }
}

fn capture_loop<D: CameraDevice>(mut device: D, source_id: SourceId, shared: Arc<Shared>) {
    debug!(source_id, "capture thread running");
    while !shared.stop.load(Ordering::Acquire) {
        match device.capture() {
            Ok(image) => {
                let frame = Frame::stamped_now(source_id, image);
                let mut slot = shared.lock();
                slot.frame = Some(frame);
                slot.seq += 1;
                drop(slot);
                shared.ready.notify_all();
            }
            Err(e) => {
                warn!(source_id, error = %e, "capture failed, thread exiting");
                shared.lock().error = Some(e);
                break;
            }
        }
    }
    drop(device);
    shared.lock().running = false;
    shared.ready.notify_all();
    debug!(source_id, "capture thread exited");
}
