//! Test doubles for the rig's collaborators.

use crate::inference::{Landmark, PoseResult};
use crate::{
    BoxError, CameraIntrinsics, PatternDetector, PoseEstimator, SourceFactory, StereoSolution,
    StereoSolver,
};
use async_trait::async_trait;
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vision_capture::{
    Error as DeviceError, Frame, FrameSource, Image, Resolution, ScriptProbe, ScriptedSource,
    SourceId,
};

#[derive(Clone, Copy, Debug)]
struct ScriptSpec {
    start_ms: i64,
    step_ms: i64,
    fail_after: Option<usize>,
}

/// Hands out [`ScriptedSource`]s for the ids it was configured with and
/// keeps a probe for each one it created.
#[derive(Default)]
pub struct ScriptedSourceFactory {
    specs: HashMap<SourceId, ScriptSpec>,
    probes: Mutex<HashMap<SourceId, ScriptProbe>>,
}

impl ScriptedSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every id starts at 1000 ms and advances in lockstep.
    pub fn aligned(ids: &[SourceId], step_ms: i64) -> Self {
        ids.iter()
            .fold(Self::new(), |f, &id| f.with_source(id, 1_000, step_ms))
    }

    pub fn with_source(mut self, source_id: SourceId, start_ms: i64, step_ms: i64) -> Self {
        self.specs.insert(
            source_id,
            ScriptSpec {
                start_ms,
                step_ms,
                fail_after: None,
            },
        );
        self
    }

    pub fn with_failing_source(
        mut self,
        source_id: SourceId,
        start_ms: i64,
        step_ms: i64,
        fail_after: usize,
    ) -> Self {
        self.specs.insert(
            source_id,
            ScriptSpec {
                start_ms,
                step_ms,
                fail_after: Some(fail_after),
            },
        );
        self
    }

    /// Probe of the most recent source created for `source_id`.
    pub fn probe(&self, source_id: SourceId) -> Option<ScriptProbe> {
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source_id)
            .cloned()
    }
}

impl SourceFactory for ScriptedSourceFactory {
    fn create(&self, source_id: SourceId) -> vision_capture::Result<Box<dyn FrameSource>> {
        let spec = self
            .specs
            .get(&source_id)
            .ok_or_else(|| DeviceError::NotFound(format!("scripted source {source_id}")))?;
        let mut source = ScriptedSource::new(source_id, spec.start_ms, spec.step_ms);
        if let Some(n) = spec.fail_after {
            source = source.fail_after(n);
        }
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(source_id, source.probe());
        Ok(Box::new(source))
    }
}

type ImageFilter = Box<dyn Fn(&Image) -> bool + Send + Sync>;

/// Reports a synthetic `rows x cols` corner grid for every image it
/// accepts, optionally only for the first `budget` detections.
pub struct MockPatternDetector {
    rows: u32,
    cols: u32,
    budget: Option<AtomicUsize>,
    accept: Option<ImageFilter>,
    calls: AtomicUsize,
}

impl MockPatternDetector {
    pub fn always(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            budget: None,
            accept: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_budget(rows: u32, cols: u32, detections: usize) -> Self {
        Self {
            budget: Some(AtomicUsize::new(detections)),
            ..Self::always(rows, cols)
        }
    }

    pub fn with_filter(mut self, accept: impl Fn(&Image) -> bool + Send + Sync + 'static) -> Self {
        self.accept = Some(Box::new(accept));
        self
    }

    /// Number of `detect_pattern` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn grid(&self) -> Vec<Point2<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols)
                    .map(move |c| Point2::new(5.0 + 10.0 * f64::from(c), 5.0 + 10.0 * f64::from(r)))
            })
            .collect()
    }
}

impl PatternDetector for MockPatternDetector {
    fn detect_pattern(&self, image: &Image) -> Option<Vec<Point2<f64>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(accept) = &self.accept {
            if !accept(image) {
                return None;
            }
        }
        if let Some(budget) = &self.budget {
            budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .ok()?;
        }
        Some(self.grid())
    }
}

/// Returns fixed extrinsics and pinhole intrinsics derived from the image
/// size (`f = width`, principal point at the center).
pub struct MockStereoSolver {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    fail_on_call: Option<usize>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Default for MockStereoSolver {
    fn default() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::new(-0.1, 0.0, 0.0),
            fail_on_call: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockStereoSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extrinsics(mut self, rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        self.rotation = rotation;
        self.translation = translation;
        self
    }

    /// Fail the `n`-th call (1-based).
    pub fn fail_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Block the calling thread this long on every solve.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StereoSolver for MockStereoSolver {
    fn solve(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points_a: &[Vec<Point2<f64>>],
        image_points_b: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<StereoSolution, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_on_call == Some(call) {
            return Err(format!("scripted failure on call {call}").into());
        }
        if object_points.is_empty()
            || object_points.len() != image_points_a.len()
            || object_points.len() != image_points_b.len()
        {
            return Err(format!(
                "mismatched samples: {} object, {} a, {} b",
                object_points.len(),
                image_points_a.len(),
                image_points_b.len()
            )
            .into());
        }
        let w = f64::from(image_size.width);
        let h = f64::from(image_size.height);
        let intrinsics = CameraIntrinsics::pinhole(w, w / 2.0, h / 2.0);
        Ok(StereoSolution {
            intrinsics_a: intrinsics.clone(),
            intrinsics_b: intrinsics,
            rotation: self.rotation,
            translation: self.translation,
            rms_error: Some(0.0),
        })
    }
}

/// Produces a fixed skeleton per frame after an optional delay.
#[derive(Default)]
pub struct MockPoseEstimator {
    delay: Option<Duration>,
    failing: Option<SourceId>,
}

impl MockPoseEstimator {
    pub const LANDMARKS: usize = 33;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_on(mut self, source_id: SourceId) -> Self {
        self.failing = Some(source_id);
        self
    }
}

#[async_trait]
impl PoseEstimator for MockPoseEstimator {
    async fn estimate(&self, frame: Frame) -> Result<PoseResult, BoxError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing == Some(frame.source_id) {
            return Err(format!("no pose for source {}", frame.source_id).into());
        }
        let landmarks = (0..Self::LANDMARKS)
            .map(|i| Landmark {
                x: i as f64 / Self::LANDMARKS as f64,
                y: 0.5,
                z: 0.0,
                presence: 1.0,
            })
            .collect();
        Ok(PoseResult {
            source_id: frame.source_id,
            timestamp_ms: frame.timestamp_ms,
            landmarks,
        })
    }
}
