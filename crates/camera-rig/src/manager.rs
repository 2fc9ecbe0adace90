use crate::calibration::{
    CalibrationBackend, CalibrationProcedure, CalibrationReport, CalibrationState,
    CalibrationStatus,
};
use crate::{
    CameraIntrinsics, Error, FrameBatch, FrameCollector, PatternDetector, Projection, Result,
    RigConfig, SourceFactory, SourceMap, SourcePair, StereoCalibration, StereoSolution,
    StereoSolver,
};
use nalgebra::Point3;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vision_capture::SourceId;

struct Session {
    sources: SourceMap,
    collector: FrameCollector,
}

#[derive(Default)]
struct CalibrationStore {
    pairs: HashMap<SourcePair, Arc<StereoCalibration>>,
    intrinsics: HashMap<SourceId, Arc<CameraIntrinsics>>,
}

struct RunningCalibration {
    cancel: watch::Sender<bool>,
    /// Flips to `true` once the run has written its final state.
    done: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

/// Owns the camera session, the synchronized batch path and the
/// calibration records. Share it behind an `Arc`.
pub struct CameraManager {
    config: RigConfig,
    factory: Arc<dyn SourceFactory>,
    backend: Option<CalibrationBackend>,
    session: Arc<Mutex<Option<Session>>>,
    store: RwLock<CalibrationStore>,
    calibration: RwLock<CalibrationState>,
    running: Mutex<Option<RunningCalibration>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

impl CameraManager {
    pub fn new(config: RigConfig, factory: Arc<dyn SourceFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            backend: None,
            session: Arc::new(Mutex::new(None)),
            store: RwLock::new(CalibrationStore::default()),
            calibration: RwLock::new(CalibrationState::default()),
            running: Mutex::new(None),
        })
    }

    pub fn with_calibration_backend(
        mut self,
        detector: Arc<dyn PatternDetector>,
        solver: Arc<dyn StereoSolver>,
    ) -> Self {
        self.backend = Some(CalibrationBackend { detector, solver });
        self
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Create and start one source per id. Either every source starts or
    /// none is left running.
    pub fn start(&self, source_ids: &[SourceId]) -> Result<()> {
        let mut session = lock(&self.session);
        if session.is_some() {
            return Err(Error::invalid_state("camera manager already started"));
        }
        if source_ids.is_empty() {
            return Err(Error::invalid_state("no source ids given"));
        }
        let collector = FrameCollector::new(&self.config.collector)?;

        let mut ids = source_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut sources = SourceMap::new();
        for source_id in ids {
            let started = self.factory.create(source_id).and_then(|mut source| {
                source.start()?;
                Ok(source)
            });
            match started {
                Ok(source) => {
                    debug!(source_id, "source started");
                    sources.insert(source_id, source);
                }
                Err(error) => {
                    warn!(source_id, %error, "source failed to start, rolling back");
                    for source in sources.values_mut() {
                        source.stop();
                    }
                    return Err(Error::Device { source_id, error });
                }
            }
        }

        info!(sources = ?sources.keys().collect::<Vec<_>>(), "camera manager started");
        *session = Some(Session { sources, collector });
        Ok(())
    }

    /// Cancel any calibration run, wait for it, then release every source.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_calibration().await;

        // The session lock can be held by a batch for up to the collector
        // timeout, so take it off the runtime threads.
        let session = self.session.clone();
        let released = tokio::task::spawn_blocking(move || {
            let mut session = lock(&session).take()?;
            session.collector.invalidate();
            for source in session.sources.values_mut() {
                source.stop();
            }
            Some(session.sources.len())
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))?;
        let Some(released) = released else {
            return Err(Error::invalid_state("camera manager not started"));
        };
        // A run begun while we were cancelling sees no session and ends on
        // its own; make sure it has.
        self.cancel_calibration().await;
        debug!(released, "sources released");

        *write(&self.store) = CalibrationStore::default();
        write(&self.calibration).calibrated = false;
        info!("camera manager stopped");
        Ok(())
    }

    async fn cancel_calibration(&self) {
        let running = lock(&self.running).take();
        if let Some(running) = running {
            let _ = running.cancel.send(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "calibration task ended abnormally");
            }
        }
    }

    /// One synchronized batch. Blocks up to the collector timeout.
    pub fn get_batch(&self) -> Result<FrameBatch> {
        let mut session = lock(&self.session);
        let Some(Session { sources, collector }) = session.as_mut() else {
            return Err(Error::invalid_state("camera manager not started"));
        };
        collector.synchronize(sources)
    }

    pub fn is_started(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn active_sources(&self) -> Vec<SourceId> {
        lock(&self.session)
            .as_ref()
            .map(|s| s.sources.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Store `pair` and its inverse, and the intrinsics of both cameras,
    /// in a single write.
    pub fn set_calibration(&self, pair: SourcePair, solution: StereoSolution) -> Result<()> {
        if pair.from == pair.to {
            return Err(Error::invalid_state(format!(
                "cannot calibrate source {} against itself",
                pair.from
            )));
        }
        let forward = StereoCalibration::from_solution(pair, solution);
        let inverse = forward.inverse();
        let intrinsics_from = Arc::new(forward.intrinsics_from.clone());
        let intrinsics_to = Arc::new(forward.intrinsics_to.clone());

        let mut store = write(&self.store);
        store.intrinsics.insert(pair.from, intrinsics_from);
        store.intrinsics.insert(pair.to, intrinsics_to);
        store.pairs.insert(pair, Arc::new(forward));
        store.pairs.insert(pair.reversed(), Arc::new(inverse));
        debug!(%pair, "calibration stored");
        Ok(())
    }

    pub fn get_calibration(&self, pair: SourcePair) -> Result<Arc<StereoCalibration>> {
        read(&self.store)
            .pairs
            .get(&pair)
            .cloned()
            .ok_or(Error::NotCalibrated {
                from: pair.from,
                to: pair.to,
            })
    }

    pub fn intrinsics(&self, source_id: SourceId) -> Option<Arc<CameraIntrinsics>> {
        read(&self.store).intrinsics.get(&source_id).cloned()
    }

    /// Back-project `(u, v)` of camera `from` and express the camera origin
    /// and the unit-depth ray point in camera `to`'s frame.
    pub fn project(&self, from: SourceId, to: SourceId, u: f64, v: f64) -> Result<Projection> {
        let not_calibrated = || Error::NotCalibrated { from, to };
        let (intrinsics, record) = {
            let store = read(&self.store);
            let intrinsics = store.intrinsics.get(&from).cloned().ok_or_else(not_calibrated)?;
            if !store.intrinsics.contains_key(&to) {
                return Err(not_calibrated());
            }
            let record = if from == to {
                None
            } else {
                Some(
                    store
                        .pairs
                        .get(&SourcePair::new(from, to))
                        .cloned()
                        .ok_or_else(not_calibrated)?,
                )
            };
            (intrinsics, record)
        };

        let ray_point = Point3::from(intrinsics.ray_through(u, v)?);
        Ok(match record {
            Some(record) => Projection {
                origin: record.transform_point(&Point3::origin()),
                point: record.transform_point(&ray_point),
            },
            None => Projection {
                origin: Point3::origin(),
                point: ray_point,
            },
        })
    }

    /// Launch the calibration procedure on the current Tokio runtime.
    ///
    /// Preconditions are checked before anything changes; on rejection the
    /// status is left as it was.
    pub fn begin_calibration(self: &Arc<Self>) -> Result<Uuid> {
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| Error::invalid_state("no calibration backend configured"))?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::invalid_state("calibration requires a tokio runtime"))?;
        let source_ids = {
            let session = lock(&self.session);
            let Some(session) = session.as_ref() else {
                return Err(Error::invalid_state("camera manager not started"));
            };
            session.sources.keys().copied().collect::<Vec<_>>()
        };
        if source_ids.len() < 2 {
            return Err(Error::invalid_state(format!(
                "calibration needs at least 2 sources, have {}",
                source_ids.len()
            )));
        }

        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(Error::invalid_state("calibration already running"));
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let (done_tx, done) = watch::channel(false);
        let procedure = CalibrationProcedure::new(
            self.clone(),
            backend,
            &self.config.calibration,
            &source_ids,
            cancel_rx,
        );
        let run_id = procedure.run_id();
        self.update_calibration(|state| {
            state.status = CalibrationStatus::Sampling;
            state.progress = 0.0;
            state.report = None;
        });
        let handle = runtime.spawn(async move {
            procedure.run().await;
            let _ = done_tx.send(true);
        });
        *running = Some(RunningCalibration {
            cancel,
            done,
            handle,
        });
        info!(%run_id, sources = ?source_ids, "calibration requested");
        Ok(run_id)
    }

    /// Wait for the current calibration run, if any, and return the report
    /// of the last finished run.
    ///
    /// The run stays owned by the manager, so `stop()` can still cancel it
    /// while callers wait.
    pub async fn wait_for_calibration(&self) -> Option<CalibrationReport> {
        let done = lock(&self.running).as_ref().map(|r| r.done.clone());
        if let Some(mut done) = done {
            // An error means the task ended without reporting; the last
            // written report is still the best answer.
            if done.wait_for(|finished| *finished).await.is_err() {
                warn!("calibration task ended without completing");
            }
        }
        self.calibration_report()
    }

    pub fn is_calibrated(&self) -> bool {
        read(&self.calibration).calibrated
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        read(&self.calibration).status
    }

    pub fn calibration_progress(&self) -> f64 {
        read(&self.calibration).progress
    }

    pub fn calibration_report(&self) -> Option<CalibrationReport> {
        read(&self.calibration).report.clone()
    }

    pub(crate) fn update_calibration(&self, f: impl FnOnce(&mut CalibrationState)) {
        f(&mut write(&self.calibration));
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::{MockPatternDetector, MockStereoSolver, ScriptedSourceFactory};
    use crate::{CollectorConfig, PairFailure};
    use nalgebra::{Matrix3, Rotation3, Vector3};
    use std::time::Duration;

    const EPS: f64 = 1e-9;

    fn fast_config(target_samples: usize) -> RigConfig {
        let mut config = RigConfig::default();
        config.collector = CollectorConfig {
            tolerant_interval_ms: 30,
            timeout_s: 1.0,
            frame_rate_hz: 1_000.0,
        };
        config.calibration.target_samples = target_samples;
        config.calibration.tick_interval_ms = 2;
        config.calibration.board.rows = 3;
        config.calibration.board.cols = 4;
        config
    }

    fn manager(factory: ScriptedSourceFactory) -> CameraManager {
        CameraManager::new(fast_config(10), Arc::new(factory)).unwrap()
    }

    fn solution(rotation: Matrix3<f64>, translation: Vector3<f64>) -> StereoSolution {
        StereoSolution {
            intrinsics_a: CameraIntrinsics::pinhole(600.0, 320.0, 240.0),
            intrinsics_b: CameraIntrinsics::pinhole(500.0, 300.0, 200.0),
            rotation,
            translation,
            rms_error: None,
        }
    }

    async fn wait_for_progress(manager: &CameraManager, at_least: f64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.calibration_progress() < at_least {
            assert!(tokio::time::Instant::now() < deadline, "progress stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_status(manager: &CameraManager, status: CalibrationStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.calibration_status() != status {
            assert!(tokio::time::Instant::now() < deadline, "never reached {status:?}");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = RigConfig::default();
        config.collector.frame_rate_hz = 0.0;
        let factory = Arc::new(ScriptedSourceFactory::aligned(&[0], 10));
        assert!(matches!(
            CameraManager::new(config, factory),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_batch_requires_started_manager() {
        let manager = manager(ScriptedSourceFactory::aligned(&[0, 1], 10));
        assert!(matches!(manager.get_batch(), Err(Error::InvalidState(_))));
        assert!(matches!(manager.start(&[]), Err(Error::InvalidState(_))));
        manager.start(&[0, 1]).unwrap();
        assert!(matches!(manager.start(&[0]), Err(Error::InvalidState(_))));
        assert_eq!(manager.active_sources(), vec![0, 1]);
        assert_eq!(manager.get_batch().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let factory = Arc::new(ScriptedSourceFactory::aligned(&[0, 1], 10));
        let manager = CameraManager::new(fast_config(10), factory.clone()).unwrap();
        let err = manager.start(&[0, 1, 9]).unwrap_err();
        assert!(matches!(err, Error::Device { source_id: 9, .. }));
        assert!(!manager.is_started());
        assert!(!factory.probe(0).unwrap().is_started());
        assert!(!factory.probe(1).unwrap().is_started());
    }

    #[test]
    fn test_single_source_batch() {
        let factory = Arc::new(ScriptedSourceFactory::new().with_source(3, 50, 1_000));
        let manager = CameraManager::new(fast_config(10), factory.clone()).unwrap();
        manager.start(&[3]).unwrap();
        let batch = manager.get_batch().unwrap();
        assert_eq!(batch.source_ids(), vec![3]);
        assert_eq!(factory.probe(3).unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_sources_and_records() {
        let factory = Arc::new(ScriptedSourceFactory::aligned(&[0, 1], 10));
        let manager = CameraManager::new(fast_config(10), factory.clone()).unwrap();
        assert!(matches!(manager.stop().await, Err(Error::InvalidState(_))));

        manager.start(&[0, 1]).unwrap();
        manager
            .set_calibration(
                SourcePair::new(0, 1),
                solution(Matrix3::identity(), Vector3::zeros()),
            )
            .unwrap();
        manager.stop().await.unwrap();
        assert!(matches!(manager.stop().await, Err(Error::InvalidState(_))));

        assert!(!manager.is_started());
        assert!(!factory.probe(0).unwrap().is_started());
        assert!(matches!(manager.get_batch(), Err(Error::InvalidState(_))));
        assert!(manager.get_calibration(SourcePair::new(0, 1)).is_err());
        assert!(manager.intrinsics(0).is_none());
    }

    #[test]
    fn test_threaded_mock_cameras_synchronize() {
        let factory = Arc::new(crate::DeviceSourceFactory::<vision_capture::MockDevice>::new(
            crate::CaptureSettings::default().to_capture_config(),
        ));
        let manager = CameraManager::new(RigConfig::default(), factory).unwrap();
        manager.start(&[0, 1]).unwrap();
        for _ in 0..3 {
            let batch = manager.get_batch().unwrap();
            assert_eq!(batch.source_ids(), vec![0, 1]);
            assert!(batch.spread_ms() <= 30);
            assert_eq!(batch.get(1).unwrap().image.width, 640);
        }
    }

    #[test]
    fn test_set_calibration_stores_inverse_and_intrinsics() {
        let manager = manager(ScriptedSourceFactory::new());
        let rotation = Rotation3::from_euler_angles(0.05, 0.2, -0.1).into_inner();
        let translation = Vector3::new(-0.12, 0.01, 0.03);
        manager
            .set_calibration(SourcePair::new(0, 1), solution(rotation, translation))
            .unwrap();

        let back = manager.get_calibration(SourcePair::new(1, 0)).unwrap();
        assert!((back.rotation - rotation.transpose()).norm() < EPS);
        assert!((back.translation + rotation.transpose() * translation).norm() < EPS);
        assert_eq!(
            manager.intrinsics(0).unwrap().principal_point(),
            (320.0, 240.0)
        );
        assert_eq!(
            manager.intrinsics(1).unwrap().principal_point(),
            (300.0, 200.0)
        );
    }

    #[test]
    fn test_self_pair_rejected() {
        let manager = manager(ScriptedSourceFactory::new());
        let err = manager
            .set_calibration(
                SourcePair::new(2, 2),
                solution(Matrix3::identity(), Vector3::zeros()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_identity_extrinsics_project_onto_axis() {
        let manager = manager(ScriptedSourceFactory::new());
        manager
            .set_calibration(
                SourcePair::new(0, 1),
                solution(Matrix3::identity(), Vector3::zeros()),
            )
            .unwrap();
        let projection = manager.project(0, 1, 0.5, 0.5).unwrap();
        assert!((projection.origin - Point3::origin()).norm() < EPS);
        assert!((projection.point - Point3::new(0.0, 0.0, 1.0)).norm() < EPS);
    }

    #[test]
    fn test_projection_applies_extrinsics() {
        let manager = manager(ScriptedSourceFactory::new());
        let translation = Vector3::new(-0.1, 0.0, 0.0);
        manager
            .set_calibration(
                SourcePair::new(0, 1),
                solution(Matrix3::identity(), translation),
            )
            .unwrap();
        let forward = manager.project(0, 1, 0.5, 0.5).unwrap();
        assert!((forward.origin - Point3::new(-0.1, 0.0, 0.0)).norm() < EPS);
        assert!((forward.direction() - Vector3::new(0.0, 0.0, 1.0)).norm() < EPS);

        let backward = manager.project(1, 0, 0.5, 0.5).unwrap();
        assert!((backward.origin - Point3::new(0.1, 0.0, 0.0)).norm() < EPS);

        let own = manager.project(0, 0, 0.5, 0.5).unwrap();
        assert_eq!(own.origin, Point3::origin());
    }

    #[test]
    fn test_projection_without_records() {
        let manager = manager(ScriptedSourceFactory::new());
        assert!(matches!(
            manager.project(0, 1, 0.5, 0.5),
            Err(Error::NotCalibrated { from: 0, to: 1 })
        ));
        manager
            .set_calibration(
                SourcePair::new(0, 1),
                solution(Matrix3::identity(), Vector3::zeros()),
            )
            .unwrap();
        // Camera 2 has neither intrinsics nor a transform.
        assert!(matches!(
            manager.project(0, 2, 0.5, 0.5),
            Err(Error::NotCalibrated { from: 0, to: 2 })
        ));
        assert!(matches!(
            manager.get_calibration(SourcePair::new(1, 2)),
            Err(Error::NotCalibrated { .. })
        ));
    }

    #[test]
    fn test_begin_calibration_outside_runtime() {
        let manager = Arc::new(
            manager(ScriptedSourceFactory::aligned(&[0, 1], 10)).with_calibration_backend(
                Arc::new(MockPatternDetector::always(3, 4)),
                Arc::new(MockStereoSolver::new()),
            ),
        );
        manager.start(&[0, 1]).unwrap();
        assert!(matches!(
            manager.begin_calibration(),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(manager.calibration_status(), CalibrationStatus::Idle);
    }

    #[tokio::test]
    async fn test_begin_calibration_preconditions() {
        let factory = Arc::new(ScriptedSourceFactory::aligned(&[0, 1], 10));
        let bare = Arc::new(CameraManager::new(fast_config(10), factory.clone()).unwrap());
        bare.start(&[0, 1]).unwrap();
        assert!(matches!(
            bare.begin_calibration(),
            Err(Error::InvalidState(_))
        ));

        let manager = Arc::new(
            CameraManager::new(fast_config(10), factory)
                .unwrap()
                .with_calibration_backend(
                    Arc::new(MockPatternDetector::always(3, 4)),
                    Arc::new(MockStereoSolver::new()),
                ),
        );
        assert!(matches!(
            manager.begin_calibration(),
            Err(Error::InvalidState(_))
        ));
        manager.start(&[0]).unwrap();
        assert!(matches!(
            manager.begin_calibration(),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(manager.calibration_status(), CalibrationStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_calibration_completes_with_enough_samples() {
        // Two cameras, 20 detections: exactly 10 joint samples.
        let detector = Arc::new(MockPatternDetector::with_budget(3, 4, 20));
        let solver = Arc::new(MockStereoSolver::new().with_delay(Duration::from_millis(50)));
        let manager = Arc::new(
            manager(ScriptedSourceFactory::aligned(&[0, 1], 10))
                .with_calibration_backend(detector, solver),
        );
        manager.start(&[0, 1]).unwrap();
        let run_id = manager.begin_calibration().unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Sampling);
        assert!(matches!(
            manager.begin_calibration(),
            Err(Error::InvalidState(_))
        ));
        wait_for_status(&manager, CalibrationStatus::Solving).await;

        let report = manager.wait_for_calibration().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Done);
        assert_eq!(report.run_id, run_id);
        assert!(report.is_complete());
        assert_eq!(report.calibrated, vec![SourcePair::new(0, 1)]);
        assert!(manager.is_calibrated());
        assert!((manager.calibration_progress() - 1.0).abs() < EPS);
        assert!(manager.get_calibration(SourcePair::new(0, 1)).is_ok());
        assert!(manager.get_calibration(SourcePair::new(1, 0)).is_ok());
        assert!(manager.project(0, 1, 0.25, 0.75).is_ok());
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_sampling_fails_run() {
        // 18 detections: 9 samples, one short of the target.
        let detector = Arc::new(MockPatternDetector::with_budget(3, 4, 18));
        let manager = Arc::new(
            manager(ScriptedSourceFactory::aligned(&[0, 1], 10))
                .with_calibration_backend(detector, Arc::new(MockStereoSolver::new())),
        );
        manager.start(&[0, 1]).unwrap();
        manager.begin_calibration().unwrap();
        wait_for_progress(&manager, 0.9).await;
        assert_eq!(manager.calibration_status(), CalibrationStatus::Sampling);

        manager.stop().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
        assert!(!manager.is_calibrated());
        assert!(manager.get_calibration(SourcePair::new(0, 1)).is_err());
        let report = manager.calibration_report().unwrap();
        assert_eq!(report.aborted.as_deref(), Some("cancelled"));
        assert!(report.calibrated.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_solving_discards_results() {
        let solver = Arc::new(MockStereoSolver::new().with_delay(Duration::from_millis(200)));
        let mut config = fast_config(1);
        config.calibration.board.rows = 2;
        config.calibration.board.cols = 2;
        let manager = Arc::new(
            CameraManager::new(config, Arc::new(ScriptedSourceFactory::aligned(&[0, 1, 2], 10)))
                .unwrap()
                .with_calibration_backend(
                    Arc::new(MockPatternDetector::always(2, 2)),
                    solver.clone(),
                ),
        );
        manager.start(&[0, 1, 2]).unwrap();
        manager.begin_calibration().unwrap();
        wait_for_status(&manager, CalibrationStatus::Solving).await;

        manager.stop().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
        let report = manager.calibration_report().unwrap();
        assert_eq!(report.aborted.as_deref(), Some("cancelled"));
        assert!(report.calibrated.is_empty());
        // The pair in flight finishes, nothing after it starts.
        assert_eq!(solver.calls(), 1);
        assert!(!manager.is_calibrated());
        assert!(manager.get_calibration(SourcePair::new(0, 1)).is_err());
        assert!(manager.intrinsics(0).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_keeps_run_cancellable() {
        // The board is never seen, so the run samples until cancelled.
        let detector = Arc::new(MockPatternDetector::with_budget(3, 4, 0));
        let manager = Arc::new(
            manager(ScriptedSourceFactory::aligned(&[0, 1], 10))
                .with_calibration_backend(detector, Arc::new(MockStereoSolver::new())),
        );
        manager.start(&[0, 1]).unwrap();
        let run_id = manager.begin_calibration().unwrap();

        let m = manager.clone();
        let waiter = tokio::spawn(async move { m.wait_for_calibration().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(matches!(
            manager.begin_calibration(),
            Err(Error::InvalidState(_))
        ));

        manager.stop().await.unwrap();
        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.aborted.as_deref(), Some("cancelled"));
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_detection_never_samples() {
        // Camera 1 renders gray level 1 and never shows the board.
        let detector =
            Arc::new(MockPatternDetector::always(3, 4).with_filter(|img| img.data[0] != 1));
        let manager = Arc::new(
            manager(ScriptedSourceFactory::aligned(&[0, 1], 10))
                .with_calibration_backend(detector.clone(), Arc::new(MockStereoSolver::new())),
        );
        manager.start(&[0, 1]).unwrap();
        manager.begin_calibration().unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while detector.calls() < 20 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.calibration_progress(), 0.0);
        manager.stop().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_solver_failure() {
        let solver = Arc::new(MockStereoSolver::new().fail_on_call(2));
        let mut config = fast_config(3);
        config.calibration.board.rows = 2;
        config.calibration.board.cols = 2;
        let manager = Arc::new(
            CameraManager::new(config, Arc::new(ScriptedSourceFactory::aligned(&[0, 1, 2], 10)))
                .unwrap()
                .with_calibration_backend(Arc::new(MockPatternDetector::always(2, 2)), solver),
        );
        manager.start(&[0, 1, 2]).unwrap();
        manager.begin_calibration().unwrap();
        let report = manager.wait_for_calibration().await.unwrap();

        // Pairs are solved in order, so the second one is (0, 2).
        assert_eq!(manager.calibration_status(), CalibrationStatus::Done);
        assert_eq!(
            report.calibrated,
            vec![SourcePair::new(0, 1), SourcePair::new(1, 2)]
        );
        assert!(matches!(
            report.failed.as_slice(),
            [PairFailure { pair, .. }] if *pair == SourcePair::new(0, 2)
        ));
        assert!(report.is_partial());
        assert!(!manager.is_calibrated());
        assert!(manager.get_calibration(SourcePair::new(2, 1)).is_ok());
        assert!(matches!(
            manager.get_calibration(SourcePair::new(2, 0)),
            Err(Error::NotCalibrated { from: 2, to: 0 })
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_pairs_failing_ends_failed() {
        let solver = Arc::new(MockStereoSolver::new().fail_on_call(1));
        let manager = Arc::new(
            CameraManager::new(fast_config(2), Arc::new(ScriptedSourceFactory::aligned(&[0, 1], 10)))
                .unwrap()
                .with_calibration_backend(Arc::new(MockPatternDetector::always(3, 4)), solver),
        );
        manager.start(&[0, 1]).unwrap();
        manager.begin_calibration().unwrap();
        let report = manager.wait_for_calibration().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
        assert!(report.calibrated.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.aborted.is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_error_aborts_run() {
        let factory = ScriptedSourceFactory::new()
            .with_source(0, 1_000, 10)
            .with_failing_source(1, 1_000, 10, 3);
        let manager = Arc::new(
            CameraManager::new(fast_config(10), Arc::new(factory))
                .unwrap()
                .with_calibration_backend(
                    Arc::new(MockPatternDetector::always(3, 4)),
                    Arc::new(MockStereoSolver::new()),
                ),
        );
        manager.start(&[0, 1]).unwrap();
        manager.begin_calibration().unwrap();
        let report = manager.wait_for_calibration().await.unwrap();
        assert_eq!(manager.calibration_status(), CalibrationStatus::Failed);
        assert!(report.aborted.unwrap().contains("source 1"));
        assert!(manager.get_calibration(SourcePair::new(0, 1)).is_err());
        manager.stop().await.unwrap();
    }
}
