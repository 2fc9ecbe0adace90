//! Background stereo calibration.
//!
//! The procedure samples synchronized batches until every camera pair holds
//! `target_samples` joint pattern detections, then solves each pair
//! independently and writes the results into the [`CameraManager`].

use crate::{
    chessboard_object_points, CalibrationConfig, CameraManager, Error, FrameBatch,
    PatternDetector, Result, SourcePair, StereoSolver,
};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vision_capture::{Resolution, SourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Idle,
    Sampling,
    Solving,
    Done,
    Failed,
}

impl CalibrationStatus {
    pub fn is_running(self) -> bool {
        matches!(self, CalibrationStatus::Sampling | CalibrationStatus::Solving)
    }
}

/// Joint observations of the board by one camera pair. The three sequences
/// are parallel: entry `i` of each belongs to the same batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrespondenceSet {
    pub object_points: Vec<Vec<Point3<f64>>>,
    pub image_points_a: Vec<Vec<Point2<f64>>>,
    pub image_points_b: Vec<Vec<Point2<f64>>>,
}

impl CorrespondenceSet {
    pub fn len(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairFailure {
    pub pair: SourcePair,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub run_id: Uuid,
    pub requested: Vec<SourcePair>,
    pub calibrated: Vec<SourcePair>,
    pub failed: Vec<PairFailure>,
    /// Why the run ended before solving, if it did.
    pub aborted: Option<String>,
}

impl CalibrationReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none() && self.calibrated.len() == self.requested.len()
    }

    pub fn is_partial(&self) -> bool {
        self.aborted.is_none() && !self.calibrated.is_empty() && !self.failed.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct CalibrationState {
    pub status: CalibrationStatus,
    pub progress: f64,
    pub report: Option<CalibrationReport>,
    /// Every pair requested by the last finished run was solved.
    pub calibrated: bool,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            status: CalibrationStatus::Idle,
            progress: 0.0,
            report: None,
            calibrated: false,
        }
    }
}

/// Per-pair sample accumulation.
#[derive(Debug)]
pub(crate) struct SampleBook {
    target: usize,
    object_grid: Vec<Point3<f64>>,
    sets: BTreeMap<SourcePair, CorrespondenceSet>,
}

impl SampleBook {
    pub(crate) fn new(pairs: &[SourcePair], object_grid: Vec<Point3<f64>>, target: usize) -> Self {
        Self {
            target,
            object_grid,
            sets: pairs
                .iter()
                .map(|p| (*p, CorrespondenceSet::default()))
                .collect(),
        }
    }

    /// Append one sample for every pair whose cameras both saw the full
    /// pattern. Returns the number of samples appended.
    pub(crate) fn record(&mut self, detections: &BTreeMap<SourceId, Vec<Point2<f64>>>) -> usize {
        let Self {
            target,
            object_grid,
            sets,
        } = self;
        let mut appended = 0;
        for (pair, set) in sets.iter_mut() {
            if set.len() >= *target {
                continue;
            }
            let (Some(a), Some(b)) = (detections.get(&pair.from), detections.get(&pair.to)) else {
                continue;
            };
            if a.len() != object_grid.len() || b.len() != object_grid.len() {
                continue;
            }
            set.object_points.push(object_grid.clone());
            set.image_points_a.push(a.clone());
            set.image_points_b.push(b.clone());
            appended += 1;
        }
        appended
    }

    #[cfg(test)]
    pub(crate) fn samples(&self, pair: SourcePair) -> usize {
        self.sets.get(&pair).map_or(0, CorrespondenceSet::len)
    }

    /// `Σ min(samples, target) / (pairs × target)`.
    pub(crate) fn progress(&self) -> f64 {
        if self.sets.is_empty() {
            return 0.0;
        }
        let collected: usize = self.sets.values().map(|s| s.len().min(self.target)).sum();
        collected as f64 / (self.sets.len() * self.target) as f64
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.sets.values().all(|s| s.len() >= self.target)
    }

    pub(crate) fn take_sets(&mut self) -> BTreeMap<SourcePair, CorrespondenceSet> {
        mem::take(&mut self.sets)
    }
}

#[derive(Clone)]
pub(crate) struct CalibrationBackend {
    pub detector: Arc<dyn PatternDetector>,
    pub solver: Arc<dyn StereoSolver>,
}

enum Abort {
    Cancelled,
    Failed(Error),
}

struct Tick {
    signature: Vec<(SourceId, i64)>,
    detections: BTreeMap<SourceId, Vec<Point2<f64>>>,
    sizes: BTreeMap<SourceId, Resolution>,
}

fn batch_signature(batch: &FrameBatch) -> Vec<(SourceId, i64)> {
    batch.iter().map(|(id, f)| (id, f.timestamp_ms)).collect()
}

pub(crate) struct CalibrationProcedure {
    manager: Arc<CameraManager>,
    backend: CalibrationBackend,
    tick_interval: Duration,
    run_id: Uuid,
    pairs: Vec<SourcePair>,
    book: SampleBook,
    image_sizes: BTreeMap<SourceId, Resolution>,
    last_batch: Option<Vec<(SourceId, i64)>>,
    cancel: watch::Receiver<bool>,
}

impl CalibrationProcedure {
    pub(crate) fn new(
        manager: Arc<CameraManager>,
        backend: CalibrationBackend,
        config: &CalibrationConfig,
        source_ids: &[SourceId],
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let pairs = SourcePair::unordered_pairs(source_ids);
        let board = &config.board;
        let grid = chessboard_object_points(board.rows, board.cols, board.square_size);
        Self {
            manager,
            backend,
            tick_interval: config.tick_interval(),
            run_id: Uuid::new_v4(),
            book: SampleBook::new(&pairs, grid, config.target_samples),
            pairs,
            image_sizes: BTreeMap::new(),
            last_batch: None,
            cancel,
        }
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) async fn run(mut self) {
        info!(run_id = %self.run_id, pairs = self.pairs.len(), "calibration started");
        let (status, report) = match self.run_to_completion().await {
            Ok(report) => {
                let status = if report.calibrated.is_empty() {
                    CalibrationStatus::Failed
                } else {
                    CalibrationStatus::Done
                };
                info!(
                    run_id = %self.run_id,
                    calibrated = report.calibrated.len(),
                    requested = report.requested.len(),
                    "calibration finished"
                );
                (status, report)
            }
            Err(abort) => {
                let reason = match abort {
                    Abort::Cancelled => {
                        info!(run_id = %self.run_id, "calibration cancelled");
                        "cancelled".to_string()
                    }
                    Abort::Failed(e) => {
                        error!(run_id = %self.run_id, error = %e, "calibration aborted");
                        e.to_string()
                    }
                };
                // In-progress samples are dropped with `self`.
                let report = CalibrationReport {
                    run_id: self.run_id,
                    requested: self.pairs.clone(),
                    calibrated: Vec::new(),
                    failed: Vec::new(),
                    aborted: Some(reason),
                };
                (CalibrationStatus::Failed, report)
            }
        };
        let finished_solving = report.aborted.is_none();
        let complete = report.is_complete();
        self.manager.update_calibration(|state| {
            state.status = status;
            if finished_solving {
                state.calibrated = complete;
            }
            state.report = Some(report);
        });
    }

    async fn run_to_completion(&mut self) -> Result<CalibrationReport, Abort> {
        self.sample_until_complete().await?;
        self.manager.update_calibration(|state| {
            state.status = CalibrationStatus::Solving;
            state.progress = 1.0;
        });
        self.solve_all().await
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn sample_until_complete(&mut self) -> Result<(), Abort> {
        while !self.book.is_complete() {
            if self.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            self.sample_once().await?;
            let progress = self.book.progress();
            self.manager
                .update_calibration(|state| state.progress = progress);
            if self.book.is_complete() {
                break;
            }
            self.pause().await?;
        }
        Ok(())
    }

    async fn sample_once(&mut self) -> Result<(), Abort> {
        let manager = self.manager.clone();
        let detector = self.backend.detector.clone();
        let previous = self.last_batch.clone();
        let tick = tokio::task::spawn_blocking(move || -> Result<Option<Tick>> {
            let batch = manager.get_batch()?;
            let signature = batch_signature(&batch);
            if previous.as_ref() == Some(&signature) {
                return Ok(None);
            }
            let mut detections = BTreeMap::new();
            let mut sizes = BTreeMap::new();
            for (id, frame) in batch.iter() {
                sizes.insert(id, frame.image.resolution());
                if let Some(corners) = detector.detect_pattern(&frame.image) {
                    detections.insert(id, detector.refine(&frame.image, corners));
                }
            }
            Ok(Some(Tick {
                signature,
                detections,
                sizes,
            }))
        })
        .await
        .map_err(|e| Abort::Failed(Error::Task(e.to_string())))?;

        let tick = match tick {
            Ok(Some(tick)) => tick,
            Ok(None) => {
                debug!(run_id = %self.run_id, "batch unchanged since last tick");
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                warn!(run_id = %self.run_id, error = %e, "skipping calibration tick");
                return Ok(());
            }
            Err(e) => return Err(Abort::Failed(e)),
        };
        if self.is_cancelled() {
            return Err(Abort::Cancelled);
        }

        self.image_sizes.extend(tick.sizes);
        let appended = self.book.record(&tick.detections);
        self.last_batch = Some(tick.signature);
        debug!(
            run_id = %self.run_id,
            detected = tick.detections.len(),
            appended,
            progress = self.book.progress(),
            "calibration tick"
        );
        Ok(())
    }

    /// Yield between ticks; any change on the cancel channel ends the run.
    async fn pause(&mut self) -> Result<(), Abort> {
        let tick_interval = self.tick_interval;
        let cancel = &mut self.cancel;
        tokio::select! {
            _ = tokio::time::sleep(tick_interval) => Ok(()),
            _ = cancel.changed() => Err(Abort::Cancelled),
        }
    }

    async fn solve_all(&mut self) -> Result<CalibrationReport, Abort> {
        let sets = self.book.take_sets();
        let mut calibrated = Vec::new();
        let mut failed = Vec::new();

        for (pair, set) in sets {
            if self.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            let solver = self.backend.solver.clone();
            let image_size = self
                .image_sizes
                .get(&pair.from)
                .copied()
                .unwrap_or(Resolution::new(0, 0));
            let solved = tokio::task::spawn_blocking(move || {
                solver
                    .solve(
                        &set.object_points,
                        &set.image_points_a,
                        &set.image_points_b,
                        image_size,
                    )
                    .map_err(|e| e.to_string())
            })
            .await
            .map_err(|e| e.to_string())
            .and_then(|res| res);

            let solution = match solved {
                Ok(solution) => solution,
                Err(message) => {
                    let err = Error::Solver { pair, message };
                    warn!(run_id = %self.run_id, error = %err, "pair left uncalibrated");
                    failed.push(PairFailure {
                        pair,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            if self.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            match self.manager.set_calibration(pair, solution) {
                Ok(()) => {
                    info!(run_id = %self.run_id, %pair, "pair calibrated");
                    calibrated.push(pair);
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, %pair, error = %e, "storing calibration failed");
                    failed.push(PairFailure {
                        pair,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(CalibrationReport {
            run_id: self.run_id,
            requested: self.pairs.clone(),
            calibrated,
            failed,
            aborted: None,
        })
    }
}
