//! Fan-out of per-camera pose inference over a synchronized batch.

use crate::{Error, FrameBatch, PoseEstimator, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use vision_capture::SourceId;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Detection confidence in `[0, 1]`.
    pub presence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseResult {
    pub source_id: SourceId,
    pub timestamp_ms: i64,
    pub landmarks: Vec<Landmark>,
}

/// Skeleton points as `[x, y, z, presence]` rows, attributed to the
/// camera they came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmarks3d {
    pub source_id: SourceId,
    pub timestamp_ms: i64,
    pub points: Vec<[f64; 4]>,
}

/// Lift one batch of pose results into 3D landmarks.
///
/// Uses the lowest source id only. No multi-view triangulation yet; the
/// per-camera `z` is passed through.
pub fn fuse_landmarks_3d(results: &BTreeMap<SourceId, PoseResult>) -> Option<Landmarks3d> {
    let (&source_id, pose) = results.iter().next()?;
    if pose.landmarks.is_empty() {
        return None;
    }
    Some(Landmarks3d {
        source_id,
        timestamp_ms: pose.timestamp_ms,
        points: pose
            .landmarks
            .iter()
            .map(|l| [l.x, l.y, l.z, l.presence])
            .collect(),
    })
}

/// Run the estimator on every frame of `batch` concurrently and gather one
/// result per source.
///
/// The batch completes only when every source has answered. Any estimator
/// failure, or missing the deadline, fails the whole batch; outstanding
/// tasks are aborted.
pub async fn collect_pose_results(
    estimator: Arc<dyn PoseEstimator>,
    batch: &FrameBatch,
    timeout: Duration,
) -> Result<BTreeMap<SourceId, PoseResult>> {
    let expected = batch.len();
    let mut tasks = JoinSet::new();
    for (source_id, frame) in batch.iter() {
        let estimator = estimator.clone();
        let frame = frame.clone();
        tasks.spawn(async move {
            let result = estimator.estimate(frame).await;
            (source_id, result)
        });
    }

    let gather = async {
        let mut results = BTreeMap::new();
        while results.len() < expected {
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (source_id, result) = joined.map_err(|e| Error::Task(e.to_string()))?;
            let mut pose =
                result.map_err(|e| Error::Inference(format!("source {source_id}: {e}")))?;
            pose.source_id = source_id;
            debug!(source_id, landmarks = pose.landmarks.len(), "pose result");
            results.insert(source_id, pose);
        }
        Ok(results)
    };

    match tokio::time::timeout(timeout, gather).await {
        Ok(Ok(results)) if results.len() == expected => Ok(results),
        Ok(Ok(results)) => Err(Error::Inference(format!(
            "{} of {expected} sources answered",
            results.len()
        ))),
        Ok(Err(e)) => {
            warn!(error = %e, "pose batch failed");
            Err(e)
        }
        Err(_) => {
            warn!(?timeout, "pose batch timed out");
            Err(Error::Inference(format!(
                "no complete result set within {timeout:?}"
            )))
        }
    }
}
