use crate::SourcePair;
use std::time::Duration;
use thiserror::Error;
use vision_capture::SourceId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device error on source {source_id}: {error}")]
    Device {
        source_id: SourceId,
        #[source]
        error: vision_capture::Error,
    },
    #[error(
        "synchronization timed out after {elapsed:?}: spread {spread_ms} ms exceeds {tolerant_interval_ms} ms"
    )]
    SynchronizationTimeout {
        elapsed: Duration,
        spread_ms: i64,
        tolerant_interval_ms: i64,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no calibration from source {from} to source {to}")]
    NotCalibrated { from: SourceId, to: SourceId },
    #[error("stereo solver failed for pair {pair}: {message}")]
    Solver { pair: SourcePair, message: String },
    #[error("geometry error: {0}")]
    Geometry(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pose inference failed: {0}")]
    Inference(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Whether the caller can simply try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SynchronizationTimeout { .. })
    }
}
