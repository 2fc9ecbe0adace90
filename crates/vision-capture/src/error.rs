use crate::SourceId;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("camera {0} disconnected")]
    Disconnected(SourceId),
    #[error("source {0} not started")]
    NotStarted(SourceId),
    #[error("source {0} already started")]
    AlreadyStarted(SourceId),
    #[error("no frame from source {source_id} within {waited:?}")]
    Stalled { source_id: SourceId, waited: Duration },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("backend error: {0}")]
    Backend(String),
}
