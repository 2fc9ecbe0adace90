use std::collections::BTreeMap;
use vision_capture::{Frame, SourceId};

/// One frame per active source, taken within the collector's tolerance.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameBatch {
    frames: BTreeMap<SourceId, Frame>,
}

impl FrameBatch {
    pub(crate) fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().map(|f| (f.source_id, f)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, source_id: SourceId) -> Option<&Frame> {
        self.frames.get(&source_id)
    }

    /// Frames in ascending source-id order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &Frame)> {
        self.frames.iter().map(|(id, f)| (*id, f))
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.frames.keys().copied().collect()
    }

    pub fn earliest_ms(&self) -> Option<i64> {
        self.frames.values().map(|f| f.timestamp_ms).min()
    }

    pub fn latest_ms(&self) -> Option<i64> {
        self.frames.values().map(|f| f.timestamp_ms).max()
    }

    /// `latest - earliest`; zero for a single frame.
    pub fn spread_ms(&self) -> i64 {
        match (self.earliest_ms(), self.latest_ms()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        }
    }

    pub fn into_frames(self) -> BTreeMap<SourceId, Frame> {
        self.frames
    }
}
