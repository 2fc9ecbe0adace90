//! Frame synchronization across independently clocked sources.
//!
//! Sources free-run, so reading one frame from each gives batches with
//! unbounded skew. The collector repeatedly replaces only the oldest frame
//! until the batch fits the tolerance window. Each replacement is strictly
//! newer than the frame it replaces, so the spread shrinks until it fits or
//! the timeout fires.

use crate::{CollectorConfig, Error, FrameBatch, Result};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vision_capture::{Frame, FrameSource, SourceId};

pub type SourceMap = BTreeMap<SourceId, Box<dyn FrameSource>>;

struct CachedBatch {
    batch: FrameBatch,
    obsolete_at: Instant,
}

pub struct FrameCollector {
    tolerant_interval_ms: i64,
    timeout: Duration,
    cache_ttl: Duration,
    cache: Option<CachedBatch>,
    last_retries: usize,
}

impl FrameCollector {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tolerant_interval_ms: config.tolerant_interval_ms,
            timeout: config.timeout()?,
            cache_ttl: config.cache_ttl()?,
            cache: None,
            last_retries: 0,
        })
    }

    pub fn tolerant_interval_ms(&self) -> i64 {
        self.tolerant_interval_ms
    }

    /// Re-acquisitions needed by the last fresh synchronization.
    pub fn last_retries(&self) -> usize {
        self.last_retries
    }

    /// Drop the cached batch so the next call captures again.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Return one coherent batch with a frame from every source.
    ///
    /// Callers must serialize access; the cache and the replacement loop
    /// assume a single reader.
    pub fn synchronize(&mut self, sources: &mut SourceMap) -> Result<FrameBatch> {
        if sources.is_empty() {
            return Err(Error::invalid_state("no frame sources to synchronize"));
        }
        if let Some(cached) = &self.cache {
            if Instant::now() < cached.obsolete_at {
                return Ok(cached.batch.clone());
            }
        }

        let started = Instant::now();
        let mut candidates = Vec::with_capacity(sources.len());
        for (id, source) in sources.iter_mut() {
            candidates.push(acquire(*id, source.as_mut())?);
        }
        self.last_retries = 0;

        if candidates.len() == 1 {
            return Ok(self.remember(candidates));
        }

        loop {
            candidates.sort_by_key(|f| f.timestamp_ms);
            let spread_ms = match (candidates.first(), candidates.last()) {
                (Some(first), Some(last)) => last.timestamp_ms - first.timestamp_ms,
                _ => 0,
            };
            if spread_ms <= self.tolerant_interval_ms {
                debug!(
                    retries = self.last_retries,
                    spread_ms, "batch synchronized"
                );
                return Ok(self.remember(candidates));
            }

            let elapsed = started.elapsed();
            if elapsed > self.timeout {
                warn!(
                    ?elapsed,
                    spread_ms,
                    retries = self.last_retries,
                    "frame synchronization timed out"
                );
                return Err(Error::SynchronizationTimeout {
                    elapsed,
                    spread_ms,
                    tolerant_interval_ms: self.tolerant_interval_ms,
                });
            }

            // Renew only the straggler.
            let oldest = candidates.remove(0);
            let source = sources.get_mut(&oldest.source_id).ok_or_else(|| {
                Error::invalid_state(format!("frame from unknown source {}", oldest.source_id))
            })?;
            candidates.push(acquire(oldest.source_id, source.as_mut())?);
            self.last_retries += 1;
        }
    }

    fn remember(&mut self, frames: Vec<Frame>) -> FrameBatch {
        let batch = FrameBatch::from_frames(frames);
        self.cache = Some(CachedBatch {
            batch: batch.clone(),
            obsolete_at: Instant::now() + self.cache_ttl,
        });
        batch
    }
}

fn acquire(source_id: SourceId, source: &mut dyn FrameSource) -> Result<Frame> {
    let mut frame = source
        .get_frame()
        .map_err(|error| Error::Device { source_id, error })?;
    // The collector keys frames by the map entry, not by what the source claims.
    frame.source_id = source_id;
    Ok(frame)
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use vision_capture::{ScriptProbe, ScriptedSource};

    fn config(tolerance: i64, timeout_s: f64, frame_rate_hz: f64) -> CollectorConfig {
        CollectorConfig {
            tolerant_interval_ms: tolerance,
            timeout_s,
            frame_rate_hz,
        }
    }

    fn sources(specs: &[(SourceId, i64, i64)]) -> (SourceMap, Vec<ScriptProbe>) {
        let mut map = SourceMap::new();
        let mut probes = Vec::new();
        for &(id, start, step) in specs {
            let mut src = ScriptedSource::new(id, start, step);
            src.start().unwrap();
            probes.push(src.probe());
            map.insert(id, Box::new(src));
        }
        (map, probes)
    }

    #[test]
    fn test_accepts_batch_within_tolerance() {
        let (mut map, probes) = sources(&[(0, 100, 33), (1, 110, 33)]);
        let mut collector = FrameCollector::new(&config(30, 2.0, 60.0)).unwrap();
        let batch = collector.synchronize(&mut map).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.spread_ms(), 10);
        assert_eq!(collector.last_retries(), 0);
        assert_eq!(probes[0].calls() + probes[1].calls(), 2);
    }

    #[test]
    fn test_replaces_oldest_until_converged() {
        // Stale source advances 10 ms per re-acquisition.
        let (mut map, probes) = sources(&[(0, 100, 10), (1, 200, 10)]);
        let mut collector = FrameCollector::new(&config(30, 2.0, 60.0)).unwrap();
        let batch = collector.synchronize(&mut map).unwrap();
        assert!(batch.spread_ms() <= 30);
        assert_eq!(batch.get(0).map(|f| f.timestamp_ms), Some(170));
        assert_eq!(batch.get(1).map(|f| f.timestamp_ms), Some(200));
        assert_eq!(collector.last_retries(), 7);
        // Only the straggler was re-read.
        assert_eq!(probes[0].calls(), 8);
        assert_eq!(probes[1].calls(), 1);
    }

    #[test]
    fn test_times_out_when_sources_never_align() {
        let (mut map, _) = sources(&[(0, 0, 0), (1, 1_000, 0)]);
        let mut collector = FrameCollector::new(&config(30, 0.05, 60.0)).unwrap();
        let err = collector.synchronize(&mut map).unwrap_err();
        match &err {
            Error::SynchronizationTimeout {
                spread_ms,
                tolerant_interval_ms,
                ..
            } => {
                assert_eq!(*spread_ms, 1_000);
                assert_eq!(*tolerant_interval_ms, 30);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_single_source_skips_retry_loop() {
        let (mut map, probes) = sources(&[(7, 5, 1_000)]);
        let mut collector = FrameCollector::new(&config(0, 2.0, 60.0)).unwrap();
        let batch = collector.synchronize(&mut map).unwrap();
        assert_eq!(batch.source_ids(), vec![7]);
        assert_eq!(probes[0].calls(), 1);
        assert_eq!(collector.last_retries(), 0);
    }

    #[test]
    fn test_cache_hit_then_fresh_capture() {
        let (mut map, probes) = sources(&[(0, 100, 5), (1, 102, 5)]);
        let mut collector = FrameCollector::new(&config(30, 2.0, 10.0)).unwrap();
        let first = collector.synchronize(&mut map).unwrap();
        let second = collector.synchronize(&mut map).unwrap();
        assert_eq!(first, second);
        assert_eq!(probes[0].calls(), 1);

        std::thread::sleep(Duration::from_millis(120));
        let third = collector.synchronize(&mut map).unwrap();
        assert_ne!(first, third);
        assert_eq!(probes[0].calls(), 2);
    }

    #[test]
    fn test_invalidate_forces_capture() {
        let (mut map, probes) = sources(&[(0, 100, 5)]);
        let mut collector = FrameCollector::new(&config(30, 2.0, 1.0)).unwrap();
        collector.synchronize(&mut map).unwrap();
        collector.invalidate();
        collector.synchronize(&mut map).unwrap();
        assert_eq!(probes[0].calls(), 2);
    }

    #[test]
    fn test_device_error_is_tagged_with_source() {
        let mut map = SourceMap::new();
        let mut ok = ScriptedSource::new(0, 0, 1);
        ok.start().unwrap();
        let mut broken = ScriptedSource::new(3, 0, 1).fail_after(0);
        broken.start().unwrap();
        map.insert(0, Box::new(ok));
        map.insert(3, Box::new(broken));
        let mut collector = FrameCollector::new(&config(30, 2.0, 60.0)).unwrap();
        let err = collector.synchronize(&mut map).unwrap_err();
        assert!(matches!(err, Error::Device { source_id: 3, .. }));
    }

    #[test]
    fn test_empty_source_map_rejected() {
        let mut map = SourceMap::new();
        let mut collector = FrameCollector::new(&CollectorConfig::default()).unwrap();
        assert!(matches!(
            collector.synchronize(&mut map),
            Err(Error::InvalidState(_))
        ));
    }
}
