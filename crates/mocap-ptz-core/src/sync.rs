//! Offline correlation of telemetry timestamps with video frame timestamps.
//!
//! Both clocks are milliseconds since the Unix epoch. Samples are matched to
//! frames through times relative to the first frame.

use serde::{Deserialize, Serialize};

use crate::{Error, FloatType, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncedSample {
    pub relative_time_ms: FloatType,
    /// `None` if the sample lies outside the recorded frames.
    pub frame_number: Option<usize>,
    /// NaN if no frame matched.
    pub sync_error_ms: FloatType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub num_samples: usize,
    /// Samples with NaN sync error
    pub num_unmatched: usize,
    pub mean_sync_error_ms: FloatType,
    pub max_sync_error_ms: FloatType,
    pub mean_frame_jitter_ms: FloatType,
    pub max_frame_jitter_ms: FloatType,
}

pub struct TimestampSynchronizer {
    frames: Vec<FloatType>,
    relative_frames: Vec<FloatType>,
    frame_rate: FloatType,
}

impl TimestampSynchronizer {
    /// `frames` must be non-decreasing.
    pub fn new(frames: Vec<FloatType>, frame_rate: FloatType) -> Result<Self> {
        for (i, w) in frames.windows(2).enumerate() {
            // also rejects NaN
            if !(w[1] >= w[0]) {
                return Err(Error::UnorderedFrameTimestamps(i + 1));
            }
        }
        let relative_frames = match frames.first() {
            Some(first) => frames.iter().map(|f| f - first).collect(),
            None => Vec::new(),
        };
        Ok(Self {
            frames,
            relative_frames,
            frame_rate,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Time since the first frame.
    pub fn relative_time(&self, timestamp_ms: FloatType) -> FloatType {
        match self.frames.first() {
            Some(first) => timestamp_ms - first,
            None => FloatType::NAN,
        }
    }

    /// Index of the frame closest to `relative_ms`.
    ///
    /// Returns `None` outside the span of recorded frames. Ties go to the
    /// earlier frame.
    pub fn nearest_frame(&self, relative_ms: FloatType) -> Option<usize> {
        let rel = &self.relative_frames;
        let last = *rel.last()?;
        if !relative_ms.is_finite() || relative_ms < rel[0] || relative_ms > last {
            return None;
        }
        let upper = rel.partition_point(|f| *f < relative_ms);
        if upper == 0 {
            return Some(0);
        }
        let lower = upper - 1;
        if relative_ms - rel[lower] <= rel[upper] - relative_ms {
            Some(lower)
        } else {
            Some(upper)
        }
    }

    pub fn sync_error(&self, timestamp_ms: FloatType) -> FloatType {
        match self.nearest_frame(self.relative_time(timestamp_ms)) {
            Some(idx) => (timestamp_ms - self.frames[idx]).abs(),
            None => FloatType::NAN,
        }
    }

    /// Deviation of each frame interval from the nominal interval.
    pub fn frame_jitter(&self) -> Vec<FloatType> {
        let expected = 1000.0 / self.frame_rate;
        self.frames
            .windows(2)
            .map(|w| ((w[1] - w[0]) - expected).abs())
            .collect()
    }

    pub fn synchronize(&self, timestamps_ms: &[FloatType]) -> (Vec<SyncedSample>, SyncStatistics) {
        let synced: Vec<SyncedSample> = timestamps_ms
            .iter()
            .map(|t| {
                let relative_time_ms = self.relative_time(*t);
                let frame_number = self.nearest_frame(relative_time_ms);
                let sync_error_ms = match frame_number {
                    Some(idx) => (t - self.frames[idx]).abs(),
                    None => FloatType::NAN,
                };
                SyncedSample {
                    relative_time_ms,
                    frame_number,
                    sync_error_ms,
                }
            })
            .collect();

        let (mean_sync_error_ms, max_sync_error_ms) =
            mean_max(synced.iter().map(|s| s.sync_error_ms));
        let (mean_frame_jitter_ms, max_frame_jitter_ms) = mean_max(self.frame_jitter().into_iter());
        let stats = SyncStatistics {
            num_samples: synced.len(),
            num_unmatched: synced.iter().filter(|s| s.sync_error_ms.is_nan()).count(),
            mean_sync_error_ms,
            max_sync_error_ms,
            mean_frame_jitter_ms,
            max_frame_jitter_ms,
        };
        (synced, stats)
    }
}

/// Mean and max over the finite values, NaN if there are none.
fn mean_max(values: impl Iterator<Item = FloatType>) -> (FloatType, FloatType) {
    let mut n = 0usize;
    let mut sum = 0.0;
    let mut max = FloatType::NEG_INFINITY;
    for v in values.filter(|v| v.is_finite()) {
        n += 1;
        sum += v;
        max = max.max(v);
    }
    if n == 0 {
        (FloatType::NAN, FloatType::NAN)
    } else {
        (sum / n as FloatType, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_nearest_frame() -> eyre::Result<()> {
        let sync = TimestampSynchronizer::new(vec![0.0, 5.0, 10.0, 15.0], 200.0)?;
        assert_eq!(sync.nearest_frame(7.0), Some(1));
        assert_relative_eq!(sync.sync_error(7.0), 2.0);
        assert_eq!(sync.nearest_frame(8.0), Some(2));
        // tie goes to the earlier frame
        assert_eq!(sync.nearest_frame(2.5), Some(0));
        assert_eq!(sync.nearest_frame(0.0), Some(0));
        assert_eq!(sync.nearest_frame(15.0), Some(3));
        Ok(())
    }

    #[test]
    fn test_epoch_offset() -> eyre::Result<()> {
        let t0 = 1.7e12;
        let sync = TimestampSynchronizer::new(vec![t0, t0 + 33.0, t0 + 67.0, t0 + 100.0], 30.0)?;
        assert_relative_eq!(sync.relative_time(t0 + 40.0), 40.0);
        assert_eq!(sync.nearest_frame(40.0), Some(1));
        assert_relative_eq!(sync.sync_error(t0 + 40.0), 7.0);
        Ok(())
    }

    #[test]
    fn test_out_of_range_is_nan() -> eyre::Result<()> {
        let sync = TimestampSynchronizer::new(vec![100.0, 105.0, 110.0], 200.0)?;
        assert!(sync.sync_error(99.0).is_nan());
        assert!(sync.sync_error(111.0).is_nan());
        assert!(sync.sync_error(FloatType::NAN).is_nan());

        let empty = TimestampSynchronizer::new(vec![], 30.0)?;
        assert!(empty.sync_error(1.0).is_nan());
        Ok(())
    }

    #[test]
    fn test_unordered_frames() {
        assert!(matches!(
            TimestampSynchronizer::new(vec![0.0, 5.0, 4.0], 30.0),
            Err(Error::UnorderedFrameTimestamps(2))
        ));
        assert!(TimestampSynchronizer::new(vec![0.0, FloatType::NAN], 30.0).is_err());
        // repeated timestamps are allowed
        assert!(TimestampSynchronizer::new(vec![0.0, 0.0, 1.0], 30.0).is_ok());
    }

    #[test]
    fn test_statistics() -> eyre::Result<()> {
        // nominal 10 ms interval, one late frame
        let sync = TimestampSynchronizer::new(vec![0.0, 10.0, 22.0, 30.0], 100.0)?;
        assert_eq!(sync.frame_jitter(), vec![0.0, 2.0, 2.0]);

        let (synced, stats) = sync.synchronize(&[1.0, 14.0, 29.0, 45.0]);
        assert_eq!(synced[0].frame_number, Some(0));
        assert_eq!(synced[1].frame_number, Some(1));
        assert_eq!(synced[2].frame_number, Some(3));
        assert_eq!(synced[3].frame_number, None);
        assert!(synced[3].sync_error_ms.is_nan());

        assert_eq!(stats.num_samples, 4);
        assert_eq!(stats.num_unmatched, 1);
        assert_relative_eq!(stats.mean_sync_error_ms, 2.0);
        assert_relative_eq!(stats.max_sync_error_ms, 4.0);
        assert_relative_eq!(stats.mean_frame_jitter_ms, 4.0 / 3.0);
        assert_relative_eq!(stats.max_frame_jitter_ms, 2.0);
        Ok(())
    }
}
