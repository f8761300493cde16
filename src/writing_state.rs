use std::{
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use color_eyre::eyre::{self, Result, WrapErr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing as log;

use mocap_ptz_core::{FloatType, SyncStatistics, TimestampSynchronizer, TrackingSample};

const README_MD_FNAME: &str = "README.md";
const METADATA_FNAME: &str = "metadata.yaml";
pub(crate) const TELEMETRY_FNAME: &str = "telemetry.csv";
pub(crate) const SYNCED_FNAME: &str = "telemetry_synced.csv";
pub(crate) const SYNC_STATS_FNAME: &str = "sync_statistics.yaml";

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct SessionMetadata {
    git_revision: String,
    creation_time: chrono::DateTime<chrono::FixedOffset>,
    timezone: String,
}

/// One row of `telemetry.csv`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
struct SaveTrackingSample {
    target_x: FloatType,
    target_y: FloatType,
    target_z: FloatType,
    desired_pan: FloatType,
    desired_tilt: FloatType,
    encoder_pan: FloatType,
    encoder_tilt: FloatType,
    time_stamp_ms: FloatType,
    lost: bool,
}

impl From<TrackingSample> for SaveTrackingSample {
    fn from(orig: TrackingSample) -> Self {
        Self {
            target_x: orig.estimated_position.x,
            target_y: orig.estimated_position.y,
            target_z: orig.estimated_position.z,
            desired_pan: orig.desired_pan,
            desired_tilt: orig.desired_tilt,
            encoder_pan: orig.encoder_pan,
            encoder_tilt: orig.encoder_tilt,
            time_stamp_ms: orig.timestamp_ms,
            lost: orig.lost,
        }
    }
}

/// One row of `telemetry_synced.csv`: the recorded row plus its video frame.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
struct SyncedTrackingSample {
    target_x: FloatType,
    target_y: FloatType,
    target_z: FloatType,
    desired_pan: FloatType,
    desired_tilt: FloatType,
    encoder_pan: FloatType,
    encoder_tilt: FloatType,
    time_stamp_ms: FloatType,
    lost: bool,
    relative_time_ms: FloatType,
    /// Empty if the sample lies outside the video.
    frame_number: Option<usize>,
    sync_error_ms: FloatType,
}

impl SyncedTrackingSample {
    fn new(row: SaveTrackingSample, synced: mocap_ptz_core::SyncedSample) -> Self {
        Self {
            target_x: row.target_x,
            target_y: row.target_y,
            target_z: row.target_z,
            desired_pan: row.desired_pan,
            desired_tilt: row.desired_tilt,
            encoder_pan: row.encoder_pan,
            encoder_tilt: row.encoder_tilt,
            time_stamp_ms: row.time_stamp_ms,
            lost: row.lost,
            relative_time_ms: synced.relative_time_ms,
            frame_number: synced.frame_number,
            sync_error_ms: synced.sync_error_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecorderConfig {
    pub(crate) output_dir: PathBuf,
    pub(crate) flush_interval: Duration,
    /// Video frame timestamps to correlate with once recording ends.
    pub(crate) frame_timestamps: Option<PathBuf>,
    pub(crate) frame_rate: FloatType,
}

/// Drain the telemetry channel into the session directory.
///
/// Returns the number of samples written once the sending side has closed.
/// This blocks and should be spawned with `tokio::task::spawn_blocking`.
#[tracing::instrument(skip_all)]
pub(crate) fn recorder_task_main(
    mut telemetry_rx: mpsc::Receiver<TrackingSample>,
    cfg: RecorderConfig,
    creation_time_local: chrono::DateTime<chrono::Local>,
) -> Result<u64> {
    let mut writing_state = WritingState::new(creation_time_local, cfg.output_dir.clone())?;
    log::info!("Saving telemetry to {}", cfg.output_dir.display());

    let mut last_flushed = Instant::now();
    let mut n_samples = 0u64;
    while let Some(sample) = telemetry_rx.blocking_recv() {
        writing_state.save_sample(sample)?;
        n_samples += 1;
        if last_flushed.elapsed() > cfg.flush_interval {
            writing_state.flush()?;
            last_flushed = Instant::now();
        }
    }
    writing_state.flush()?;
    drop(writing_state);
    log::info!("Done saving telemetry, {n_samples} samples.");

    if let Some(frames_path) = cfg.frame_timestamps.as_ref() {
        synchronize_session(&cfg.output_dir, frames_path, cfg.frame_rate)?;
    }
    Ok(n_samples)
}

struct WritingState {
    /// Kept open while recording. `File::create_new` on it guards against
    /// two sessions writing into one directory.
    #[allow(dead_code)]
    readme_fd: std::fs::File,
    telemetry_wtr: csv::Writer<Box<dyn Write + Send>>,
}

fn _test_writing_state_is_send() {
    // Compile-time test to ensure WritingState implements Send trait.
    fn implements<T: Send>() {}
    implements::<WritingState>();
}

fn readme_contents() -> String {
    format!(
        "\n\nThis is telemetry saved by {}. `{TELEMETRY_FNAME}` has one row per \
        tracking loop iteration; times are milliseconds since the Unix epoch.\n\n",
        env!("CARGO_PKG_NAME")
    )
}

impl WritingState {
    fn new(
        creation_time_local: chrono::DateTime<chrono::Local>,
        output_dirname: PathBuf,
    ) -> Result<Self> {
        let creation_time = creation_time_local.with_timezone(creation_time_local.offset());

        std::fs::create_dir_all(&output_dirname)
            .with_context(|| format!("creating {}", output_dirname.display()))?;

        let readme_fd = {
            let readme_path = output_dirname.join(README_MD_FNAME);
            let mut fd = std::fs::File::create_new(&readme_path)
                .with_context(|| format!("creating {}", readme_path.display()))?;
            fd.write_all(readme_contents().as_bytes())?;
            fd
        };

        {
            let metadata = SessionMetadata {
                git_revision: env!("GIT_HASH").to_string(),
                creation_time,
                timezone: iana_time_zone::get_timezone()?,
            };
            let metadata_buf = serde_yaml::to_string(&metadata)?;
            std::fs::write(output_dirname.join(METADATA_FNAME), metadata_buf)?;
        }

        let telemetry_wtr = {
            let wtr = Box::new(bufwriter(output_dirname.join(TELEMETRY_FNAME))?);
            csv::Writer::from_writer(wtr as Box<dyn Write + Send>)
        };

        Ok(Self {
            readme_fd,
            telemetry_wtr,
        })
    }

    fn save_sample(&mut self, sample: TrackingSample) -> Result<()> {
        self.telemetry_wtr
            .serialize(SaveTrackingSample::from(sample))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.telemetry_wtr.flush()?;
        Ok(())
    }
}

fn bufwriter<P: AsRef<Path>>(path: P) -> std::io::Result<impl Write + Send> {
    Ok(std::io::BufWriter::new(std::fs::File::create(path)?))
}

/// Read video frame timestamps (ms since the Unix epoch).
///
/// Accepts a JSON array or one number per line. Blank lines and lines
/// starting with `#` are skipped.
pub(crate) fn read_frame_timestamps<P: AsRef<Path>>(path: P) -> Result<Vec<FloatType>> {
    let path = path.as_ref();
    let buf = std::fs::read_to_string(path)
        .with_context(|| format!("reading frame timestamps {}", path.display()))?;
    if buf.trim_start().starts_with('[') {
        return serde_json::from_str(&buf)
            .with_context(|| format!("parsing {} as JSON array", path.display()));
    }
    buf.lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(i, line)| {
            line.parse::<FloatType>()
                .with_context(|| format!("{}:{}: not a number", path.display(), i + 1))
        })
        .collect()
}

/// Correlate a recorded session with video frame timestamps.
///
/// Writes `telemetry_synced.csv` and `sync_statistics.yaml` next to the
/// recorded telemetry. An incomplete final row, as left by a crash, is
/// skipped.
pub(crate) fn synchronize_session(
    session_dir: &Path,
    frame_timestamps: &Path,
    frame_rate: FloatType,
) -> Result<SyncStatistics> {
    let frames = read_frame_timestamps(frame_timestamps)?;
    let synchronizer = TimestampSynchronizer::new(frames, frame_rate)
        .with_context(|| format!("frame timestamps in {}", frame_timestamps.display()))?;
    if synchronizer.num_frames() == 0 {
        eyre::bail!("no frame timestamps in {}", frame_timestamps.display());
    }

    let telemetry_path = session_dir.join(TELEMETRY_FNAME);
    let mut rdr = csv::Reader::from_path(&telemetry_path)
        .with_context(|| format!("opening {}", telemetry_path.display()))?;
    let mut rows: Vec<SaveTrackingSample> = Vec::new();
    let mut records = rdr.deserialize::<SaveTrackingSample>().peekable();
    while let Some(row) = records.next() {
        match row {
            Ok(row) => rows.push(row),
            Err(e) if records.peek().is_none() => {
                log::warn!("ignoring incomplete final row of {}: {e}", telemetry_path.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", telemetry_path.display()));
            }
        }
    }

    let timestamps: Vec<FloatType> = rows.iter().map(|r| r.time_stamp_ms).collect();
    let (synced, stats) = synchronizer.synchronize(&timestamps);

    let synced_path = session_dir.join(SYNCED_FNAME);
    {
        let wtr = Box::new(bufwriter(&synced_path)?);
        let mut wtr = csv::Writer::from_writer(wtr as Box<dyn Write + Send>);
        for (row, synced) in rows.into_iter().zip(synced) {
            wtr.serialize(SyncedTrackingSample::new(row, synced))?;
        }
        wtr.flush()?;
    }
    std::fs::write(
        session_dir.join(SYNC_STATS_FNAME),
        serde_yaml::to_string(&stats)?,
    )?;

    log::info!(
        "{} samples against {} frames: sync error mean {:.2} ms, max {:.2} ms, {} unmatched",
        stats.num_samples,
        synchronizer.num_frames(),
        stats.mean_sync_error_ms,
        stats.max_sync_error_ms,
        stats.num_unmatched
    );
    log::info!(
        "frame jitter mean {:.2} ms, max {:.2} ms",
        stats.mean_frame_jitter_ms,
        stats.max_frame_jitter_ms
    );
    log::info!("wrote {}", synced_path.display());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;

    fn sample(timestamp_ms: FloatType, lost: bool) -> TrackingSample {
        TrackingSample {
            estimated_position: Vector3::new(2000.0, 10.0, -5.0),
            desired_pan: if lost { FloatType::NAN } else { 45.0 },
            desired_tilt: if lost { FloatType::NAN } else { 1.5 },
            encoder_pan: 44.9,
            encoder_tilt: 1.4,
            timestamp_ms,
            lost,
        }
    }

    fn record(dir: &Path, samples: Vec<TrackingSample>, frames: Option<PathBuf>) -> Result<u64> {
        let (tx, rx) = mpsc::channel(samples.len().max(1));
        for s in samples {
            tx.try_send(s)?;
        }
        drop(tx);
        let cfg = RecorderConfig {
            output_dir: dir.to_path_buf(),
            flush_interval: Duration::from_secs(1),
            frame_timestamps: frames,
            frame_rate: 100.0,
        };
        recorder_task_main(rx, cfg, chrono::Local::now())
    }

    #[test]
    fn test_recorder_writes_session() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("session");
        let n = record(
            &dir,
            vec![sample(1000.0, true), sample(1005.0, false), sample(1010.0, false)],
            None,
        )?;
        assert_eq!(n, 3);

        let rows: Vec<SaveTrackingSample> = csv::Reader::from_path(dir.join(TELEMETRY_FNAME))?
            .deserialize()
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows.len(), 3);
        assert!(rows[0].lost);
        assert!(rows[0].desired_pan.is_nan());
        assert_eq!(rows[2], SaveTrackingSample::from(sample(1010.0, false)));

        let metadata: SessionMetadata =
            serde_yaml::from_str(&std::fs::read_to_string(dir.join(METADATA_FNAME))?)?;
        assert_eq!(metadata.git_revision, env!("GIT_HASH"));
        assert!(!dir.join(SYNCED_FNAME).exists());

        // a session directory is never reused
        assert!(record(&dir, vec![], None).is_err());
        Ok(())
    }

    #[test]
    fn test_recorder_synchronizes_with_frames() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("session");
        let frames_path = tmp.path().join("frames.txt");
        std::fs::write(&frames_path, "# ms\n1000\n1010\n\n1020\n1030\n")?;

        record(
            &dir,
            vec![
                sample(995.0, false),
                sample(1012.0, false),
                sample(1027.0, false),
                sample(1100.0, false),
            ],
            Some(frames_path),
        )?;

        let rows: Vec<SyncedTrackingSample> = csv::Reader::from_path(dir.join(SYNCED_FNAME))?
            .deserialize()
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].frame_number, None);
        assert!(rows[0].sync_error_ms.is_nan());
        assert_eq!(rows[1].frame_number, Some(1));
        assert_eq!(rows[1].relative_time_ms, 12.0);
        assert_eq!(rows[1].sync_error_ms, 2.0);
        assert_eq!(rows[2].frame_number, Some(3));
        assert_eq!(rows[2].sync_error_ms, 3.0);
        assert_eq!(rows[3].frame_number, None);

        let stats: SyncStatistics =
            serde_yaml::from_str(&std::fs::read_to_string(dir.join(SYNC_STATS_FNAME))?)?;
        assert_eq!(stats.num_samples, 4);
        assert_eq!(stats.num_unmatched, 2);
        assert_eq!(stats.max_sync_error_ms, 3.0);
        Ok(())
    }

    #[test]
    fn test_offline_sync_skips_truncated_row() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("session");
        record(&dir, vec![sample(1000.0, false), sample(1010.0, false)], None)?;

        // simulate a crash in the middle of writing a row
        let mut fd = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join(TELEMETRY_FNAME))?;
        fd.write_all(b"2000.0,10.0,-5")?;
        drop(fd);

        let frames_path = tmp.path().join("frames.json");
        std::fs::write(&frames_path, "[1000.0, 1010.0]")?;
        let stats = synchronize_session(&dir, &frames_path, 100.0)?;
        assert_eq!(stats.num_samples, 2);
        assert_eq!(stats.num_unmatched, 0);
        assert_eq!(stats.mean_sync_error_ms, 0.0);
        Ok(())
    }

    #[test]
    fn test_unordered_frames_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("session");
        record(&dir, vec![sample(1000.0, false)], None)?;
        let frames_path = tmp.path().join("frames.txt");
        std::fs::write(&frames_path, "1000\n990\n")?;
        assert!(synchronize_session(&dir, &frames_path, 100.0).is_err());

        std::fs::write(&frames_path, "1000\nabc\n")?;
        assert!(read_frame_timestamps(&frames_path).is_err());
        Ok(())
    }
}
