use nalgebra as na;
use serde::{Deserialize, Serialize};

pub mod math;
pub use math::*;

pub mod motion_model;
pub mod linear_observation_model;

pub mod estimator;
pub use estimator::{FastTargetParameters, KalmanParameters, TargetEstimator};

pub mod calibration;
pub use calibration::{CalibrationRecord, CalibrationTransform, CoordinateCalibrator, Pose};

pub mod mirror;
pub use mirror::{MirrorCalibrationConfig, MirrorCenterSolution, MirrorCenterSolver, MirrorRayObservation};

pub mod focus;
pub use focus::{FocusConfig, FocusCurve, FocusReference};

pub mod sync;
pub use sync::{SyncStatistics, SyncedSample, TimestampSynchronizer};

pub mod bridge;
pub use bridge::LensStatus;

pub mod utils;
pub use utils::ChangeDetector;

pub type FloatType = f64;

/// Errors from the estimation and calibration math.
///
/// Hardware failures are not represented here. Everything in this enum
/// indicates either bad input data or a programming error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no pose pair supplied for calibration")]
    MissingPose,
    #[error("{0} rotation matrix is not orthonormal with determinant +1")]
    NotOrthonormal(&'static str),
    #[error("{actual} mirror ray observations given, at least {required} required")]
    InsufficientObservations { required: usize, actual: usize },
    #[error("mirror ray bundle is degenerate (singular value ratio {0:e})")]
    DegenerateRayBundle(FloatType),
    #[error("ray direction has zero length")]
    ZeroLengthRay,
    #[error("innovation covariance is not positive definite")]
    SingularInnovation,
    #[error("process noise adaptation requested without a preceding update")]
    AdaptWithoutUpdate,
    #[error("kalman filter error: {0}")]
    Kalman(String),
    #[error("focus calibration table needs at least 3 points, got {0}")]
    InsufficientFocusTable(usize),
    #[error("focus calibration fit failed: {0}")]
    FocusFit(&'static str),
    #[error("frame timestamps are not monotonically non-decreasing at index {0}")]
    UnorderedFrameTimestamps(usize),
    #[error("calibration data missing or not calibrated: {0}")]
    MissingCalibration(String),
    #[error("unsupported calibration record schema version {0}")]
    UnsupportedRecordVersion(u16),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    #[error("serde JSON error {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// --------------------------------------------------------------------------

/// Maps a geometric angle onto the range an actuator accepts.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct AxisConfig {
    /// Geometric angle (degrees) corresponding to `command_min_deg`.
    pub physical_min_deg: FloatType,
    /// Geometric angle (degrees) corresponding to `command_max_deg`.
    pub physical_max_deg: FloatType,
    pub command_min_deg: FloatType,
    pub command_max_deg: FloatType,
}

impl AxisConfig {
    fn validate(&self, name: &str) -> Result<()> {
        let values = [
            self.physical_min_deg,
            self.physical_max_deg,
            self.command_min_deg,
            self.command_max_deg,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig(format!("{name}: non-finite angle")));
        }
        if self.physical_min_deg == self.physical_max_deg {
            return Err(Error::InvalidConfig(format!(
                "{name}: physical_min_deg equals physical_max_deg"
            )));
        }
        Ok(())
    }

    /// The actuator command for a geometric angle, clamped to the command range.
    pub fn command(&self, angle_deg: FloatType) -> FloatType {
        remap(
            angle_deg,
            self.physical_min_deg,
            self.physical_max_deg,
            self.command_min_deg,
            self.command_max_deg,
        )
    }
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            physical_min_deg: -45.0,
            physical_max_deg: 45.0,
            command_min_deg: 22.5,
            command_max_deg: 67.5,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MocapConfig {
    /// If no position arrives for this long, the target is considered lost.
    pub staleness_timeout_ms: u64,
}

impl Default for MocapConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 100,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub flush_interval_secs: FloatType,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 1.0,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    /// Nominal frame rate of the recorded video, used for jitter statistics.
    pub frame_rate: FloatType,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self { frame_rate: 30.0 }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// Adaptive Kalman filter parameters for the 3D target estimate
    pub kalman: KalmanParameters,
    /// Fixed delay between mocap acquisition and actuator command, in seconds.
    ///
    /// The target estimate is projected forward by this amount each
    /// iteration. It should be measured for each rig.
    pub latency_compensation_secs: FloatType,
    pub fast_target: FastTargetParameters,
    pub pan_axis: AxisConfig,
    pub tilt_axis: AxisConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<FocusConfig>,
    #[serde(default)]
    pub mirror: MirrorCalibrationConfig,
    #[serde(default)]
    pub mocap: MocapConfig,
    /// Where the calibration record is loaded from and saved to.
    pub calibration_path: std::path::PathBuf,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub video: VideoConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kalman: KalmanParameters::default(),
            latency_compensation_secs: 0.03,
            fast_target: FastTargetParameters::default(),
            pan_axis: AxisConfig::default(),
            tilt_axis: AxisConfig {
                physical_min_deg: -30.0,
                physical_max_deg: 30.0,
                command_min_deg: -30.0,
                command_max_deg: 30.0,
            },
            focus: None,
            mirror: MirrorCalibrationConfig::default(),
            mocap: MocapConfig::default(),
            calibration_path: "calibration.json".into(),
            telemetry: TelemetryConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Reject values that would later divide by zero or panic.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: FloatType) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{name} must be positive, got {value}")))
            }
        }

        self.pan_axis.validate("pan_axis")?;
        self.tilt_axis.validate("tilt_axis")?;
        if !(self.latency_compensation_secs.is_finite() && self.latency_compensation_secs >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "latency_compensation_secs must be non-negative, got {}",
                self.latency_compensation_secs
            )));
        }
        positive("telemetry.flush_interval_secs", self.telemetry.flush_interval_secs)?;
        positive("video.frame_rate", self.video.frame_rate)?;
        if let Some(focus) = &self.focus {
            if focus.min_steps > focus.max_steps {
                return Err(Error::InvalidConfig(
                    "focus.min_steps exceeds focus.max_steps".into(),
                ));
            }
            if !(focus.min_steps..=focus.max_steps).contains(&focus.park_position) {
                return Err(Error::InvalidConfig(
                    "focus.park_position outside min_steps..=max_steps".into(),
                ));
            }
            if !(focus.distance_threshold_m.is_finite() && focus.distance_threshold_m >= 0.0) {
                return Err(Error::InvalidConfig(
                    "focus.distance_threshold_m must be non-negative".into(),
                ));
            }
            FocusCurve::from_config(focus)?;
        }
        Ok(())
    }
}

/// One iteration of the tracking loop, as sent to the telemetry recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSample {
    /// Latency-compensated target estimate in world coordinates (mm)
    pub estimated_position: na::Vector3<FloatType>,
    /// Commanded pan angle (degrees, actuator range)
    pub desired_pan: FloatType,
    /// Commanded tilt angle (degrees, actuator range)
    pub desired_tilt: FloatType,
    /// Last successful encoder readout, pan (degrees)
    pub encoder_pan: FloatType,
    /// Last successful encoder readout, tilt (degrees)
    pub encoder_tilt: FloatType,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: FloatType,
    /// True if no measurement was available in this iteration
    pub lost: bool,
}

/// Milliseconds since the Unix epoch, the clock shared by telemetry and video.
pub fn epoch_millis(t: chrono::DateTime<chrono::Utc>) -> FloatType {
    t.timestamp_micros() as FloatType / 1000.0
}

#[test]
fn test_config_yaml_roundtrip() -> eyre::Result<()> {
    let mut cfg = TrackerConfig::default();
    cfg.focus = Some(FocusConfig::default());
    let buf = serde_yaml::to_string(&cfg)?;
    let loaded: TrackerConfig = serde_yaml::from_str(&buf)?;
    assert_eq!(cfg, loaded);
    Ok(())
}

#[test]
fn test_config_rejects_unknown_fields() {
    let buf = "bogus_field: 1\n";
    assert!(serde_yaml::from_str::<TrackerConfig>(buf).is_err());
}

#[test]
fn test_config_validation() {
    let mut cfg = TrackerConfig::default();
    cfg.focus = Some(FocusConfig::default());
    assert!(cfg.validate().is_ok());

    let mut flat = cfg.clone();
    flat.pan_axis.physical_max_deg = flat.pan_axis.physical_min_deg;
    assert!(matches!(flat.validate(), Err(Error::InvalidConfig(_))));

    let mut nan_tilt = cfg.clone();
    nan_tilt.tilt_axis.command_min_deg = FloatType::NAN;
    assert!(nan_tilt.validate().is_err());

    for flush in [-1.0, 0.0, FloatType::NAN, FloatType::INFINITY] {
        let mut bad = cfg.clone();
        bad.telemetry.flush_interval_secs = flush;
        assert!(bad.validate().is_err(), "accepted flush interval {flush}");
    }

    let mut bad_rate = cfg.clone();
    bad_rate.video.frame_rate = 0.0;
    assert!(bad_rate.validate().is_err());

    let mut bad_park = cfg.clone();
    if let Some(focus) = bad_park.focus.as_mut() {
        focus.park_position = focus.max_steps + 1;
    }
    assert!(bad_park.validate().is_err());

    let mut short_table = cfg;
    if let Some(focus) = short_table.focus.as_mut() {
        focus.calibration_table.truncate(2);
    }
    assert!(matches!(
        short_table.validate(),
        Err(Error::InsufficientFocusTable(2))
    ));
}
