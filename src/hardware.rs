//! Interfaces to the motion-capture feed and the actuators.
//!
//! All calls are blocking and expected to return within a bounded time. The
//! serial implementations enforce this with a per-request timeout.

use std::time::{Duration, Instant};

use nalgebra::Vector3;

use mocap_ptz_core::{FloatType, LensStatus};

#[derive(thiserror::Error, Debug)]
pub(crate) enum HardwareError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("device reported error: {0}")]
    Device(String),
    #[error("unexpected response from device: {0}")]
    UnexpectedResponse(String),
    #[error("firmware version {actual}, expected {expected}")]
    VersionMismatch { expected: u16, actual: u16 },
    #[error("cannot open {port}: {msg}")]
    Open { port: String, msg: String },
    #[error("device is not open")]
    NotOpen,
    #[error("device disconnected")]
    Disconnected,
    #[error("codec error {0}")]
    Codec(#[from] crate::codec::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) type HwResult<T> = std::result::Result<T, HardwareError>;

/// The freshest motion-capture measurement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MocapSnapshot {
    /// World coordinates (mm)
    pub(crate) position: Vector3<FloatType>,
    pub(crate) marker_count: usize,
    pub(crate) lost: bool,
    /// When this measurement arrived. `None` before the first one.
    pub(crate) received: Option<Instant>,
}

impl MocapSnapshot {
    pub(crate) fn lost() -> Self {
        Self {
            position: Vector3::from_element(FloatType::NAN),
            marker_count: 0,
            lost: true,
            received: None,
        }
    }
}

impl Default for MocapSnapshot {
    fn default() -> Self {
        Self::lost()
    }
}

pub(crate) trait MotionCapture: Send {
    fn start(&mut self) -> HwResult<()>;
    fn stop(&mut self);
    fn snapshot(&self) -> MocapSnapshot;

    fn current_position(&self) -> Vector3<FloatType> {
        self.snapshot().position
    }
    fn current_marker_count(&self) -> usize {
        self.snapshot().marker_count
    }
    fn is_lost(&self) -> bool {
        self.snapshot().lost
    }
}

pub(crate) trait PanTiltActuator: Send {
    fn open(&mut self) -> HwResult<()>;
    fn close(&mut self) -> HwResult<()>;
    fn set_torque(&mut self, enabled: bool) -> HwResult<()>;
    /// Angles in the actuator command range (degrees).
    fn set_synchronized_angles(&mut self, pan_deg: FloatType, tilt_deg: FloatType) -> HwResult<()>;
    fn read_synchronized_angles(&mut self) -> HwResult<(FloatType, FloatType)>;
}

pub(crate) trait LensActuator: Send {
    fn open(&mut self) -> HwResult<()>;
    fn close(&mut self) -> HwResult<()>;
    /// Relative move. Returns the new absolute position of `channel`.
    fn move_axis(&mut self, channel: u8, relative_steps: i32) -> HwResult<i32>;
    /// Declare the current absolute position without moving.
    fn set_absolute_position(&mut self, channel: u8, value: i32) -> HwResult<()>;
    fn read_status(&mut self) -> HwResult<LensStatus>;
}
