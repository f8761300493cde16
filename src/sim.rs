//! Simulated rig for running without hardware.

use std::time::{Duration, Instant};

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing as log;

use mocap_ptz_core::{FloatType, LensStatus};

use crate::{
    hardware::{HardwareError, HwResult, LensActuator, PanTiltActuator},
    mocap::MocapPublisher,
};

const MOCAP_RATE_HZ: FloatType = 120.0;
/// The target disappears for `DROPOUT_SECS` every `DROPOUT_PERIOD_SECS`.
const DROPOUT_PERIOD_SECS: FloatType = 7.0;
const DROPOUT_SECS: FloatType = 0.4;
const POSITION_NOISE_MM: FloatType = 1.5;

/// Target position at time `t` on a slow figure-eight in front of the rig.
pub(crate) fn target_path(t: FloatType) -> Vector3<FloatType> {
    Vector3::new(
        2500.0 + 400.0 * (0.3 * t).sin(),
        800.0 * (0.2 * t).sin(),
        1200.0 + 300.0 * (0.4 * t).sin(),
    )
}

/// Publish a noisy moving target until cancelled.
#[tracing::instrument(skip_all)]
pub(crate) async fn run_simulated_mocap(publisher: MocapPublisher, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / MOCAP_RATE_HZ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let start = Instant::now();
    let mut rng = rand::rngs::StdRng::from_entropy();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if publisher.is_closed() {
            break;
        }
        let t = start.elapsed().as_secs_f64();
        if t % DROPOUT_PERIOD_SECS > DROPOUT_PERIOD_SECS - DROPOUT_SECS {
            publisher.publish_lost();
            continue;
        }
        let noise = Vector3::from_fn(|_, _| rng.gen_range(-POSITION_NOISE_MM..POSITION_NOISE_MM));
        publisher.publish(target_path(t) + noise, 4);
    }
    log::debug!("simulated mocap done");
}

/// Servo pair with first-order lag.
pub(crate) struct SimPanTilt {
    time_constant: FloatType,
    is_open: bool,
    torque: bool,
    commanded: (FloatType, FloatType),
    actual: (FloatType, FloatType),
    last_update: Instant,
}

impl SimPanTilt {
    pub(crate) fn new(time_constant: Duration) -> Self {
        Self {
            time_constant: time_constant.as_secs_f64(),
            is_open: false,
            torque: false,
            commanded: (0.0, 0.0),
            actual: (0.0, 0.0),
            last_update: Instant::now(),
        }
    }

    fn advance(&mut self) {
        let dt = self.last_update.elapsed().as_secs_f64();
        self.last_update = Instant::now();
        if !self.torque {
            return;
        }
        let frac = 1.0 - (-dt / self.time_constant).exp();
        self.actual.0 += (self.commanded.0 - self.actual.0) * frac;
        self.actual.1 += (self.commanded.1 - self.actual.1) * frac;
    }

    fn check_open(&self) -> HwResult<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(HardwareError::NotOpen)
        }
    }
}

impl PanTiltActuator for SimPanTilt {
    fn open(&mut self) -> HwResult<()> {
        self.is_open = true;
        self.last_update = Instant::now();
        Ok(())
    }

    fn close(&mut self) -> HwResult<()> {
        self.is_open = false;
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool) -> HwResult<()> {
        self.check_open()?;
        self.advance();
        self.torque = enabled;
        Ok(())
    }

    fn set_synchronized_angles(&mut self, pan_deg: FloatType, tilt_deg: FloatType) -> HwResult<()> {
        self.check_open()?;
        self.advance();
        self.commanded = (pan_deg, tilt_deg);
        Ok(())
    }

    fn read_synchronized_angles(&mut self) -> HwResult<(FloatType, FloatType)> {
        self.check_open()?;
        self.advance();
        Ok(self.actual)
    }
}

/// Lens controller whose steppers arrive instantly.
pub(crate) struct SimLens {
    is_open: bool,
    positions: Vec<i32>,
}

impl SimLens {
    pub(crate) fn new(num_channels: usize) -> Self {
        Self {
            is_open: false,
            positions: vec![0; num_channels],
        }
    }

    fn channel_mut(&mut self, channel: u8) -> HwResult<&mut i32> {
        if !self.is_open {
            return Err(HardwareError::NotOpen);
        }
        self.positions
            .get_mut(usize::from(channel))
            .ok_or_else(|| HardwareError::Device(format!("no channel {channel}")))
    }
}

impl LensActuator for SimLens {
    fn open(&mut self) -> HwResult<()> {
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> HwResult<()> {
        self.is_open = false;
        Ok(())
    }

    fn move_axis(&mut self, channel: u8, relative_steps: i32) -> HwResult<i32> {
        let pos = self.channel_mut(channel)?;
        *pos += relative_steps;
        Ok(*pos)
    }

    fn set_absolute_position(&mut self, channel: u8, value: i32) -> HwResult<()> {
        *self.channel_mut(channel)? = value;
        Ok(())
    }

    fn read_status(&mut self) -> HwResult<LensStatus> {
        if !self.is_open {
            return Err(HardwareError::NotOpen);
        }
        Ok(LensStatus {
            positions: self.positions.clone(),
            moving: false,
        })
    }
}
