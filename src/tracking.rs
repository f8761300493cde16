//! The tracking loop.
//!
//! Each iteration reads the freshest mocap snapshot, runs the estimator,
//! maps the latency-compensated estimate to focus, pan and tilt commands
//! and emits one [TrackingSample]. Hardware failures inside the loop are
//! logged and the loop carries on; estimator failures end the session.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, WrapErr};
use nalgebra::Vector3;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing as log;

use mocap_ptz_core::{
    epoch_millis, pan_angle, tilt_angle, CalibrationRecord, ChangeDetector, CoordinateCalibrator,
    FloatType, FocusCurve, FocusReference, TargetEstimator, TrackerConfig, TrackingSample,
};

use crate::hardware::{HwResult, LensActuator, MotionCapture, PanTiltActuator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackingMode {
    /// A measurement was available this iteration.
    Tracking,
    /// Target lost, coasting on the motion model.
    Predicting,
}

/// The external devices the controller drives.
pub(crate) struct Collaborators {
    pub(crate) mocap: Box<dyn MotionCapture>,
    pub(crate) pantilt: Box<dyn PanTiltActuator>,
    pub(crate) lens: Option<Box<dyn LensActuator>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SessionSummary {
    pub(crate) iterations: u64,
    pub(crate) elapsed: Duration,
    pub(crate) dropped_samples: u64,
    /// Absolute focus position at shutdown, if known.
    pub(crate) lens_position: Option<i32>,
}

struct FocusControl {
    channel: u8,
    curve: FocusCurve,
    reference: FocusReference,
    distance_threshold_m: FloatType,
    initial_position: i32,
    min_steps: i32,
    max_steps: i32,
    /// Distance at the last focus move.
    last_distance_m: Option<FloatType>,
    /// Absolute position. `None` until the lens accepted a position.
    position: Option<i32>,
    /// A move failed, so the lens may or may not have moved. No further
    /// moves until the position was read back.
    resync_needed: bool,
}

/// Logs the first failure of a repeated operation as an error and the
/// rest at debug level, until it succeeds again.
struct FailureLog {
    what: &'static str,
    consecutive: u64,
    total: u64,
}

impl FailureLog {
    fn new(what: &'static str) -> Self {
        Self {
            what,
            consecutive: 0,
            total: 0,
        }
    }

    fn check<T>(&mut self, result: HwResult<T>) -> Option<T> {
        match result {
            Ok(v) => {
                if self.consecutive > 0 {
                    log::info!("{}: recovered after {} failures", self.what, self.consecutive);
                    self.consecutive = 0;
                }
                Some(v)
            }
            Err(e) => {
                if self.consecutive == 0 {
                    log::error!("{}: {e}", self.what);
                } else {
                    log::debug!("{}: {e}", self.what);
                }
                self.consecutive += 1;
                self.total += 1;
                None
            }
        }
    }
}

pub(crate) struct TrackingController {
    cfg: TrackerConfig,
    estimator: TargetEstimator,
    calibrator: CoordinateCalibrator,
    pan_origin: Vector3<FloatType>,
    tilt_origin: Vector3<FloatType>,
    focus: Option<FocusControl>,
    mocap: Box<dyn MotionCapture>,
    pantilt: Box<dyn PanTiltActuator>,
    lens: Option<Box<dyn LensActuator>>,
    telemetry_tx: Option<mpsc::Sender<TrackingSample>>,
    encoder: (FloatType, FloatType),
    mode: ChangeDetector<TrackingMode>,
    command_failures: FailureLog,
    encoder_failures: FailureLog,
    lens_failures: FailureLog,
    started: Option<Instant>,
    last_iteration: Option<Instant>,
    iterations: u64,
    dropped_samples: u64,
}

impl TrackingController {
    /// `saved_lens_position` is where the focus axis was left by the
    /// previous session, if known.
    pub(crate) fn new(
        cfg: TrackerConfig,
        record: &CalibrationRecord,
        devices: Collaborators,
        telemetry_tx: Option<mpsc::Sender<TrackingSample>>,
        saved_lens_position: Option<i32>,
    ) -> mocap_ptz_core::Result<Self> {
        let calibrator = CoordinateCalibrator::from_transform(record.transform())?;

        let focus = match (&cfg.focus, devices.lens.is_some()) {
            (Some(focus_cfg), true) => Some(FocusControl {
                channel: focus_cfg.channel,
                curve: FocusCurve::from_config(focus_cfg)?,
                reference: focus_cfg.reference,
                distance_threshold_m: focus_cfg.distance_threshold_m,
                initial_position: saved_lens_position
                    .unwrap_or(focus_cfg.park_position)
                    .clamp(focus_cfg.min_steps, focus_cfg.max_steps),
                min_steps: focus_cfg.min_steps,
                max_steps: focus_cfg.max_steps,
                last_distance_m: None,
                position: None,
                resync_needed: false,
            }),
            (Some(_), false) => {
                log::warn!("focus configured but no lens controller, focus disabled");
                None
            }
            (None, true) => {
                log::warn!("lens controller given but focus not configured, lens unused");
                None
            }
            (None, false) => None,
        };
        let lens = if focus.is_some() { devices.lens } else { None };

        let estimator = TargetEstimator::new(cfg.kalman.clone(), cfg.fast_target.clone());
        Ok(Self {
            estimator,
            calibrator,
            pan_origin: record.pan_origin(),
            tilt_origin: record.tilt_origin(),
            focus,
            mocap: devices.mocap,
            pantilt: devices.pantilt,
            lens,
            telemetry_tx,
            encoder: (FloatType::NAN, FloatType::NAN),
            mode: ChangeDetector::new(),
            command_failures: FailureLog::new("pan/tilt command"),
            encoder_failures: FailureLog::new("encoder readout"),
            lens_failures: FailureLog::new("focus move"),
            started: None,
            last_iteration: None,
            iterations: 0,
            dropped_samples: 0,
            cfg,
        })
    }

    /// Open the devices. Any failure here is fatal.
    pub(crate) fn start(&mut self) -> Result<()> {
        self.mocap.start().wrap_err("starting motion capture")?;
        self.pantilt.open().wrap_err("opening pan/tilt actuator")?;
        self.pantilt
            .set_torque(true)
            .wrap_err("enabling pan/tilt torque")?;
        if let (Some(lens), Some(focus)) = (self.lens.as_mut(), self.focus.as_mut()) {
            lens.open().wrap_err("opening lens controller")?;
            match lens.set_absolute_position(focus.channel, focus.initial_position) {
                Ok(()) => {
                    log::info!("focus starts at {} steps", focus.initial_position);
                    focus.position = Some(focus.initial_position);
                }
                Err(e) => log::error!("cannot set focus position, focus disabled: {e}"),
            }
        }
        let now = Instant::now();
        self.started = Some(now);
        self.last_iteration = Some(now);
        Ok(())
    }

    /// Run until `cancel` fires, then shut down.
    ///
    /// Shutdown runs even when starting or an iteration failed, and its
    /// summary is returned in either case.
    pub(crate) fn run(mut self, cancel: CancellationToken) -> (SessionSummary, Result<()>) {
        let result = self.start().and_then(|()| {
            while !cancel.is_cancelled() {
                self.step(Instant::now(), Utc::now())
                    .wrap_err("target estimator failed")?;
            }
            Ok(())
        });
        (self.shutdown(), result)
    }

    /// One loop iteration.
    pub(crate) fn step(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> mocap_ptz_core::Result<TrackingSample> {
        let dt = match self.last_iteration.replace(now) {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f64(),
            None => 0.0,
        };
        self.estimator.set_dt(dt);

        let snapshot = self.mocap.snapshot();
        self.estimator.predict();
        let mode = if snapshot.lost {
            TrackingMode::Predicting
        } else {
            self.estimator.update(&snapshot.position)?;
            self.estimator.adapt_process_noise(&snapshot.position)?;
            TrackingMode::Tracking
        };
        if self.mode.update(&mode) {
            log::info!("{mode:?} ({} markers)", snapshot.marker_count);
        }
        let target = self
            .estimator
            .predict_latency(self.cfg.latency_compensation_secs);

        let has_fix = self.estimator.update_count() > 0;
        let (desired_pan, desired_tilt) = if has_fix {
            self.update_focus(&target);
            let local_pan = self.calibrator.world_to_local(&target, &self.pan_origin);
            let local_tilt = self.calibrator.world_to_local(&target, &self.tilt_origin);
            let pan = self.cfg.pan_axis.command(pan_angle(&local_pan).degrees());
            let tilt = self.cfg.tilt_axis.command(tilt_angle(&local_tilt).degrees());
            self.command_failures
                .check(self.pantilt.set_synchronized_angles(pan, tilt));
            (pan, tilt)
        } else {
            // nothing to aim at before the first fix
            (FloatType::NAN, FloatType::NAN)
        };

        if let Some(angles) = self
            .encoder_failures
            .check(self.pantilt.read_synchronized_angles())
        {
            self.encoder = angles;
        }

        let sample = TrackingSample {
            estimated_position: if has_fix {
                target
            } else {
                Vector3::repeat(FloatType::NAN)
            },
            desired_pan,
            desired_tilt,
            encoder_pan: self.encoder.0,
            encoder_tilt: self.encoder.1,
            timestamp_ms: epoch_millis(wall),
            lost: mode == TrackingMode::Predicting,
        };
        self.send_telemetry(sample.clone());
        self.iterations += 1;
        Ok(sample)
    }

    fn update_focus(&mut self, target: &Vector3<FloatType>) {
        let (Some(focus), Some(lens)) = (self.focus.as_mut(), self.lens.as_mut()) else {
            return;
        };
        let Some(mut current) = focus.position else {
            return;
        };
        if focus.resync_needed {
            let status = self.lens_failures.check(lens.read_status());
            match status.and_then(|s| s.position(focus.channel)) {
                Some(position) => {
                    log::info!("focus position read back: {position} steps");
                    focus.resync_needed = false;
                    focus.position = Some(position);
                    current = position;
                }
                None => return,
            }
        }
        let origin = match focus.reference {
            FocusReference::PanOrigin => &self.pan_origin,
            FocusReference::TiltOrigin => &self.tilt_origin,
        };
        let distance_m = (target - origin).norm() / 1000.0;
        if let Some(last) = focus.last_distance_m {
            if (distance_m - last).abs() <= focus.distance_threshold_m {
                return;
            }
        }
        let goal = focus
            .curve
            .steps_for(distance_m)
            .clamp(focus.min_steps, focus.max_steps);
        let delta = goal - current;
        if delta != 0 {
            let Some(position) = self.lens_failures.check(lens.move_axis(focus.channel, delta))
            else {
                focus.resync_needed = true;
                return;
            };
            log::debug!("focus {distance_m:.2} m, {position} steps");
            focus.position = Some(position);
        }
        focus.last_distance_m = Some(distance_m);
    }

    fn send_telemetry(&mut self, sample: TrackingSample) {
        let Some(tx) = self.telemetry_tx.as_ref() else {
            return;
        };
        match tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_samples += 1;
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!("telemetry recorder stopped, samples no longer recorded");
                self.telemetry_tx = None;
            }
        }
    }

    /// Release all devices. Errors are logged, never returned.
    fn shutdown(&mut self) -> SessionSummary {
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            log::info!(
                "{} iterations in {secs:.1} s ({:.1} Hz)",
                self.iterations,
                self.iterations as FloatType / secs
            );
        }
        log::info!(
            "{} measurements, final process noise scale {:.2}",
            self.estimator.update_count(),
            self.estimator.alpha()
        );
        if self.dropped_samples > 0 {
            log::info!("{} telemetry samples dropped", self.dropped_samples);
        }
        for failures in [
            &self.command_failures,
            &self.encoder_failures,
            &self.lens_failures,
        ] {
            if failures.total > 0 {
                log::warn!("{}: {} failures in session", failures.what, failures.total);
            }
        }

        let mut lens_position = None;
        if let (Some(lens), Some(focus)) = (self.lens.as_mut(), self.focus.as_ref()) {
            lens_position = match lens.read_status() {
                Ok(status) => status.position(focus.channel).or(focus.position),
                Err(e) => {
                    log::warn!("cannot read lens status: {e}");
                    focus.position
                }
            };
            if let Err(e) = lens.close() {
                log::warn!("closing lens controller: {e}");
            }
        }

        if let Err(e) = self.pantilt.set_torque(false) {
            log::warn!("disabling torque: {e}");
        }
        if let Err(e) = self.pantilt.close() {
            log::warn!("closing pan/tilt actuator: {e}");
        }
        self.mocap.stop();
        // closes the channel so the recorder finishes
        self.telemetry_tx = None;

        SessionSummary {
            iterations: self.iterations,
            elapsed,
            dropped_samples: self.dropped_samples,
            lens_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    use mocap_ptz_core::{CalibrationTransform, FocusConfig, LensStatus};

    use super::*;
    use crate::hardware::{HardwareError, MocapSnapshot};

    #[derive(Default)]
    struct Rig {
        snapshot: MocapSnapshot,
        fail_mocap_start: bool,
        mocap_stopped: bool,
        fail_commands: bool,
        commands: Vec<(FloatType, FloatType)>,
        torque: bool,
        pantilt_open: bool,
        fail_reads: bool,
        reads: usize,
        /// Moves are carried out but their reply never arrives.
        lose_lens_replies: bool,
        fail_lens_status: bool,
        lens_moves: Vec<(u8, i32)>,
        lens_position: i32,
        lens_peak: i32,
        lens_closed: bool,
    }

    type Shared = Arc<Mutex<Rig>>;

    struct MockMocap(Shared);
    struct MockPanTilt(Shared);
    struct MockLens(Shared);

    impl MotionCapture for MockMocap {
        fn start(&mut self) -> HwResult<()> {
            if self.0.lock().unwrap().fail_mocap_start {
                return Err(HardwareError::Disconnected);
            }
            Ok(())
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().mocap_stopped = true;
        }
        fn snapshot(&self) -> MocapSnapshot {
            self.0.lock().unwrap().snapshot.clone()
        }
    }

    impl PanTiltActuator for MockPanTilt {
        fn open(&mut self) -> HwResult<()> {
            self.0.lock().unwrap().pantilt_open = true;
            Ok(())
        }
        fn close(&mut self) -> HwResult<()> {
            self.0.lock().unwrap().pantilt_open = false;
            Ok(())
        }
        fn set_torque(&mut self, enabled: bool) -> HwResult<()> {
            self.0.lock().unwrap().torque = enabled;
            Ok(())
        }
        fn set_synchronized_angles(&mut self, pan: FloatType, tilt: FloatType) -> HwResult<()> {
            let mut rig = self.0.lock().unwrap();
            if rig.fail_commands {
                return Err(HardwareError::Device("overload".into()));
            }
            rig.commands.push((pan, tilt));
            Ok(())
        }
        fn read_synchronized_angles(&mut self) -> HwResult<(FloatType, FloatType)> {
            let mut rig = self.0.lock().unwrap();
            if rig.fail_reads {
                return Err(HardwareError::Timeout(Duration::from_millis(20)));
            }
            rig.reads += 1;
            Ok((rig.reads as FloatType, -(rig.reads as FloatType)))
        }
    }

    impl LensActuator for MockLens {
        fn open(&mut self) -> HwResult<()> {
            Ok(())
        }
        fn close(&mut self) -> HwResult<()> {
            self.0.lock().unwrap().lens_closed = true;
            Ok(())
        }
        fn move_axis(&mut self, channel: u8, relative_steps: i32) -> HwResult<i32> {
            let mut rig = self.0.lock().unwrap();
            rig.lens_moves.push((channel, relative_steps));
            rig.lens_position += relative_steps;
            rig.lens_peak = rig.lens_peak.max(rig.lens_position);
            if rig.lose_lens_replies {
                return Err(HardwareError::Timeout(Duration::from_millis(20)));
            }
            Ok(rig.lens_position)
        }
        fn set_absolute_position(&mut self, _channel: u8, value: i32) -> HwResult<()> {
            self.0.lock().unwrap().lens_position = value;
            Ok(())
        }
        fn read_status(&mut self) -> HwResult<LensStatus> {
            let rig = self.0.lock().unwrap();
            if rig.fail_lens_status {
                return Err(HardwareError::Timeout(Duration::from_millis(20)));
            }
            Ok(LensStatus {
                positions: vec![rig.lens_position],
                moving: false,
            })
        }
    }

    fn set_target(rig: &Shared, position: Option<Vector3<FloatType>>) {
        let mut rig = rig.lock().unwrap();
        rig.snapshot = match position {
            Some(position) => MocapSnapshot {
                position,
                marker_count: 4,
                lost: false,
                received: Some(Instant::now()),
            },
            None => MocapSnapshot::lost(),
        };
    }

    fn controller(
        cfg: TrackerConfig,
        with_lens: bool,
        telemetry_tx: Option<mpsc::Sender<TrackingSample>>,
    ) -> (TrackingController, Shared) {
        let rig: Shared = Default::default();
        let transform = CalibrationTransform {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        };
        let record = CalibrationRecord::new(&transform, Vector3::zeros(), Vector3::zeros());
        let devices = Collaborators {
            mocap: Box::new(MockMocap(rig.clone())),
            pantilt: Box::new(MockPanTilt(rig.clone())),
            lens: if with_lens {
                Some(Box::new(MockLens(rig.clone())))
            } else {
                None
            },
        };
        let mut ctrl = TrackingController::new(cfg, &record, devices, telemetry_tx, None).unwrap();
        ctrl.start().unwrap();
        (ctrl, rig)
    }

    /// Steps at 100 Hz starting from `t0`.
    fn run_steps(
        ctrl: &mut TrackingController,
        t0: Instant,
        first: u32,
        n: u32,
    ) -> Vec<TrackingSample> {
        (first..first + n)
            .map(|i| {
                let dt = Duration::from_millis(10) * (i + 1);
                ctrl.step(t0 + dt, Utc::now()).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_aims_at_stationary_target() {
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, None);
        // 30 degrees to the left of the pan axis, level
        let y = 2000.0 * 30.0f64.to_radians().tan();
        set_target(&rig, Some(Vector3::new(2000.0, y, 0.0)));
        let samples = run_steps(&mut ctrl, Instant::now(), 0, 200);
        let last = samples.last().unwrap();
        assert!(!last.lost);
        // -45..45 maps onto 22.5..67.5
        assert_relative_eq!(last.desired_pan, 60.0, epsilon = 0.5);
        assert_relative_eq!(last.desired_tilt, 0.0, epsilon = 0.5);
        assert_eq!(rig.lock().unwrap().commands.len(), 200);
    }

    #[test]
    fn test_lost_target_coasts() {
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, None);
        let t0 = Instant::now();
        for i in 0..100 {
            let x = 2000.0 + 500.0 * (i as FloatType) * 0.01;
            set_target(&rig, Some(Vector3::new(x, 0.0, 0.0)));
            run_steps(&mut ctrl, t0, i, 1);
        }
        let updates = ctrl.estimator.update_count();
        let adapts = ctrl.estimator.adapt_count();
        assert_eq!(updates, 100);

        set_target(&rig, None);
        let mut prev_x = ctrl.estimator.get_position().x;
        for i in 100..110 {
            let sample = &run_steps(&mut ctrl, t0, i, 1)[0];
            assert!(sample.lost);
            let x = ctrl.estimator.get_position().x;
            assert!(x > prev_x, "position did not advance while lost");
            prev_x = x;
        }
        assert_eq!(ctrl.estimator.update_count(), updates);
        assert_eq!(ctrl.estimator.adapt_count(), adapts);
        // still commanding from the prediction
        assert_eq!(rig.lock().unwrap().commands.len(), 110);
    }

    #[test]
    fn test_no_commands_before_first_fix() {
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, None);
        let samples = run_steps(&mut ctrl, Instant::now(), 0, 5);
        for sample in samples.iter() {
            assert!(sample.lost);
            assert!(sample.desired_pan.is_nan() && sample.desired_tilt.is_nan());
            // not a target sitting at the world origin
            assert!(sample.estimated_position.iter().all(|v| v.is_nan()));
        }
        assert!(rig.lock().unwrap().commands.is_empty());

        set_target(&rig, Some(Vector3::new(2000.0, 0.0, 0.0)));
        let tracked = run_steps(&mut ctrl, Instant::now(), 5, 1);
        assert!(tracked[0].estimated_position.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_command_failure_keeps_loop_running() {
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, None);
        set_target(&rig, Some(Vector3::new(2000.0, 0.0, 0.0)));
        let t0 = Instant::now();
        run_steps(&mut ctrl, t0, 0, 2);

        rig.lock().unwrap().fail_commands = true;
        let failed = run_steps(&mut ctrl, t0, 2, 5);
        assert!(failed.iter().all(|s| s.desired_pan.is_finite()));
        assert_eq!(ctrl.command_failures.total, 5);
        assert_eq!(rig.lock().unwrap().commands.len(), 2);
        // encoders are still read while commands fail
        assert_eq!(rig.lock().unwrap().reads, 7);

        rig.lock().unwrap().fail_commands = false;
        run_steps(&mut ctrl, t0, 7, 3);
        assert_eq!(rig.lock().unwrap().commands.len(), 5);
        assert_eq!(ctrl.command_failures.consecutive, 0);
    }

    fn focus_cfg() -> TrackerConfig {
        TrackerConfig {
            focus: Some(FocusConfig::default()),
            ..Default::default()
        }
    }

    #[test]
    fn test_lost_lens_reply_does_not_repeat_move() {
        let (mut ctrl, rig) = controller(focus_cfg(), true, None);
        let max_steps = FocusConfig::default().max_steps;
        rig.lock().unwrap().lose_lens_replies = true;
        set_target(&rig, Some(Vector3::new(3000.0, 0.0, 0.0)));
        run_steps(&mut ctrl, Instant::now(), 0, 100);

        let curve = FocusCurve::from_config(&FocusConfig::default()).unwrap();
        let expected = curve.steps_for(3.0);
        let rig = rig.lock().unwrap();
        assert!(rig.lens_peak <= max_steps, "lens driven to {}", rig.lens_peak);
        assert!((rig.lens_position - expected).abs() < 50);
        assert!(ctrl.lens_failures.total >= 1);
    }

    #[test]
    fn test_focus_waits_for_position_readback() {
        let (mut ctrl, rig) = controller(focus_cfg(), true, None);
        {
            let mut rig = rig.lock().unwrap();
            rig.lose_lens_replies = true;
            rig.fail_lens_status = true;
        }
        set_target(&rig, Some(Vector3::new(3000.0, 0.0, 0.0)));
        let t0 = Instant::now();
        run_steps(&mut ctrl, t0, 0, 50);
        // the position is unknown after the first move, so no more moves
        assert_eq!(rig.lock().unwrap().lens_moves.len(), 1);
        let after_first = rig.lock().unwrap().lens_position;

        {
            let mut rig = rig.lock().unwrap();
            rig.lose_lens_replies = false;
            rig.fail_lens_status = false;
        }
        run_steps(&mut ctrl, t0, 50, 50);
        let focus = ctrl.focus.as_ref().unwrap();
        assert!(!focus.resync_needed);
        let rig = rig.lock().unwrap();
        assert_eq!(focus.position, Some(rig.lens_position));
        assert!((rig.lens_position - after_first).abs() < 50);
    }

    #[test]
    fn test_focus_goal_is_clamped() {
        // 5 m is past the end of a shortened focus travel
        let cfg = TrackerConfig {
            focus: Some(FocusConfig {
                max_steps: 700,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (mut ctrl, rig) = controller(cfg, true, None);
        set_target(&rig, Some(Vector3::new(5000.0, 0.0, 0.0)));
        run_steps(&mut ctrl, Instant::now(), 0, 50);
        let rig = rig.lock().unwrap();
        assert_eq!(rig.lens_position, 700);
        assert!(rig.lens_peak <= 700);
    }

    #[test]
    fn test_full_telemetry_channel_drops_newest() {
        let (tx, mut rx) = mpsc::channel(1);
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, Some(tx));
        set_target(&rig, Some(Vector3::new(2000.0, 0.0, 0.0)));
        let samples = run_steps(&mut ctrl, Instant::now(), 0, 3);
        assert_eq!(ctrl.dropped_samples, 2);
        assert_eq!(rx.try_recv().unwrap(), samples[0]);
        assert!(rx.try_recv().is_err());

        // a closed channel disables telemetry without failing the loop
        drop(rx);
        run_steps(&mut ctrl, Instant::now(), 3, 2);
        assert!(ctrl.telemetry_tx.is_none());
    }

    #[test]
    fn test_encoder_failure_reuses_previous_readout() {
        let (mut ctrl, rig) = controller(TrackerConfig::default(), false, None);
        set_target(&rig, Some(Vector3::new(2000.0, 0.0, 0.0)));
        let t0 = Instant::now();
        let first = run_steps(&mut ctrl, t0, 0, 2);
        assert_eq!((first[1].encoder_pan, first[1].encoder_tilt), (2.0, -2.0));

        rig.lock().unwrap().fail_reads = true;
        let failed = run_steps(&mut ctrl, t0, 2, 3);
        for sample in failed.iter() {
            assert_eq!((sample.encoder_pan, sample.encoder_tilt), (2.0, -2.0));
        }
        assert_eq!(ctrl.encoder_failures.total, 3);

        rig.lock().unwrap().fail_reads = false;
        let recovered = run_steps(&mut ctrl, t0, 5, 1);
        assert_eq!(recovered[0].encoder_pan, 3.0);
        assert_eq!(ctrl.encoder_failures.consecutive, 0);
    }

    #[test]
    fn test_focus_moves_only_past_threshold() {
        let cfg = TrackerConfig {
            focus: Some(FocusConfig {
                park_position: 500,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (mut ctrl, rig) = controller(cfg, true, None);
        assert_eq!(rig.lock().unwrap().lens_position, 500);
        let t0 = Instant::now();

        set_target(&rig, Some(Vector3::new(2000.0, 0.0, 0.0)));
        run_steps(&mut ctrl, t0, 0, 50);
        assert_eq!(rig.lock().unwrap().lens_moves.len(), 1);

        // 5 cm closer stays within the 10 cm threshold
        set_target(&rig, Some(Vector3::new(1950.0, 0.0, 0.0)));
        run_steps(&mut ctrl, t0, 50, 50);
        assert_eq!(rig.lock().unwrap().lens_moves.len(), 1);

        set_target(&rig, Some(Vector3::new(3000.0, 0.0, 0.0)));
        run_steps(&mut ctrl, t0, 100, 100);
        let rig = rig.lock().unwrap();
        assert!(rig.lens_moves.len() >= 2);
        assert!(rig.lens_moves.iter().all(|(ch, _)| *ch == 0));
        let curve = FocusCurve::from_config(&FocusConfig::default()).unwrap();
        let expected = curve.steps_for(3.0);
        // last move happened within the threshold of the final distance
        assert!((rig.lens_position - expected).abs() < 50);
    }

    #[test]
    fn test_shutdown_releases_devices() {
        let cfg = TrackerConfig {
            focus: Some(FocusConfig {
                park_position: 321,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (ctrl, rig) = controller(cfg, true, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (summary, result) = ctrl.run(cancel);
        result.unwrap();
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.lens_position, Some(321));
        let rig = rig.lock().unwrap();
        assert!(!rig.torque);
        assert!(!rig.pantilt_open);
        assert!(rig.lens_closed);
        assert!(rig.mocap_stopped);
    }

    #[test]
    fn test_failed_session_still_reports_lens_position() {
        let cfg = TrackerConfig {
            focus: Some(FocusConfig {
                park_position: 321,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (ctrl, rig) = controller(cfg, true, None);
        rig.lock().unwrap().fail_mocap_start = true;
        let (summary, result) = ctrl.run(CancellationToken::new());
        assert!(result.is_err());
        assert_eq!(summary.lens_position, Some(321));
        let rig = rig.lock().unwrap();
        assert!(rig.lens_closed);
        assert!(!rig.pantilt_open);
    }
}
