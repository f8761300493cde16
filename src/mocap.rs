//! Latest-value cell between the motion-capture feed and the tracking loop.
//!
//! The feed overwrites the single stored snapshot; the tracking loop reads
//! whatever is freshest. Nothing is queued.

use std::time::{Duration, Instant};

use nalgebra::Vector3;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing as log;

use mocap_ptz_core::FloatType;

use crate::hardware::{HardwareError, HwResult, MocapSnapshot, MotionCapture};

/// Create a connected publisher and reader.
pub(crate) fn latest_value_cell(
    staleness_timeout: Duration,
    cancel: CancellationToken,
) -> (MocapPublisher, LatestMocap) {
    let (tx, rx) = watch::channel(MocapSnapshot::lost());
    let publisher = MocapPublisher { tx };
    let reader = LatestMocap {
        rx,
        staleness_timeout,
        cancel,
        started: false,
    };
    (publisher, reader)
}

/// Write side, owned by the feed task.
#[derive(Clone)]
pub(crate) struct MocapPublisher {
    tx: watch::Sender<MocapSnapshot>,
}

impl MocapPublisher {
    pub(crate) fn publish(&self, position: Vector3<FloatType>, marker_count: usize) {
        let lost = marker_count == 0 || !position.iter().all(|v| v.is_finite());
        let snapshot = MocapSnapshot {
            position,
            marker_count,
            lost,
            received: Some(Instant::now()),
        };
        // An error only means nobody reads anymore.
        let _ = self.tx.send(snapshot);
    }

    /// Mark the target lost, keeping the last position.
    pub(crate) fn publish_lost(&self) {
        self.tx.send_if_modified(|snap| {
            if snap.lost {
                false
            } else {
                snap.lost = true;
                snap.marker_count = 0;
                true
            }
        });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side, handed to the tracking loop as its [MotionCapture].
pub(crate) struct LatestMocap {
    rx: watch::Receiver<MocapSnapshot>,
    staleness_timeout: Duration,
    /// Stops the feed task.
    cancel: CancellationToken,
    started: bool,
}

impl MotionCapture for LatestMocap {
    fn start(&mut self) -> HwResult<()> {
        if self.rx.has_changed().is_err() {
            return Err(HardwareError::Disconnected);
        }
        self.started = true;
        log::info!("motion capture feed attached");
        Ok(())
    }

    fn stop(&mut self) {
        if self.started {
            log::info!("stopping motion capture feed");
        }
        self.started = false;
        self.cancel.cancel();
    }

    fn snapshot(&self) -> MocapSnapshot {
        let mut snap = self.rx.borrow().clone();
        match snap.received {
            Some(received) if received.elapsed() <= self.staleness_timeout => {}
            _ => snap.lost = true,
        }
        snap
    }
}
