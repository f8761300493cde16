//! Least-squares intersection of a ray bundle.
//!
//! While the tilt axis is swept in fixed steps, the reflected ray is
//! observed once per step. All rays pass (ideally) through the mirror
//! center, which is recovered as the point closest to all of them.

use na::{Matrix3, Vector3};
use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{Error, FloatType, Result};

/// Below this, the ratio of smallest to largest singular value means the
/// rays do not constrain all three coordinates.
const DEGENERATE_SINGULAR_VALUE_RATIO: FloatType = 1e-9;

/// Minimum tilt range (degrees) for a well-conditioned sweep.
const MIN_TILT_SPAN_DEG: FloatType = 1.0;

/// Hard lower bound on the number of rays.
pub const MIN_OBSERVATIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRayObservation {
    /// Commanded tilt angle during this observation (degrees)
    pub tilt_angle: FloatType,
    pub ray_origin: Vector3<FloatType>,
    /// Need not be normalized, but must not be zero.
    pub ray_direction: Vector3<FloatType>,
    /// Rig reference markers at the time of the observation
    pub reference_marker_positions: [Vector3<FloatType>; 3],
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct MirrorCalibrationConfig {
    /// Values below [MIN_OBSERVATIONS] are raised to it.
    pub min_observations: usize,
    pub rms_warning_threshold_mm: FloatType,
}

impl Default for MirrorCalibrationConfig {
    fn default() -> Self {
        Self {
            min_observations: MIN_OBSERVATIONS,
            rms_warning_threshold_mm: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorCenterSolution {
    pub center: Vector3<FloatType>,
    /// RMS perpendicular distance of the rays from `center` (mm)
    pub rms_error: FloatType,
}

pub struct MirrorCenterSolver {
    config: MirrorCalibrationConfig,
}

impl MirrorCenterSolver {
    pub fn new(config: MirrorCalibrationConfig) -> Self {
        Self { config }
    }

    pub fn solve(&self, observations: Vec<MirrorRayObservation>) -> Result<MirrorCenterSolution> {
        let required = self.config.min_observations.max(MIN_OBSERVATIONS);
        if observations.len() < required {
            return Err(Error::InsufficientObservations {
                required,
                actual: observations.len(),
            });
        }

        let (min_tilt, max_tilt) = observations
            .iter()
            .fold((FloatType::INFINITY, FloatType::NEG_INFINITY), |(lo, hi), o| {
                (lo.min(o.tilt_angle), hi.max(o.tilt_angle))
            });
        if max_tilt - min_tilt < MIN_TILT_SPAN_DEG {
            tracing::warn!(
                "mirror sweep only spans {:.2} degrees of tilt",
                max_tilt - min_tilt
            );
        }

        // (projector, origin) per ray
        let rays = observations
            .iter()
            .map(|o| {
                let d = o
                    .ray_direction
                    .try_normalize(FloatType::EPSILON)
                    .ok_or(Error::ZeroLengthRay)?;
                Ok((Matrix3::identity() - d * d.transpose(), o.ray_origin))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut a = Matrix3::zeros();
        let mut b = Vector3::zeros();
        for (p, o) in rays.iter() {
            a += p;
            b += p * o;
        }

        let svd = a.svd(true, true);
        let max_sv = svd.singular_values.max();
        let ratio = if max_sv > 0.0 {
            svd.singular_values.min() / max_sv
        } else {
            0.0
        };
        if ratio < DEGENERATE_SINGULAR_VALUE_RATIO {
            return Err(Error::DegenerateRayBundle(ratio));
        }
        let center = svd
            .solve(&b, FloatType::EPSILON)
            .map_err(|_| Error::DegenerateRayBundle(ratio))?;

        let sum_sq: FloatType = rays
            .iter()
            .map(|(p, o)| (p * (center - o)).norm_squared())
            .sum();
        let rms_error = (sum_sq / rays.len() as FloatType).sqrt();

        if rms_error > self.config.rms_warning_threshold_mm {
            tracing::warn!(
                "mirror center RMS error {rms_error:.2} mm exceeds {} mm",
                self.config.rms_warning_threshold_mm
            );
        } else {
            tracing::info!("mirror center RMS error {rms_error:.3} mm");
        }

        Ok(MirrorCenterSolution { center, rms_error })
    }
}

impl Default for MirrorCenterSolver {
    fn default() -> Self {
        Self::new(MirrorCalibrationConfig::default())
    }
}
