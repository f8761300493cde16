use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{Error, FloatType, Result};

/// Which calibrated point the focus distance is measured from.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Default)]
pub enum FocusReference {
    PanOrigin,
    /// The mirror center on a mirror rig.
    #[default]
    TiltOrigin,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct FocusConfig {
    /// Lens controller axis driving focus
    pub channel: u8,
    /// `(distance_m, steps)` pairs measured by hand
    pub calibration_table: Vec<(FloatType, FloatType)>,
    pub min_steps: i32,
    pub max_steps: i32,
    /// Focus is only moved when the distance changed by more than this (m).
    pub distance_threshold_m: FloatType,
    /// Absolute position to start from if none was saved (steps)
    pub park_position: i32,
    #[serde(default)]
    pub reference: FocusReference,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            // example table for a 50mm lens; measure per lens
            calibration_table: vec![(0.8, 120.0), (1.5, 610.0), (3.0, 980.0), (6.0, 1190.0)],
            min_steps: 0,
            max_steps: 1250,
            distance_threshold_m: 0.1,
            park_position: 0,
            reference: FocusReference::TiltOrigin,
        }
    }
}

/// Quadratic distance to focus step mapping.
///
/// `steps = c0 + c1*d + c2*d^2`, fit by least squares.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusCurve {
    coeffs: [FloatType; 3],
    min_steps: i32,
    max_steps: i32,
}

impl FocusCurve {
    pub fn fit(
        table: &[(FloatType, FloatType)],
        min_steps: i32,
        max_steps: i32,
    ) -> Result<Self> {
        if table.len() < 3 {
            return Err(Error::InsufficientFocusTable(table.len()));
        }
        if table.iter().any(|(d, s)| !d.is_finite() || !s.is_finite()) {
            return Err(Error::FocusFit("non-finite table entry"));
        }
        if min_steps > max_steps {
            return Err(Error::FocusFit("min_steps exceeds max_steps"));
        }

        let a = na::DMatrix::<FloatType>::from_fn(table.len(), 3, |r, c| table[r].0.powi(c as i32));
        let b = na::DVector::<FloatType>::from_iterator(table.len(), table.iter().map(|(_, s)| *s));
        let svd = a.svd(true, true);
        if svd.rank(1e-9 * svd.singular_values.max()) < 3 {
            return Err(Error::FocusFit("need at least 3 distinct distances"));
        }
        let x = svd
            .solve(&b, FloatType::EPSILON)
            .map_err(Error::FocusFit)?;

        Ok(Self {
            coeffs: [x[0], x[1], x[2]],
            min_steps,
            max_steps,
        })
    }

    pub fn from_config(cfg: &FocusConfig) -> Result<Self> {
        Self::fit(&cfg.calibration_table, cfg.min_steps, cfg.max_steps)
    }

    pub fn coefficients(&self) -> [FloatType; 3] {
        self.coeffs
    }

    /// Absolute focus position for a distance in meters.
    pub fn steps_for(&self, distance_m: FloatType) -> i32 {
        let [c0, c1, c2] = self.coeffs;
        let raw = c0 + c1 * distance_m + c2 * distance_m * distance_m;
        if raw.is_nan() {
            return self.min_steps;
        }
        let clamped = raw
            .round()
            .clamp(self.min_steps as FloatType, self.max_steps as FloatType);
        clamped as i32
    }
}
