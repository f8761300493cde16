#![allow(non_snake_case)]

use na::{dimension::U9, OMatrix};
use nalgebra as na;

use adskalman::TransitionModelLinearNoControl;

use crate::FloatType;

pub type StateMatrix = OMatrix<FloatType, U9, U9>;

/// Constant-acceleration (white jerk) 3D motion model.
///
/// state vector convention: (x, y, z, x_dot, y_dot, z_dot, x_ddot, y_ddot, z_ddot)
pub struct ConstantAcceleration3DModel {
    pub transition_model: StateMatrix,
    pub transition_model_transpose: StateMatrix,
    pub transition_noise_covariance: StateMatrix,
}

impl ConstantAcceleration3DModel {
    /// `noise_scale` multiplies the unit-density process noise for `dt`.
    pub fn new(dt: FloatType, noise_scale: FloatType) -> Self {
        let transition_model = transition_matrix(dt);
        let transition_model_transpose = transition_model.transpose();
        Self {
            transition_model,
            transition_model_transpose,
            transition_noise_covariance: base_process_noise(dt) * noise_scale,
        }
    }
}

/// `F(dt)`: p' = p + v*dt + a*dt^2/2, v' = v + a*dt, a' = a
pub fn transition_matrix(dt: FloatType) -> StateMatrix {
    let mut F = StateMatrix::identity();
    let dt2 = 0.5 * dt * dt;
    for i in 0..3 {
        F[(i, 3 + i)] = dt;
        F[(i, 6 + i)] = dt2;
        F[(3 + i, 6 + i)] = dt;
    }
    F
}

/// Process noise for unit spectral density of white jerk.
///
/// This is the exact discretisation, so two steps of `dt` accumulate the
/// same noise as one step of `2*dt`.
pub fn base_process_noise(dt: FloatType) -> StateMatrix {
    let dt2 = dt.powi(2) / 2.0;
    let dt3 = dt.powi(3);
    let dt4 = dt.powi(4) / 8.0;
    let dt5 = dt.powi(5) / 20.0;

    #[rustfmt::skip]
    let kernel = [
        [dt5,       dt4,       dt3 / 6.0],
        [dt4,       dt3 / 3.0, dt2      ],
        [dt3 / 6.0, dt2,       dt       ],
    ];

    let mut Q = StateMatrix::zeros();
    for axis in 0..3 {
        for (r, row) in kernel.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                Q[(axis + 3 * r, axis + 3 * c)] = *value;
            }
        }
    }
    Q
}

impl TransitionModelLinearNoControl<FloatType, U9> for ConstantAcceleration3DModel {
    fn F(&self) -> &StateMatrix {
        &self.transition_model
    }
    fn FT(&self) -> &StateMatrix {
        &self.transition_model_transpose
    }
    fn Q(&self) -> &StateMatrix {
        &self.transition_noise_covariance
    }
}
