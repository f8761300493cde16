#![allow(non_snake_case)]

use na::dimension::{U3, U9};
use na::{OMatrix, OVector};
use nalgebra as na;

use adskalman::ObservationModel;

use crate::FloatType;

// 3D position-observation model for the constant-acceleration state space

pub struct PositionObservationModel3D {
    pub observation_matrix: OMatrix<FloatType, U3, U9>,
    pub observation_matrix_transpose: OMatrix<FloatType, U9, U3>,
    pub observation_noise_covariance: OMatrix<FloatType, U3, U3>,
}

impl PositionObservationModel3D {
    /// `variance` is the per-axis measurement noise (mm^2). Axes are
    /// assumed independent.
    pub fn new(variance: FloatType) -> Self {
        // We only observe the position. Project the 9D state onto its first
        // three components.
        let mut observation_matrix = OMatrix::<FloatType, U3, U9>::zeros();
        for i in 0..3 {
            observation_matrix[(i, i)] = 1.0;
        }
        let observation_noise_covariance = OMatrix::<FloatType, U3, U3>::identity() * variance;
        let observation_matrix_transpose = observation_matrix.transpose();
        Self {
            observation_matrix,
            observation_matrix_transpose,
            observation_noise_covariance,
        }
    }
}

impl ObservationModel<FloatType, U9, U3> for PositionObservationModel3D {
    fn H(&self) -> &OMatrix<FloatType, U3, U9> {
        &self.observation_matrix
    }
    fn HT(&self) -> &OMatrix<FloatType, U9, U3> {
        &self.observation_matrix_transpose
    }
    fn R(&self) -> &OMatrix<FloatType, U3, U3> {
        &self.observation_noise_covariance
    }
    fn predict_observation(&self, state: &OVector<FloatType, U9>) -> OVector<FloatType, U3> {
        &self.observation_matrix * state
    }
}
