//! Adaptive Kalman estimate of the 3D target position.
//!
//! The filter tracks position, velocity and acceleration in world
//! coordinates (mm, mm/s, mm/s^2). Process noise is rescaled after every
//! update from the normalized innovation squared, so the estimate follows
//! sudden manoeuvres without being jittery when the target is still.

use adskalman::{
    CovarianceUpdateMethod, ObservationModel, StateAndCovariance, TransitionModelLinearNoControl,
};
use na::{dimension::U9, Vector3};
use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{
    linear_observation_model::PositionObservationModel3D,
    motion_model::{transition_matrix, ConstantAcceleration3DModel, StateMatrix},
    Error, FloatType, Result,
};

/// Smallest time step used for prediction. Anything at or below zero (or
/// non-finite) is replaced by this.
pub const MIN_DT_SECS: FloatType = 1e-4;

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct KalmanParameters {
    /// Spectral density of the white jerk driving the motion model (mm^2/s^5)
    pub motion_noise: FloatType,
    /// Variance of each measured coordinate (mm^2)
    pub observation_noise: FloatType,
    pub initial_position_variance: FloatType,
    pub initial_velocity_variance: FloatType,
    pub initial_acceleration_variance: FloatType,
    pub alpha_min: FloatType,
    pub alpha_max: FloatType,
    /// Expected value of the normalized innovation squared. For a
    /// consistent filter with 3D measurements this is 3.
    pub expected_innovation_variance: FloatType,
}

impl Default for KalmanParameters {
    fn default() -> Self {
        Self {
            motion_noise: 5.0e5,
            observation_noise: 4.0,
            initial_position_variance: 1.0e6,
            initial_velocity_variance: 1.0e6,
            initial_acceleration_variance: 1.0e6,
            alpha_min: 0.1,
            alpha_max: 10.0,
            expected_innovation_variance: 3.0,
        }
    }
}

/// Extra linear extrapolation for targets moving faster than the filter
/// can follow.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct FastTargetParameters {
    pub velocity_threshold_mm_s: FloatType,
    pub horizon_secs: FloatType,
}

impl Default for FastTargetParameters {
    fn default() -> Self {
        Self {
            velocity_threshold_mm_s: 500.0,
            horizon_secs: 0.02,
        }
    }
}

pub struct TargetEstimator {
    params: KalmanParameters,
    fast_target: FastTargetParameters,
    observation_model: PositionObservationModel3D,
    dt: FloatType,
    alpha: FloatType,
    estimate: StateAndCovariance<FloatType, U9>,
    /// Post-predict, pre-update estimate of the last `update()`.
    prior: Option<StateAndCovariance<FloatType, U9>>,
    compensated: Option<Vector3<FloatType>>,
    update_count: u64,
    adapt_count: u64,
}

impl TargetEstimator {
    pub fn new(params: KalmanParameters, fast_target: FastTargetParameters) -> Self {
        let mut covariance = StateMatrix::zeros();
        for i in 0..3 {
            covariance[(i, i)] = params.initial_position_variance;
            covariance[(3 + i, 3 + i)] = params.initial_velocity_variance;
            covariance[(6 + i, 6 + i)] = params.initial_acceleration_variance;
        }
        let estimate = StateAndCovariance::new(na::SVector::<FloatType, 9>::zeros(), covariance);
        let observation_model = PositionObservationModel3D::new(params.observation_noise);
        Self {
            params,
            fast_target,
            observation_model,
            dt: MIN_DT_SECS,
            alpha: 1.0,
            estimate,
            prior: None,
            compensated: None,
            update_count: 0,
            adapt_count: 0,
        }
    }

    /// Set the time step used by the next `predict()`.
    pub fn set_dt(&mut self, dt: FloatType) {
        self.dt = if dt.is_finite() && dt > 0.0 {
            dt
        } else {
            MIN_DT_SECS
        };
    }

    pub fn dt(&self) -> FloatType {
        self.dt
    }

    pub fn predict(&mut self) {
        let model = ConstantAcceleration3DModel::new(self.dt, self.alpha * self.params.motion_noise);
        let predicted = model.predict(&self.estimate);
        self.estimate = symmetrized(predicted);
    }

    pub fn update(&mut self, measurement: &Vector3<FloatType>) -> Result<()> {
        let posterior = self
            .observation_model
            .update(&self.estimate, measurement, CovarianceUpdateMethod::JosephForm)
            .map_err(|e| Error::Kalman(format!("{e:?}")))?;
        let prior = std::mem::replace(&mut self.estimate, symmetrized(posterior));
        self.prior = Some(prior);
        self.update_count += 1;
        Ok(())
    }

    /// Rescale process noise from the innovation of the last update.
    ///
    /// The innovation is computed against the same prior the gain of the
    /// preceding `update()` was computed from.
    pub fn adapt_process_noise(&mut self, measurement: &Vector3<FloatType>) -> Result<()> {
        let prior = self.prior.take().ok_or(Error::AdaptWithoutUpdate)?;
        let h = self.observation_model.H();
        let innovation = measurement - self.observation_model.predict_observation(prior.state());
        let s = h * prior.covariance() * self.observation_model.HT() + self.observation_model.R();
        let chol = na::Cholesky::new(s).ok_or(Error::SingularInnovation)?;
        let nis = innovation.dot(&chol.solve(&innovation));

        let expected = self.params.expected_innovation_variance;
        let raw = 1.0 + (nis - expected) / expected;
        self.alpha = if raw.is_nan() {
            self.params.alpha_max
        } else {
            raw.clamp(self.params.alpha_min, self.params.alpha_max)
        };
        tracing::trace!("nis {nis:.3}, alpha {:.3}", self.alpha);
        self.adapt_count += 1;
        Ok(())
    }

    /// Project the current estimate `latency_secs` into the future.
    ///
    /// The filter state is not modified, so calling this repeatedly gives
    /// the same answer. Fast targets get an additional linear extrapolation
    /// over the configured horizon.
    pub fn predict_latency(&mut self, latency_secs: FloatType) -> Vector3<FloatType> {
        let latency = if latency_secs.is_finite() {
            latency_secs.max(0.0)
        } else {
            0.0
        };
        let projected = transition_matrix(latency) * self.estimate.state();
        let mut position = projected.fixed_rows::<3>(0).into_owned();
        let velocity = projected.fixed_rows::<3>(3).into_owned();
        if velocity.norm() > self.fast_target.velocity_threshold_mm_s {
            position += velocity * self.fast_target.horizon_secs;
        }
        self.compensated = Some(position);
        position
    }

    /// Filtered position, without latency compensation.
    pub fn get_position(&self) -> Vector3<FloatType> {
        self.estimate.state().fixed_rows::<3>(0).into_owned()
    }

    /// Position from the last `predict_latency()`, or the filtered position
    /// if it was never called.
    pub fn compensated_position(&self) -> Vector3<FloatType> {
        self.compensated.unwrap_or_else(|| self.get_position())
    }

    pub fn velocity(&self) -> Vector3<FloatType> {
        self.estimate.state().fixed_rows::<3>(3).into_owned()
    }

    pub fn covariance(&self) -> &StateMatrix {
        self.estimate.covariance()
    }

    pub fn alpha(&self) -> FloatType {
        self.alpha
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn adapt_count(&self) -> u64 {
        self.adapt_count
    }
}

fn symmetrized(est: StateAndCovariance<FloatType, U9>) -> StateAndCovariance<FloatType, U9> {
    let p = est.covariance();
    let sym = (p + p.transpose()) * 0.5;
    StateAndCovariance::new(*est.state(), sym)
}
