/// general-purpose math functions
use crate::FloatType;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub fn sq(a: FloatType) -> FloatType {
    a * a
}

/// An angle. Always in radians. Newtype wrapper of FloatType.
///
/// Note: can be NaN (not a number)
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct Angle(pub FloatType);

impl Angle {
    pub fn from_degrees(degrees: FloatType) -> Angle {
        Angle(degrees.to_radians())
    }
    pub fn nan() -> Self {
        Self(FloatType::NAN)
    }
    pub fn degrees(&self) -> FloatType {
        self.0.to_degrees()
    }

    pub fn as_float(&self) -> FloatType {
        self.0
    }
}

/// Pan angle of a point given in a pan-axis local frame.
///
/// Rotation about the local z axis, zero along +x.
pub fn pan_angle(local: &Vector3<FloatType>) -> Angle {
    Angle(local.y.atan2(local.x))
}

/// Tilt angle of a point given in a tilt-axis local frame.
///
/// Elevation above the local xy plane.
pub fn tilt_angle(local: &Vector3<FloatType>) -> Angle {
    Angle(local.z.atan2(local.x.hypot(local.y)))
}

/// Linearly map `value` from `[in_min, in_max]` into `[out_min, out_max]`.
///
/// The result is clamped to the output range, so inputs outside the input
/// range saturate. The output range may be given in either order.
pub fn remap(
    value: FloatType,
    in_min: FloatType,
    in_max: FloatType,
    out_min: FloatType,
    out_max: FloatType,
) -> FloatType {
    let frac = (value - in_min) / (in_max - in_min);
    let out = out_min + frac * (out_max - out_min);
    let (lo, hi) = if out_min <= out_max {
        (out_min, out_max)
    } else {
        (out_max, out_min)
    };
    out.clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_remap_midpoint() {
        assert_relative_eq!(remap(0.0, -45.0, 45.0, 22.5, 67.5), 45.0);
        assert_relative_eq!(remap(-45.0, -45.0, 45.0, 22.5, 67.5), 22.5);
        assert_relative_eq!(remap(45.0, -45.0, 45.0, 22.5, 67.5), 67.5);
    }

    #[test]
    fn test_remap_clamps() {
        assert_relative_eq!(remap(-90.0, -45.0, 45.0, 22.5, 67.5), 22.5);
        assert_relative_eq!(remap(1000.0, -45.0, 45.0, 22.5, 67.5), 67.5);
        // reversed output range
        assert_relative_eq!(remap(1000.0, -45.0, 45.0, 67.5, 22.5), 22.5);
        assert_relative_eq!(remap(-1000.0, -45.0, 45.0, 67.5, 22.5), 67.5);
    }

    #[test]
    fn test_pan_tilt_angles() {
        let p = Vector3::new(1.0, 1.0, 0.0);
        assert_relative_eq!(pan_angle(&p).degrees(), 45.0, epsilon = 1e-12);
        assert_relative_eq!(tilt_angle(&p).degrees(), 0.0, epsilon = 1e-12);

        let p = Vector3::new(3.0, 4.0, 5.0);
        assert_relative_eq!(tilt_angle(&p).degrees(), 45.0, epsilon = 1e-12);

        let p = Vector3::new(-1.0, 0.0, 0.0);
        assert_relative_eq!(pan_angle(&p).degrees(), 180.0, epsilon = 1e-12);
    }
}
