//! Camera to world rigid transform and its persisted form.

use std::path::Path;

use chrono::{DateTime, Utc};
use na::{Matrix3, Vector3};
use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{Error, FloatType, Result};

/// Current version of [CalibrationRecord] on disk.
pub const CALIBRATION_SCHEMA_VERSION: u16 = 1;

const ORTHONORMAL_TOLERANCE: FloatType = 1e-6;
const VERIFY_TOLERANCE_MM: FloatType = 1e-6;

/// Rigid pose. Translation in millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    #[serde(with = "row_major")]
    pub rotation: Matrix3<FloatType>,
    #[serde(with = "vec3")]
    pub translation: Vector3<FloatType>,
}

impl Pose {
    pub fn new(rotation: Matrix3<FloatType>, translation: Vector3<FloatType>) -> Self {
        Self {
            rotation,
            translation,
        }
    }
}

/// `world = rotation * camera + translation`
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTransform {
    pub rotation: Matrix3<FloatType>,
    pub translation: Vector3<FloatType>,
}

impl CalibrationTransform {
    pub fn apply(&self, camera: &Vector3<FloatType>) -> Vector3<FloatType> {
        self.rotation * camera + self.translation
    }

    /// Express a world point in the frame centered on `origin` with the
    /// calibrated orientation.
    pub fn world_to_local(
        &self,
        point: &Vector3<FloatType>,
        origin: &Vector3<FloatType>,
    ) -> Vector3<FloatType> {
        // rotation is orthonormal, so its transpose is its inverse
        self.rotation.transpose() * (point - origin)
    }
}

pub fn is_rotation(m: &Matrix3<FloatType>) -> bool {
    let err = (m.transpose() * m - Matrix3::identity()).amax();
    err < ORTHONORMAL_TOLERANCE && (m.determinant() - 1.0).abs() < ORTHONORMAL_TOLERANCE
}

/// Derives the camera to world transform from a fiducial observed in both
/// frames at the same instant.
#[derive(Debug, Clone)]
pub struct CoordinateCalibrator {
    transform: CalibrationTransform,
}

impl CoordinateCalibrator {
    /// `pairs` holds `(camera_pose, world_pose)`. The rig is static, so a
    /// single pair suffices. Extra pairs are ignored.
    pub fn from_pose_pairs(pairs: &[(Pose, Pose)]) -> Result<Self> {
        let (camera, world) = pairs.first().ok_or(Error::MissingPose)?;
        if pairs.len() > 1 {
            tracing::warn!(
                "{} pose pairs given, using only the first one",
                pairs.len()
            );
        }
        if !is_rotation(&camera.rotation) {
            return Err(Error::NotOrthonormal("camera"));
        }
        if !is_rotation(&world.rotation) {
            return Err(Error::NotOrthonormal("world"));
        }

        let rotation = world.rotation * camera.rotation.transpose();
        let translation = world.translation - rotation * camera.translation;
        let transform = CalibrationTransform {
            rotation,
            translation,
        };

        let check = transform.apply(&camera.translation);
        let err = (check - world.translation).norm();
        let tol = VERIFY_TOLERANCE_MM * world.translation.norm().max(1.0);
        if err > tol {
            tracing::warn!("calibration verification mismatch: {err:e} mm");
        } else {
            tracing::debug!("calibration verified, residual {err:e} mm");
        }

        Ok(Self { transform })
    }

    pub fn from_transform(transform: CalibrationTransform) -> Result<Self> {
        if !is_rotation(&transform.rotation) {
            return Err(Error::NotOrthonormal("stored"));
        }
        Ok(Self { transform })
    }

    pub fn transform(&self) -> &CalibrationTransform {
        &self.transform
    }

    pub fn world_to_local(
        &self,
        point: &Vector3<FloatType>,
        origin: &Vector3<FloatType>,
    ) -> Vector3<FloatType> {
        self.transform.world_to_local(point, origin)
    }
}

fn default_schema_version() -> u16 {
    // records written before versioning was introduced
    1
}

/// Durable calibration state, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    /// Pan axis reference point in world coordinates (mm)
    pub pan_origin: [FloatType; 3],
    /// Tilt axis reference point in world coordinates (mm). For a mirror
    /// rig this is the mirror center.
    pub tilt_origin: [FloatType; 3],
    /// Row-major camera to world rotation
    pub rotation_matrix: [[FloatType; 3]; 3],
    #[serde(default)]
    pub translation: [FloatType; 3],
    pub timestamp: DateTime<Utc>,
    pub is_calibrated: bool,
}

impl CalibrationRecord {
    pub fn new(
        transform: &CalibrationTransform,
        pan_origin: Vector3<FloatType>,
        tilt_origin: Vector3<FloatType>,
    ) -> Self {
        Self {
            schema_version: CALIBRATION_SCHEMA_VERSION,
            pan_origin: pan_origin.into(),
            tilt_origin: tilt_origin.into(),
            rotation_matrix: row_major::to_rows(&transform.rotation),
            translation: transform.translation.into(),
            timestamp: Utc::now(),
            is_calibrated: true,
        }
    }

    /// Load and validate a record. Anything but a calibrated record of a
    /// known version is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let buf = match std::fs::read_to_string(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingCalibration(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let record: Self = serde_json::from_str(&buf)?;
        if record.schema_version != CALIBRATION_SCHEMA_VERSION {
            return Err(Error::UnsupportedRecordVersion(record.schema_version));
        }
        if !record.is_calibrated {
            return Err(Error::MissingCalibration(format!(
                "{} is marked as not calibrated",
                path.display()
            )));
        }
        if !is_rotation(&record.rotation()) {
            return Err(Error::NotOrthonormal("stored"));
        }
        Ok(record)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let buf = serde_json::to_string_pretty(self)?;
        std::fs::write(path, buf)?;
        Ok(())
    }

    pub fn rotation(&self) -> Matrix3<FloatType> {
        row_major::from_rows(&self.rotation_matrix)
    }

    pub fn transform(&self) -> CalibrationTransform {
        CalibrationTransform {
            rotation: self.rotation(),
            translation: self.translation.into(),
        }
    }

    pub fn pan_origin(&self) -> Vector3<FloatType> {
        self.pan_origin.into()
    }

    pub fn tilt_origin(&self) -> Vector3<FloatType> {
        self.tilt_origin.into()
    }
}

mod row_major {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn to_rows(m: &Matrix3<FloatType>) -> [[FloatType; 3]; 3] {
        let mut rows = [[0.0; 3]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, val) in row.iter_mut().enumerate() {
                *val = m[(r, c)];
            }
        }
        rows
    }

    pub fn from_rows(rows: &[[FloatType; 3]; 3]) -> Matrix3<FloatType> {
        Matrix3::from_fn(|r, c| rows[r][c])
    }

    pub fn serialize<S: Serializer>(
        m: &Matrix3<FloatType>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        to_rows(m).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Matrix3<FloatType>, D::Error> {
        let rows = <[[FloatType; 3]; 3]>::deserialize(deserializer)?;
        Ok(from_rows(&rows))
    }
}

mod vec3 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        v: &Vector3<FloatType>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        [v.x, v.y, v.z].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vector3<FloatType>, D::Error> {
        let v = <[FloatType; 3]>::deserialize(deserializer)?;
        Ok(v.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn random_pose<R: Rng>(rng: &mut R) -> Pose {
        let rotation = na::Rotation3::from_euler_angles(
            rng.gen_range(-3.1..3.1),
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-3.1..3.1),
        );
        let translation = Vector3::new(
            rng.gen_range(-5000.0..5000.0),
            rng.gen_range(-5000.0..5000.0),
            rng.gen_range(-5000.0..5000.0),
        );
        Pose::new(rotation.into_inner(), translation)
    }

    #[test]
    fn test_random_pose_roundtrip() -> eyre::Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let camera = random_pose(&mut rng);
            let world = random_pose(&mut rng);
            let cal = CoordinateCalibrator::from_pose_pairs(&[(camera.clone(), world.clone())])?;
            let t = cal.transform();
            assert_relative_eq!(
                t.apply(&camera.translation),
                world.translation,
                epsilon = 1e-8
            );
            assert!(is_rotation(&t.rotation));
            // the rotation also maps the marker orientation
            assert_relative_eq!(t.rotation * camera.rotation, world.rotation, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_translation_only_calibration() -> eyre::Result<()> {
        let camera = Pose::new(Matrix3::identity(), Vector3::zeros());
        let world = Pose::new(Matrix3::identity(), Vector3::new(100.0, 0.0, 0.0));
        let cal = CoordinateCalibrator::from_pose_pairs(&[(camera, world)])?;
        assert_relative_eq!(
            cal.transform().apply(&Vector3::zeros()),
            Vector3::new(100.0, 0.0, 0.0)
        );
        Ok(())
    }

    #[test]
    fn test_missing_pose() {
        assert!(matches!(
            CoordinateCalibrator::from_pose_pairs(&[]),
            Err(Error::MissingPose)
        ));
    }

    #[test]
    fn test_rejects_non_rotation() {
        let camera = Pose::new(Matrix3::identity() * 2.0, Vector3::zeros());
        let world = Pose::new(Matrix3::identity(), Vector3::zeros());
        assert!(matches!(
            CoordinateCalibrator::from_pose_pairs(&[(camera, world)]),
            Err(Error::NotOrthonormal("camera"))
        ));
        // reflection has det -1
        let camera = Pose::new(Matrix3::identity(), Vector3::zeros());
        let world = Pose::new(
            Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)),
            Vector3::zeros(),
        );
        assert!(matches!(
            CoordinateCalibrator::from_pose_pairs(&[(camera, world)]),
            Err(Error::NotOrthonormal("world"))
        ));
    }

    #[test]
    fn test_world_to_local() {
        // camera frame rotated 90 degrees about z
        let rotation = na::Rotation3::from_axis_angle(&Vector3::z_axis(), FloatType::to_radians(90.0));
        let t = CalibrationTransform {
            rotation: rotation.into_inner(),
            translation: Vector3::zeros(),
        };
        let origin = Vector3::new(10.0, 10.0, 0.0);
        let local = t.world_to_local(&Vector3::new(10.0, 20.0, 5.0), &origin);
        assert_relative_eq!(local, Vector3::new(10.0, 0.0, 5.0), epsilon = 1e-12);
    }

    #[test]
    fn test_record_save_load() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("calibration.json");

        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let cal = CoordinateCalibrator::from_pose_pairs(&[(
            random_pose(&mut rng),
            random_pose(&mut rng),
        )])?;
        let record = CalibrationRecord::new(
            cal.transform(),
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(4.0, 5.0, 6.0),
        );
        record.save(&path)?;
        let loaded = CalibrationRecord::load(&path)?;
        assert_eq!(loaded, record);
        assert_relative_eq!(loaded.transform().rotation, cal.transform().rotation);
        assert_eq!(loaded.tilt_origin(), Vector3::new(4.0, 5.0, 6.0));
        Ok(())
    }

    #[test]
    fn test_record_validation() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            CalibrationRecord::load(&missing),
            Err(Error::MissingCalibration(_))
        ));

        // unversioned record written by an earlier tool, not calibrated
        let path = dir.path().join("old.json");
        std::fs::write(
            &path,
            r#"{"pan_origin":[0,0,0],"tilt_origin":[0,0,0],
               "rotation_matrix":[[1,0,0],[0,1,0],[0,0,1]],
               "timestamp":"2024-03-01T12:00:00Z","is_calibrated":false}"#,
        )?;
        assert!(matches!(
            CalibrationRecord::load(&path),
            Err(Error::MissingCalibration(_))
        ));

        let path = dir.path().join("future.json");
        std::fs::write(
            &path,
            r#"{"schema_version":7,"pan_origin":[0,0,0],"tilt_origin":[0,0,0],
               "rotation_matrix":[[1,0,0],[0,1,0],[0,0,1]],
               "timestamp":"2024-03-01T12:00:00Z","is_calibrated":true}"#,
        )?;
        assert!(matches!(
            CalibrationRecord::load(&path),
            Err(Error::UnsupportedRecordVersion(7))
        ));
        Ok(())
    }
}
