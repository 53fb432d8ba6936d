//! Pose conventions and scene normalization.
//!
//! COLMAP stores world-to-camera poses with an OpenCV camera frame (+x
//! right, +y down, +z forward). Training poses are camera-to-world with an
//! OpenGL camera frame (+x right, +y up, +z back), expressed in a world frame
//! obtained by the fixed signed permutation [`world_remap`].

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// OpenCV → OpenGL camera axes, applied to the rotation's columns.
pub fn camera_flip() -> Matrix3<f64> {
    Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0))
}

/// World-axis remap: swap x and y, negate z (determinant +1).
pub fn world_remap() -> Matrix3<f64> {
    Matrix3::new(
        0.0, 1.0, 0.0, //
        1.0, 0.0, 0.0, //
        0.0, 0.0, -1.0,
    )
}

/// Rotation matrix of the quaternion `[qw, qx, qy, qz]`, normalized first.
///
/// Returns `None` for a quaternion that cannot be normalized (zero or
/// non-finite components).
pub fn quat_to_rotation(qvec: [f64; 4]) -> Option<Matrix3<f64>> {
    let [w, x, y, z] = qvec;
    let q = Quaternion::new(w, x, y, z);
    let norm = q.norm();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    Some(UnitQuaternion::from_quaternion(q).to_rotation_matrix().into_inner())
}

/// Camera-to-world rotation and camera centre from a world-to-camera pose.
pub fn camera_to_world(qvec: [f64; 4], tvec: [f64; 3]) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let r = quat_to_rotation(qvec)?;
    let rt = r.transpose();
    let centre = -(rt * Vector3::from(tvec));
    Some((rt, centre))
}

/// A camera-to-world pose in the training convention, before normalization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainingPose {
    pub rotation: Matrix3<f64>,
    pub position: Vector3<f64>,
}

impl TrainingPose {
    /// Convert a COLMAP world-to-camera pose.
    pub fn from_colmap(qvec: [f64; 4], tvec: [f64; 3]) -> Option<Self> {
        let (r_c2w, centre) = camera_to_world(qvec, tvec)?;
        let remap = world_remap();
        Some(Self {
            rotation: remap * r_c2w * camera_flip(),
            position: remap * centre,
        })
    }

    /// The 4×4 homogeneous matrix with the position normalized.
    pub fn to_matrix(&self, norm: &Normalization) -> [[f64; 4]; 4] {
        let p = norm.apply_position(&self.position);
        let r = &self.rotation;
        [
            [r[(0, 0)], r[(0, 1)], r[(0, 2)], p.x],
            [r[(1, 0)], r[(1, 1)], r[(1, 2)], p.y],
            [r[(2, 0)], r[(2, 1)], r[(2, 2)], p.z],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}

/// Recentering and uniform rescaling of a scene.
///
/// A remapped position `p` becomes `(p - centroid) * scale`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Normalization {
    pub centroid: Vector3<f64>,
    pub scale: f64,
    /// Set when the positions could not define a scale and `scale` fell back
    /// to 1.
    pub degenerate: bool,
}

impl Normalization {
    /// Centroid of `positions`, scale `1 / median distance to the centroid`.
    ///
    /// When the median distance is zero but positions are not all equal,
    /// the mean distance is used instead. If no positive finite scale can be
    /// derived, the scale is 1 and only the translation is applied.
    pub fn from_positions(positions: &[Vector3<f64>]) -> Self {
        if positions.is_empty() {
            return Self {
                centroid: Vector3::zeros(),
                scale: 1.0,
                degenerate: true,
            };
        }
        let centroid =
            positions.iter().fold(Vector3::zeros(), |acc, p| acc + p) / positions.len() as f64;

        let mut distances: Vec<f64> = positions.iter().map(|p| (p - centroid).norm()).collect();
        distances.sort_by(f64::total_cmp);
        let mut spread = median_of_sorted(&distances);
        if spread.is_nan() || spread <= 0.0 {
            spread = distances.iter().sum::<f64>() / distances.len() as f64;
        }

        let scale = 1.0 / spread;
        if spread.is_finite() && scale.is_finite() && scale > 0.0 {
            Self {
                centroid,
                scale,
                degenerate: false,
            }
        } else {
            Self {
                centroid: if centroid.iter().all(|v| v.is_finite()) {
                    centroid
                } else {
                    Vector3::zeros()
                },
                scale: 1.0,
                degenerate: true,
            }
        }
    }

    /// Normalize a position already in the remapped world frame.
    pub fn apply_position(&self, p: &Vector3<f64>) -> Vector3<f64> {
        (p - self.centroid) * self.scale
    }

    /// Map a COLMAP world point into the normalized training frame.
    pub fn apply_world_point(&self, xyz: [f64; 3]) -> Vector3<f64> {
        self.apply_position(&(world_remap() * Vector3::from(xyz)))
    }

    /// The 3×4 transform `[P | -centroid]` applied before scaling.
    pub fn applied_transform(&self) -> [[f64; 4]; 3] {
        let p = world_remap();
        let c = self.centroid;
        [
            [p[(0, 0)], p[(0, 1)], p[(0, 2)], -c.x],
            [p[(1, 0)], p[(1, 1)], p[(1, 2)], -c.y],
            [p[(2, 0)], p[(2, 1)], p[(2, 2)], -c.z],
        ]
    }
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}
