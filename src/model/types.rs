//! In-memory representation of a sparse reconstruction.
//!
//! Both on-disk encodings (binary and text) parse into these types, and both
//! writers render from them.

use std::collections::BTreeMap;
use std::fmt;

use super::ids::{CameraId, ImageId, PointId};

/// The lens model of a camera, with COLMAP's numeric ids and names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CameraModelKind {
    SimplePinhole,
    Pinhole,
    SimpleRadial,
    Radial,
    OpenCv,
    OpenCvFisheye,
    FullOpenCv,
    Fov,
    SimpleRadialFisheye,
    RadialFisheye,
    ThinPrismFisheye,
}

impl CameraModelKind {
    pub const ALL: [CameraModelKind; 11] = [
        CameraModelKind::SimplePinhole,
        CameraModelKind::Pinhole,
        CameraModelKind::SimpleRadial,
        CameraModelKind::Radial,
        CameraModelKind::OpenCv,
        CameraModelKind::OpenCvFisheye,
        CameraModelKind::FullOpenCv,
        CameraModelKind::Fov,
        CameraModelKind::SimpleRadialFisheye,
        CameraModelKind::RadialFisheye,
        CameraModelKind::ThinPrismFisheye,
    ];

    /// Numeric id used by the binary encoding.
    pub fn id(&self) -> i32 {
        match self {
            CameraModelKind::SimplePinhole => 0,
            CameraModelKind::Pinhole => 1,
            CameraModelKind::SimpleRadial => 2,
            CameraModelKind::Radial => 3,
            CameraModelKind::OpenCv => 4,
            CameraModelKind::OpenCvFisheye => 5,
            CameraModelKind::FullOpenCv => 6,
            CameraModelKind::Fov => 7,
            CameraModelKind::SimpleRadialFisheye => 8,
            CameraModelKind::RadialFisheye => 9,
            CameraModelKind::ThinPrismFisheye => 10,
        }
    }

    /// Name used by the text encoding.
    pub fn name(&self) -> &'static str {
        match self {
            CameraModelKind::SimplePinhole => "SIMPLE_PINHOLE",
            CameraModelKind::Pinhole => "PINHOLE",
            CameraModelKind::SimpleRadial => "SIMPLE_RADIAL",
            CameraModelKind::Radial => "RADIAL",
            CameraModelKind::OpenCv => "OPENCV",
            CameraModelKind::OpenCvFisheye => "OPENCV_FISHEYE",
            CameraModelKind::FullOpenCv => "FULL_OPENCV",
            CameraModelKind::Fov => "FOV",
            CameraModelKind::SimpleRadialFisheye => "SIMPLE_RADIAL_FISHEYE",
            CameraModelKind::RadialFisheye => "RADIAL_FISHEYE",
            CameraModelKind::ThinPrismFisheye => "THIN_PRISM_FISHEYE",
        }
    }

    /// Number of entries in the parameter vector.
    pub fn num_params(&self) -> usize {
        match self {
            CameraModelKind::SimplePinhole => 3,
            CameraModelKind::Pinhole => 4,
            CameraModelKind::SimpleRadial => 4,
            CameraModelKind::Radial => 5,
            CameraModelKind::OpenCv => 8,
            CameraModelKind::OpenCvFisheye => 8,
            CameraModelKind::FullOpenCv => 12,
            CameraModelKind::Fov => 5,
            CameraModelKind::SimpleRadialFisheye => 4,
            CameraModelKind::RadialFisheye => 5,
            CameraModelKind::ThinPrismFisheye => 12,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for CameraModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Camera intrinsics as estimated by the reconstruction.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraModel {
    pub id: CameraId,
    pub kind: CameraModelKind,
    pub width: u64,
    pub height: u64,
    /// Focal lengths, principal point and distortion, laid out per `kind`.
    pub params: Vec<f64>,
}

/// A 2-D keypoint in a registered image, optionally linked to a 3-D point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub xy: [f64; 2],
    pub point3d_id: Option<PointId>,
}

/// A registered image and its world-to-camera pose.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructedImage {
    pub id: ImageId,
    pub camera_id: CameraId,
    /// Rotation quaternion `[qw, qx, qy, qz]`.
    pub qvec: [f64; 4],
    /// Translation `[tx, ty, tz]`.
    pub tvec: [f64; 3],
    /// File name relative to the images directory, `/`-separated.
    pub name: String,
    pub observations: Vec<Observation>,
}

/// One element of a point's track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackElement {
    pub image_id: ImageId,
    pub point2d_idx: u32,
}

/// A triangulated point.
#[derive(Clone, Debug, PartialEq)]
pub struct Point3D {
    pub id: PointId,
    pub xyz: [f64; 3],
    pub rgb: [u8; 3],
    pub error: f64,
    pub track: Vec<TrackElement>,
}

/// A complete sparse reconstruction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseModel {
    pub cameras: BTreeMap<CameraId, CameraModel>,
    pub images: BTreeMap<ImageId, ReconstructedImage>,
    pub points: BTreeMap<PointId, Point3D>,
}

impl SparseModel {
    /// Mean number of observations per image (0 when there are no images).
    pub fn mean_observations_per_image(&self) -> f64 {
        if self.images.is_empty() {
            return 0.0;
        }
        let total: usize = self.images.values().map(|img| img.observations.len()).sum();
        total as f64 / self.images.len() as f64
    }

    /// Mean track length (0 when there are no points).
    pub fn mean_track_length(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let total: usize = self.points.values().map(|p| p.track.len()).sum();
        total as f64 / self.points.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_ids_and_names_are_consistent() {
        for kind in CameraModelKind::ALL {
            assert_eq!(CameraModelKind::from_id(kind.id()), Some(kind));
            assert_eq!(CameraModelKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(CameraModelKind::from_id(42), None);
        assert_eq!(CameraModelKind::from_name("PINHOLE_PLUS"), None);
    }

    #[test]
    fn empty_model_has_zero_means() {
        let model = SparseModel::default();
        assert_eq!(model.mean_observations_per_image(), 0.0);
        assert_eq!(model.mean_track_length(), 0.0);
    }
}
