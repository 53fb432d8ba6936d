//! Sparse reconstruction model: types, integrity checks and the two COLMAP
//! on-disk encodings.
//!
//! A model directory holds `cameras`, `images` and `points3D` files with
//! either a `.bin` or a `.txt` extension. [`read_model`] prefers the binary
//! files when both exist.

pub mod ids;
pub mod io_colmap_bin;
pub mod io_colmap_text;
pub mod io_ply;
mod types;

use std::path::{Path, PathBuf};

use crate::error::AutotrackError;

pub use ids::{CameraId, ImageId, PointId};
pub use types::{
    CameraModel, CameraModelKind, Observation, Point3D, ReconstructedImage, SparseModel,
    TrackElement,
};

/// On-disk encoding of a sparse model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelEncoding {
    Binary,
    Text,
}

impl ModelEncoding {
    fn extension(self) -> &'static str {
        match self {
            ModelEncoding::Binary => "bin",
            ModelEncoding::Text => "txt",
        }
    }

    fn paths(self, dir: &Path) -> [PathBuf; 3] {
        let ext = self.extension();
        [
            dir.join(format!("cameras.{ext}")),
            dir.join(format!("images.{ext}")),
            dir.join(format!("points3D.{ext}")),
        ]
    }

    /// Whether all three files of this encoding exist in `dir`.
    pub fn is_present_in(self, dir: &Path) -> bool {
        self.paths(dir).iter().all(|p| p.is_file())
    }
}

/// Detect which encoding `dir` contains, preferring binary.
pub fn detect_encoding(dir: &Path) -> Result<ModelEncoding, AutotrackError> {
    if ModelEncoding::Binary.is_present_in(dir) {
        Ok(ModelEncoding::Binary)
    } else if ModelEncoding::Text.is_present_in(dir) {
        Ok(ModelEncoding::Text)
    } else {
        Err(AutotrackError::malformed(
            dir,
            "no complete model found (expected cameras, images and points3D as .bin or .txt)",
        ))
    }
}

/// Read the model in `dir`, auto-detecting the encoding.
pub fn read_model(dir: &Path) -> Result<SparseModel, AutotrackError> {
    let encoding = detect_encoding(dir)?;
    read_model_with(dir, encoding)
}

/// Read the model in `dir` using a specific encoding, then check integrity.
pub fn read_model_with(dir: &Path, encoding: ModelEncoding) -> Result<SparseModel, AutotrackError> {
    let [cameras_path, images_path, points_path] = encoding.paths(dir);
    let model = match encoding {
        ModelEncoding::Binary => SparseModel {
            cameras: io_colmap_bin::read_cameras_bin(&cameras_path)?,
            images: io_colmap_bin::read_images_bin(&images_path)?,
            points: io_colmap_bin::read_points3d_bin(&points_path)?,
        },
        ModelEncoding::Text => SparseModel {
            cameras: io_colmap_text::read_cameras_txt(&cameras_path)?,
            images: io_colmap_text::read_images_txt(&images_path)?,
            points: io_colmap_text::read_points3d_txt(&points_path)?,
        },
    };
    check_integrity(&model, dir)?;
    tracing::debug!(
        dir = %dir.display(),
        ?encoding,
        cameras = model.cameras.len(),
        images = model.images.len(),
        points = model.points.len(),
        "read sparse model"
    );
    Ok(model)
}

/// Write the model into `dir` as binary files.
pub fn write_model_bin(dir: &Path, model: &SparseModel) -> Result<(), AutotrackError> {
    std::fs::create_dir_all(dir)?;
    let [cameras_path, images_path, points_path] = ModelEncoding::Binary.paths(dir);
    io_colmap_bin::write_cameras_bin(&cameras_path, &model.cameras)?;
    io_colmap_bin::write_images_bin(&images_path, &model.images)?;
    io_colmap_bin::write_points3d_bin(&points_path, &model.points)?;
    Ok(())
}

pub use io_colmap_text::write_model_text;

/// Check cross-references between cameras, images and points.
///
/// Every image must reference an existing camera, every track element an
/// existing image (and an in-range observation), and every observation that
/// links to a point must link to an existing point.
pub fn check_integrity(model: &SparseModel, path: &Path) -> Result<(), AutotrackError> {
    for camera in model.cameras.values() {
        if camera.params.len() != camera.kind.num_params() {
            return Err(AutotrackError::malformed(
                path,
                format!(
                    "camera {} ({}) has {} parameter(s), expected {}",
                    camera.id,
                    camera.kind,
                    camera.params.len(),
                    camera.kind.num_params()
                ),
            ));
        }
    }

    for image in model.images.values() {
        if !model.cameras.contains_key(&image.camera_id) {
            return Err(AutotrackError::malformed(
                path,
                format!(
                    "image {} ('{}') references missing camera {}",
                    image.id, image.name, image.camera_id
                ),
            ));
        }
        for (idx, obs) in image.observations.iter().enumerate() {
            if let Some(point_id) = obs.point3d_id {
                if !model.points.contains_key(&point_id) {
                    return Err(AutotrackError::malformed(
                        path,
                        format!(
                            "image {} observation {idx} references missing point {point_id}",
                            image.id
                        ),
                    ));
                }
            }
        }
    }

    for point in model.points.values() {
        for el in &point.track {
            let Some(image) = model.images.get(&el.image_id) else {
                return Err(AutotrackError::malformed(
                    path,
                    format!(
                        "point {} track references missing image {}",
                        point.id, el.image_id
                    ),
                ));
            };
            if el.point2d_idx as usize >= image.observations.len() {
                return Err(AutotrackError::malformed(
                    path,
                    format!(
                        "point {} track references observation {} of image {}, which has {}",
                        point.id,
                        el.point2d_idx,
                        image.id,
                        image.observations.len()
                    ),
                ));
            }
        }
    }

    Ok(())
}

/// Fuzz-only entrypoint for the binary decoders.
#[cfg(feature = "fuzzing")]
pub fn fuzz_parse_model_bin(data: &[u8]) -> Result<(), AutotrackError> {
    let _ = io_colmap_bin::from_cameras_bin_slice(data);
    let _ = io_colmap_bin::from_images_bin_slice(data);
    let _ = io_colmap_bin::from_points3d_bin_slice(data)?;
    Ok(())
}

/// Fuzz-only entrypoint for the text decoders.
#[cfg(feature = "fuzzing")]
pub fn fuzz_parse_model_text(input: &str) -> Result<(), AutotrackError> {
    let _ = io_colmap_text::from_cameras_txt_str(input);
    let _ = io_colmap_text::from_images_txt_str(input);
    let _ = io_colmap_text::from_points3d_txt_str(input)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn tiny_model() -> SparseModel {
        let mut cameras = BTreeMap::new();
        cameras.insert(
            CameraId(1),
            CameraModel {
                id: CameraId(1),
                kind: CameraModelKind::SimplePinhole,
                width: 100,
                height: 80,
                params: vec![90.0, 50.0, 40.0],
            },
        );
        let mut images = BTreeMap::new();
        images.insert(
            ImageId(1),
            ReconstructedImage {
                id: ImageId(1),
                camera_id: CameraId(1),
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [0.0, 0.0, 0.0],
                name: "frame_000001.jpg".to_string(),
                observations: vec![Observation {
                    xy: [10.0, 12.0],
                    point3d_id: Some(PointId(5)),
                }],
            },
        );
        let mut points = BTreeMap::new();
        points.insert(
            PointId(5),
            Point3D {
                id: PointId(5),
                xyz: [0.0, 0.0, 4.0],
                rgb: [200, 100, 50],
                error: 0.3,
                track: vec![TrackElement {
                    image_id: ImageId(1),
                    point2d_idx: 0,
                }],
            },
        );
        SparseModel {
            cameras,
            images,
            points,
        }
    }

    #[test]
    fn consistent_model_passes() {
        check_integrity(&tiny_model(), Path::new("m")).expect("consistent");
    }

    #[test]
    fn dangling_camera_reference_is_malformed() {
        let mut model = tiny_model();
        model.images.get_mut(&ImageId(1)).unwrap().camera_id = CameraId(9);
        let err = check_integrity(&model, Path::new("m")).unwrap_err();
        assert!(err.to_string().contains("missing camera 9"));
    }

    #[test]
    fn dangling_track_reference_is_malformed() {
        let mut model = tiny_model();
        model.points.get_mut(&PointId(5)).unwrap().track[0].image_id = ImageId(2);
        let err = check_integrity(&model, Path::new("m")).unwrap_err();
        assert!(err.to_string().contains("missing image 2"));
    }

    #[test]
    fn missing_model_files_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_model(dir.path()).unwrap_err();
        assert!(matches!(err, AutotrackError::MalformedModel { .. }));
    }

    #[test]
    fn binary_is_preferred_when_both_encodings_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = tiny_model();
        write_model_text(dir.path(), &model).expect("write text");
        assert_eq!(detect_encoding(dir.path()).unwrap(), ModelEncoding::Text);
        write_model_bin(dir.path(), &model).expect("write bin");
        assert_eq!(detect_encoding(dir.path()).unwrap(), ModelEncoding::Binary);
        assert_eq!(read_model(dir.path()).expect("read"), model);
    }
}
