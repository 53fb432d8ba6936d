//! Conversion from a sparse model to training poses.
//!
//! The converter maps every registered image to a camera-to-world matrix in
//! the training convention (see [`crate::geometry`]), normalizes the scene,
//! maps each camera's intrinsics to the OpenCV/fisheye parameterisation and
//! groups frames per camera when requested.

pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use nalgebra::Vector3;

use crate::error::AutotrackError;
use crate::geometry::{Normalization, TrainingPose};
use crate::model::io_ply::{self, PlyVertex};
use crate::model::{CameraId, CameraModel, CameraModelKind, SparseModel};

pub use schema::{
    from_transforms_slice, read_transforms, to_transforms_string, write_transforms, CameraBlock,
    CameraModelName, FrameRecord, Intrinsics, TransformsFile,
};

/// File name of the training-pose document.
pub const TRANSFORMS_FILE: &str = "transforms.json";
/// File name of the exported point cloud.
pub const POINT_CLOUD_FILE: &str = "points3D.ply";

/// Options for [`convert_model`].
#[derive(Clone, Debug)]
pub struct ConvertOptions {
    /// One intrinsics block per camera instead of a single global block.
    pub multi_camera: bool,
    /// Directory holding the registered images; enables on-disk resolution
    /// checks when set.
    pub images_dir: Option<PathBuf>,
    /// Prefix joined to image names to form `file_path`.
    pub image_prefix: String,
    /// Mask path per image name, written as `mask_path`.
    pub mask_paths: BTreeMap<String, String>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            multi_camera: false,
            images_dir: None,
            image_prefix: "images".to_string(),
            mask_paths: BTreeMap::new(),
        }
    }
}

/// Result of a conversion.
#[derive(Clone, Debug)]
pub struct Conversion {
    pub transforms: TransformsFile,
    /// Point cloud in the normalized training frame.
    pub points: Vec<PlyVertex>,
    pub normalization: Normalization,
}

/// Map a reconstruction camera to training intrinsics.
pub fn intrinsics_from_camera(camera: &CameraModel) -> Result<Intrinsics, AutotrackError> {
    let w = u32::try_from(camera.width).map_err(|_| {
        AutotrackError::schema(format!(
            "camera {} width {} does not fit in u32",
            camera.id, camera.width
        ))
    })?;
    let h = u32::try_from(camera.height).map_err(|_| {
        AutotrackError::schema(format!(
            "camera {} height {} does not fit in u32",
            camera.id, camera.height
        ))
    })?;
    let p = &camera.params;
    if p.len() != camera.kind.num_params() {
        return Err(AutotrackError::schema(format!(
            "camera {} ({}) has {} parameter(s), expected {}",
            camera.id,
            camera.kind,
            p.len(),
            camera.kind.num_params()
        )));
    }

    let mut out = Intrinsics::pinhole(0.0, 0.0, 0.0, 0.0, w, h);
    out.camera_model = CameraModelName::OpenCv;
    match camera.kind {
        CameraModelKind::SimplePinhole => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[0], p[1], p[2]);
        }
        CameraModelKind::Pinhole => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[1], p[2], p[3]);
        }
        CameraModelKind::SimpleRadial => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[0], p[1], p[2]);
            out.k1 = p[3];
        }
        CameraModelKind::Radial => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[0], p[1], p[2]);
            (out.k1, out.k2) = (p[3], p[4]);
        }
        CameraModelKind::OpenCv => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[1], p[2], p[3]);
            (out.k1, out.k2, out.p1, out.p2) = (p[4], p[5], p[6], p[7]);
        }
        CameraModelKind::FullOpenCv => {
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[1], p[2], p[3]);
            (out.k1, out.k2, out.p1, out.p2) = (p[4], p[5], p[6], p[7]);
            (out.k3, out.k4, out.k5, out.k6) = (p[8], p[9], p[10], p[11]);
        }
        CameraModelKind::OpenCvFisheye => {
            out.camera_model = CameraModelName::OpenCvFisheye;
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[1], p[2], p[3]);
            (out.k1, out.k2, out.k3, out.k4) = (p[4], p[5], p[6], p[7]);
        }
        CameraModelKind::SimpleRadialFisheye => {
            out.camera_model = CameraModelName::OpenCvFisheye;
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[0], p[1], p[2]);
            out.k1 = p[3];
        }
        CameraModelKind::RadialFisheye => {
            out.camera_model = CameraModelName::OpenCvFisheye;
            (out.fl_x, out.fl_y, out.cx, out.cy) = (p[0], p[0], p[1], p[2]);
            (out.k1, out.k2) = (p[3], p[4]);
        }
        CameraModelKind::Fov | CameraModelKind::ThinPrismFisheye => {
            return Err(AutotrackError::UnsupportedCameraModel {
                camera_id: camera.id.as_u32(),
                model: camera.kind.name().to_string(),
            });
        }
    }
    Ok(out)
}

/// Convert a sparse model to training poses and a normalized point cloud.
///
/// `model_path` is only used in error messages.
pub fn convert_model(
    model: &SparseModel,
    model_path: &Path,
    opts: &ConvertOptions,
) -> Result<Conversion, AutotrackError> {
    let mut images: Vec<_> = model.images.values().collect();
    images.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

    let referenced: BTreeSet<CameraId> = images.iter().map(|img| img.camera_id).collect();
    if !opts.multi_camera && referenced.len() > 1 {
        return Err(AutotrackError::schema(format!(
            "{} cameras are referenced by registered images; use multi-camera mode",
            referenced.len()
        )));
    }

    let mut intrinsics = BTreeMap::new();
    for id in &referenced {
        let camera = model.cameras.get(id).ok_or_else(|| {
            AutotrackError::malformed(model_path, format!("images reference missing camera {id}"))
        })?;
        intrinsics.insert(*id, intrinsics_from_camera(camera)?);
    }

    let mut poses = Vec::with_capacity(images.len());
    for image in &images {
        let pose = TrainingPose::from_colmap(image.qvec, image.tvec).ok_or_else(|| {
            AutotrackError::malformed(
                model_path,
                format!("image {} ('{}') has a degenerate rotation", image.id, image.name),
            )
        })?;
        if let (Some(dir), Some(cam)) = (&opts.images_dir, intrinsics.get(&image.camera_id)) {
            check_image_resolution(&dir.join(&image.name), cam, image.camera_id)?;
        }
        poses.push(pose);
    }

    let positions: Vec<Vector3<f64>> = poses.iter().map(|pose| pose.position).collect();
    let normalization = Normalization::from_positions(&positions);
    if normalization.degenerate && !positions.is_empty() {
        tracing::warn!(
            frames = positions.len(),
            "camera positions do not define a scale; normalizing by translation only"
        );
    }

    let frames = images
        .iter()
        .zip(&poses)
        .map(|(image, pose)| FrameRecord {
            file_path: join_rel(&opts.image_prefix, &image.name),
            transform_matrix: pose.to_matrix(&normalization),
            colmap_im_id: image.id.as_u32(),
            camera_id: opts.multi_camera.then_some(image.camera_id),
            mask_path: opts.mask_paths.get(&image.name).cloned(),
            intrinsics: if opts.multi_camera {
                intrinsics.get(&image.camera_id).cloned()
            } else {
                None
            },
        })
        .collect();

    let (global, cameras) = if opts.multi_camera {
        let blocks = intrinsics
            .iter()
            .map(|(id, intr)| CameraBlock {
                camera_id: *id,
                intrinsics: intr.clone(),
            })
            .collect();
        (None, blocks)
    } else {
        (intrinsics.into_values().next(), Vec::new())
    };

    let points = model
        .points
        .values()
        .map(|point| {
            let p = normalization.apply_world_point(point.xyz);
            PlyVertex {
                xyz: [p.x, p.y, p.z],
                rgb: point.rgb,
            }
        })
        .collect();

    let transforms = TransformsFile {
        intrinsics: global,
        cameras,
        frames,
        applied_transform: Some(normalization.applied_transform()),
        applied_scale: Some(normalization.scale),
        ply_file_path: Some(POINT_CLOUD_FILE.to_string()),
    };

    Ok(Conversion {
        transforms,
        points,
        normalization,
    })
}

/// Write a conversion's `transforms.json` and `points3D.ply` into `out_dir`.
pub fn write_conversion(out_dir: &Path, conversion: &Conversion) -> Result<(), AutotrackError> {
    std::fs::create_dir_all(out_dir)?;
    io_ply::write_ply(&out_dir.join(POINT_CLOUD_FILE), &conversion.points)?;
    write_transforms(&out_dir.join(TRANSFORMS_FILE), &conversion.transforms)?;
    tracing::info!(
        frames = conversion.transforms.frames.len(),
        cameras = conversion.transforms.cameras.len().max(1),
        points = conversion.points.len(),
        scale = conversion.normalization.scale,
        out = %out_dir.display(),
        "wrote training poses"
    );
    Ok(())
}

fn check_image_resolution(
    path: &Path,
    intrinsics: &Intrinsics,
    camera_id: CameraId,
) -> Result<(), AutotrackError> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "image not on disk; skipping resolution check");
        return Ok(());
    }
    let size = imagesize::size(path).map_err(|source| AutotrackError::ImageDimensionRead {
        path: path.to_path_buf(),
        source,
    })?;
    let expected = intrinsics.resolution();
    if (size.width as u64, size.height as u64) != (expected.0 as u64, expected.1 as u64) {
        return Err(AutotrackError::schema(format!(
            "{} is {}x{} but camera {camera_id} is {}x{}",
            path.display(),
            size.width,
            size.height,
            expected.0,
            expected.1
        )));
    }
    Ok(())
}

fn join_rel(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageId, ReconstructedImage};

    fn camera(id: u32, kind: CameraModelKind, params: Vec<f64>) -> CameraModel {
        CameraModel {
            id: CameraId(id),
            kind,
            width: 640,
            height: 480,
            params,
        }
    }

    fn frame_image(id: u32, camera_id: u32, name: &str, tvec: [f64; 3]) -> ReconstructedImage {
        ReconstructedImage {
            id: ImageId(id),
            camera_id: CameraId(camera_id),
            qvec: [1.0, 0.0, 0.0, 0.0],
            tvec,
            name: name.to_string(),
            observations: Vec::new(),
        }
    }

    fn two_camera_model() -> SparseModel {
        let mut model = SparseModel::default();
        for cam in [
            camera(1, CameraModelKind::SimpleRadial, vec![500.0, 320.0, 240.0, 0.05]),
            camera(2, CameraModelKind::Pinhole, vec![400.0, 410.0, 320.0, 240.0]),
        ] {
            model.cameras.insert(cam.id, cam);
        }
        for img in [
            frame_image(3, 1, "b/frame_000001.jpg", [0.0, 0.0, 1.0]),
            frame_image(1, 1, "a/frame_000002.jpg", [1.0, 0.0, 0.0]),
            frame_image(2, 2, "a/frame_000001.jpg", [-1.0, 0.0, 0.0]),
        ] {
            model.images.insert(img.id, img);
        }
        model
    }

    #[test]
    fn radial_model_maps_k1_and_shared_focal() {
        let cam = camera(1, CameraModelKind::SimpleRadial, vec![500.0, 320.0, 240.0, 0.05]);
        let intr = intrinsics_from_camera(&cam).expect("map");
        assert_eq!(intr.camera_model, CameraModelName::OpenCv);
        assert_eq!((intr.fl_x, intr.fl_y), (500.0, 500.0));
        assert_eq!(intr.k1, 0.05);
        assert_eq!(intr.k2, 0.0);
    }

    #[test]
    fn full_opencv_keeps_rational_terms() {
        let params = (1..=12).map(f64::from).collect();
        let intr = intrinsics_from_camera(&camera(1, CameraModelKind::FullOpenCv, params))
            .expect("map");
        assert_eq!((intr.k1, intr.k2, intr.p1, intr.p2), (5.0, 6.0, 7.0, 8.0));
        assert_eq!((intr.k3, intr.k4, intr.k5, intr.k6), (9.0, 10.0, 11.0, 12.0));
    }

    #[test]
    fn fisheye_models_are_tagged() {
        let intr = intrinsics_from_camera(&camera(
            4,
            CameraModelKind::RadialFisheye,
            vec![300.0, 320.0, 240.0, 0.1, 0.01],
        ))
        .expect("map");
        assert_eq!(intr.camera_model, CameraModelName::OpenCvFisheye);
        assert_eq!((intr.k1, intr.k2), (0.1, 0.01));
    }

    #[test]
    fn thin_prism_is_unsupported() {
        let err = intrinsics_from_camera(&camera(
            7,
            CameraModelKind::ThinPrismFisheye,
            vec![0.0; 12],
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            AutotrackError::UnsupportedCameraModel { camera_id: 7, .. }
        ));
    }

    #[test]
    fn single_camera_mode_rejects_two_cameras() {
        let err = convert_model(
            &two_camera_model(),
            Path::new("sparse/0"),
            &ConvertOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AutotrackError::SchemaMismatch { .. }));
    }

    #[test]
    fn multi_camera_frames_are_sorted_and_tagged() {
        let opts = ConvertOptions {
            multi_camera: true,
            ..ConvertOptions::default()
        };
        let conv = convert_model(&two_camera_model(), Path::new("sparse/0"), &opts).expect("convert");
        let tf = &conv.transforms;

        assert!(tf.intrinsics.is_none());
        assert_eq!(tf.cameras.len(), 2);
        let names: Vec<_> = tf.frames.iter().map(|f| f.file_path.as_str()).collect();
        assert_eq!(
            names,
            [
                "images/a/frame_000001.jpg",
                "images/a/frame_000002.jpg",
                "images/b/frame_000001.jpg"
            ]
        );
        assert_eq!(tf.frames[0].camera_id, Some(CameraId(2)));
        assert_eq!(tf.frames[0].intrinsics.as_ref().unwrap().fl_y, 410.0);
        assert_eq!(tf.ply_file_path.as_deref(), Some(POINT_CLOUD_FILE));
    }

    #[test]
    fn positions_are_recentered() {
        let opts = ConvertOptions {
            multi_camera: true,
            ..ConvertOptions::default()
        };
        let conv = convert_model(&two_camera_model(), Path::new("m"), &opts).expect("convert");
        let sum: f64 = (0..3)
            .map(|axis| {
                conv.transforms
                    .frames
                    .iter()
                    .map(|f| f.transform_matrix[axis][3])
                    .sum::<f64>()
                    .abs()
            })
            .sum();
        assert!(sum < 1e-9, "positions not centred: {sum}");
        assert!(conv.normalization.scale > 0.0);
    }

    #[test]
    fn resolution_mismatch_on_disk_is_schema_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let img = image::RgbImage::new(32, 16);
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        img.save(dir.path().join("a/frame_000001.jpg")).unwrap();

        let mut model = two_camera_model();
        model.images.retain(|_, img| img.camera_id == CameraId(2));
        let opts = ConvertOptions {
            images_dir: Some(dir.path().to_path_buf()),
            ..ConvertOptions::default()
        };
        let err = convert_model(&model, Path::new("m"), &opts).unwrap_err();
        assert!(err.to_string().contains("is 32x16 but camera 2 is 640x480"));
    }
}
