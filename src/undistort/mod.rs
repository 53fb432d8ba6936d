//! Undistortion of a tracked clip's imagery and intrinsics.
//!
//! Border policy: every source pixel is kept and the image size is
//! unchanged, so the undistorted frames are padded with zeros where no
//! source pixel maps (see [`lens::Lens::padded_camera_matrix`]).
//!
//! Output layout under the output directory:
//!
//! ```text
//! images_undistorted/<rel>
//! masks_undistorted/<rel>.png
//! transforms_undistorted.json
//! ```
//!
//! where `<rel>` is the frame's path relative to the images directory.

pub mod lens;
pub mod remap;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::error::AutotrackError;
use crate::model::CameraId;
use crate::transforms::{
    read_transforms, write_transforms, CameraBlock, FrameRecord, Intrinsics, TransformsFile,
};
use lens::{Lens, PinholeK};
use remap::{remap_image, Interpolation, RemapTable};

pub const UNDISTORTED_TRANSFORMS_FILE: &str = "transforms_undistorted.json";
pub const UNDISTORTED_IMAGES_DIR: &str = "images_undistorted";
pub const UNDISTORTED_MASKS_DIR: &str = "masks_undistorted";

/// Options for [`undistort_transforms`].
#[derive(Clone, Debug)]
pub struct UndistortOptions {
    pub json_path: PathBuf,
    pub output_dir: PathBuf,
    /// Mask directory laid out like the images directory (`<rel>.png`).
    pub masks_dir: Option<PathBuf>,
}

/// What an undistortion pass produced.
#[derive(Clone, Debug, Default)]
pub struct UndistortSummary {
    pub written: usize,
    pub masks_written: usize,
    /// Frames whose image was missing on disk.
    pub skipped: Vec<String>,
    pub output_json: PathBuf,
}

/// One camera's undistortion: the padded camera matrix and the map.
#[derive(Clone, Debug)]
pub struct CameraUndistortion {
    pub new_k: PinholeK,
    pub table: RemapTable,
    pub width: u32,
    pub height: u32,
}

impl CameraUndistortion {
    pub fn new(intrinsics: &Intrinsics) -> Result<Self, AutotrackError> {
        let lens = Lens::from_intrinsics(intrinsics);
        let new_k = lens.padded_camera_matrix();
        let table = RemapTable::undistort(&lens, &new_k)?;
        Ok(Self {
            new_k,
            table,
            width: intrinsics.w,
            height: intrinsics.h,
        })
    }

    /// Distortion-free intrinsics of the undistorted images.
    pub fn intrinsics(&self) -> Intrinsics {
        Intrinsics::pinhole(
            self.new_k.fx,
            self.new_k.fy,
            self.new_k.cx,
            self.new_k.cy,
            self.width,
            self.height,
        )
    }
}

/// Camera key: a camera id, or `None` for the global block.
type CameraKey = Option<CameraId>;

/// Frame path relative to the images directory.
pub(crate) fn frame_rel(file_path: &str) -> &str {
    let rel = file_path.trim_start_matches("./");
    rel.strip_prefix("images/").unwrap_or(rel)
}

/// Undistort every frame listed in a transforms file.
pub fn undistort_transforms(opts: &UndistortOptions) -> Result<UndistortSummary, AutotrackError> {
    let transforms = read_transforms(&opts.json_path)?;
    let base_dir = opts
        .json_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let cameras = build_cameras(&transforms)?;
    std::fs::create_dir_all(&opts.output_dir)?;

    let results = transforms
        .frames
        .par_iter()
        .map(|frame| {
            let camera = cameras.get(&frame.camera_id).ok_or_else(|| {
                AutotrackError::schema(format!("no intrinsics for frame '{}'", frame.file_path))
            })?;
            undistort_frame(frame, camera, &base_dir, opts)
        })
        .collect::<Result<Vec<_>, AutotrackError>>()?;

    let mut summary = UndistortSummary {
        output_json: opts.output_dir.join(UNDISTORTED_TRANSFORMS_FILE),
        ..UndistortSummary::default()
    };
    let mut frames = Vec::with_capacity(results.len());
    for (frame, result) in transforms.frames.iter().zip(results) {
        match result {
            Some(out) => {
                summary.written += 1;
                if out.mask_path.is_some() {
                    summary.masks_written += 1;
                }
                frames.push(out);
            }
            None => summary.skipped.push(frame.file_path.clone()),
        }
    }

    let output = TransformsFile {
        intrinsics: transforms
            .intrinsics
            .as_ref()
            .and_then(|_| cameras.get(&None))
            .map(CameraUndistortion::intrinsics),
        cameras: transforms
            .cameras
            .iter()
            .filter_map(|block| {
                cameras.get(&Some(block.camera_id)).map(|cam| CameraBlock {
                    camera_id: block.camera_id,
                    intrinsics: cam.intrinsics(),
                })
            })
            .collect(),
        frames,
        applied_transform: transforms.applied_transform,
        applied_scale: transforms.applied_scale,
        ply_file_path: transforms
            .ply_file_path
            .as_ref()
            .map(|ply| base_dir.join(ply).to_string_lossy().replace('\\', "/")),
    };
    write_transforms(&summary.output_json, &output)?;

    tracing::info!(
        written = summary.written,
        masks = summary.masks_written,
        skipped = summary.skipped.len(),
        out = %opts.output_dir.display(),
        "undistorted frames"
    );
    Ok(summary)
}

/// Build one undistortion per distinct camera referenced by the file.
fn build_cameras(
    transforms: &TransformsFile,
) -> Result<BTreeMap<CameraKey, CameraUndistortion>, AutotrackError> {
    let mut sources: BTreeMap<CameraKey, &Intrinsics> = BTreeMap::new();
    if let Some(global) = &transforms.intrinsics {
        sources.insert(None, global);
    }
    for block in &transforms.cameras {
        sources.insert(Some(block.camera_id), &block.intrinsics);
    }
    for frame in &transforms.frames {
        let intr = transforms.intrinsics_for(frame).ok_or_else(|| {
            AutotrackError::schema(format!("no intrinsics for frame '{}'", frame.file_path))
        })?;
        sources.entry(frame.camera_id).or_insert(intr);
    }

    sources
        .into_par_iter()
        .map(|(key, intr)| CameraUndistortion::new(intr).map(|cam| (key, cam)))
        .collect()
}

fn undistort_frame(
    frame: &FrameRecord,
    camera: &CameraUndistortion,
    base_dir: &Path,
    opts: &UndistortOptions,
) -> Result<Option<FrameRecord>, AutotrackError> {
    let rel = frame_rel(&frame.file_path);
    let src_path = base_dir.join(&frame.file_path);
    if !src_path.is_file() {
        tracing::warn!(path = %src_path.display(), "image not found; skipping frame");
        return Ok(None);
    }

    let img = image::open(&src_path).map_err(|source| AutotrackError::ImageRead {
        path: src_path.clone(),
        source,
    })?;
    if (img.width(), img.height()) != (camera.width, camera.height) {
        return Err(AutotrackError::schema(format!(
            "{} is {}x{} but its camera is {}x{}",
            src_path.display(),
            img.width(),
            img.height(),
            camera.width,
            camera.height
        )));
    }
    let out_img = remap_image(&img, &camera.table, Interpolation::Bilinear)?;
    let out_path = opts.output_dir.join(UNDISTORTED_IMAGES_DIR).join(rel);
    save_image(&out_img, &out_path)?;

    let mask_src = frame
        .mask_path
        .as_ref()
        .map(|m| base_dir.join(m))
        .or_else(|| {
            opts.masks_dir
                .as_ref()
                .map(|dir| dir.join(format!("{rel}.png")))
        })
        .filter(|p| p.is_file());
    let mask_path = match mask_src {
        Some(mask_src) => {
            let mask = image::open(&mask_src).map_err(|source| AutotrackError::ImageRead {
                path: mask_src.clone(),
                source,
            })?;
            let mask = image::DynamicImage::ImageLuma8(mask.to_luma8());
            let out_mask = remap_image(&mask, &camera.table, Interpolation::Nearest)?;
            let rel_mask = format!("{UNDISTORTED_MASKS_DIR}/{rel}.png");
            save_image(&out_mask, &opts.output_dir.join(&rel_mask))?;
            Some(rel_mask)
        }
        None => None,
    };

    Ok(Some(FrameRecord {
        file_path: format!("{UNDISTORTED_IMAGES_DIR}/{rel}"),
        transform_matrix: frame.transform_matrix,
        colmap_im_id: frame.colmap_im_id,
        camera_id: frame.camera_id,
        mask_path,
        intrinsics: frame.intrinsics.as_ref().map(|_| camera.intrinsics()),
    }))
}

pub(crate) fn save_image(img: &image::DynamicImage, path: &Path) -> Result<(), AutotrackError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path).map_err(|source| AutotrackError::ImageWrite {
        path: path.to_path_buf(),
        source,
    })
}
