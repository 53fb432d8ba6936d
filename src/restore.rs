//! Standalone distortion restorer.
//!
//! Applies (default) or removes a calibration record's lens distortion on a
//! set of images. Both directions use the padded camera matrix of
//! [`crate::undistort`], so undistorting a distorted image gives back the
//! original on the interior (up to interpolation: about 1e-3 for float
//! images of smooth content, ±2 levels for 8-bit).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::AutotrackError;
use crate::fsutil;
use crate::model::CameraId;
use crate::transforms::{read_transforms, Intrinsics};
use crate::undistort::lens::Lens;
use crate::undistort::remap::{remap_image, Interpolation, RemapTable};
use crate::undistort::{frame_rel, save_image};

/// Extensions scanned when no EXR scan is requested.
const SCAN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// Which way to move between the linear and the distorted image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestoreDirection {
    /// Linear (undistorted) input → image as seen through the lens.
    #[default]
    Distort,
    /// Distorted input → linear image.
    Undistort,
}

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub json_path: PathBuf,
    pub output_dir: PathBuf,
    /// Scan this directory instead of using the record's frame list.
    pub image_dir: Option<PathBuf>,
    /// Scan for `.exr` files (in `image_dir` or next to the record).
    pub exr: bool,
    /// Explicit input files; take precedence over any scan.
    pub inputs: Vec<PathBuf>,
    pub direction: RestoreDirection,
    pub camera_id: Option<CameraId>,
}

#[derive(Clone, Debug, Default)]
pub struct RestoreSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Build the sampling map for one direction.
pub fn restore_table(
    intrinsics: &Intrinsics,
    direction: RestoreDirection,
) -> Result<RemapTable, AutotrackError> {
    let lens = Lens::from_intrinsics(intrinsics);
    let linear_k = lens.padded_camera_matrix();
    match direction {
        RestoreDirection::Distort => RemapTable::distort(&lens, &linear_k),
        RestoreDirection::Undistort => RemapTable::undistort(&lens, &linear_k),
    }
}

/// Directory that scanned or record-listed inputs are relative to; `None`
/// for explicit inputs.
fn input_base(opts: &RestoreOptions) -> Option<PathBuf> {
    if !opts.inputs.is_empty() {
        return None;
    }
    let record_dir = opts
        .json_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if opts.image_dir.is_some() || opts.exr {
        Some(opts.image_dir.clone().unwrap_or(record_dir))
    } else {
        Some(record_dir)
    }
}

/// Collect the images to process, in order.
pub fn collect_inputs(
    opts: &RestoreOptions,
    record_frames: &[String],
) -> Result<Vec<PathBuf>, AutotrackError> {
    let Some(base) = input_base(opts) else {
        return Ok(opts.inputs.clone());
    };

    if opts.image_dir.is_some() || opts.exr {
        let dir = base;
        if !dir.is_dir() {
            return Err(AutotrackError::InvalidConfig(format!(
                "image directory {} does not exist",
                dir.display()
            )));
        }
        let extensions: &[&str] = if opts.exr { &["exr"] } else { SCAN_EXTENSIONS };
        return fsutil::list_files(&dir, extensions, false);
    }

    Ok(record_frames
        .iter()
        .map(|rel| {
            let rel = rel.replace('\\', "/");
            base.join(rel.trim_start_matches("./"))
        })
        .collect())
}

/// Output location of each input, relative to the output directory.
///
/// Inputs under `base` keep their sub-path (without a leading `images/`);
/// anything else keeps its file name. Two inputs that would write the same
/// output are rejected.
pub fn output_paths(
    inputs: &[PathBuf],
    base: Option<&Path>,
) -> Result<Vec<PathBuf>, AutotrackError> {
    let mut claimed: BTreeMap<PathBuf, &Path> = BTreeMap::new();
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let rel = match base.filter(|b| input.starts_with(b)) {
            Some(base) => PathBuf::from(frame_rel(&fsutil::rel_string(base, input))),
            None => input.file_name().map(PathBuf::from).ok_or_else(|| {
                AutotrackError::InvalidConfig(format!("{} is not a file", input.display()))
            })?,
        };
        if let Some(previous) = claimed.insert(rel.clone(), input) {
            return Err(AutotrackError::InvalidConfig(format!(
                "{} and {} would both be written to {}",
                previous.display(),
                input.display(),
                rel.display()
            )));
        }
        outputs.push(rel);
    }
    Ok(outputs)
}

/// Run the restorer.
pub fn restore(opts: &RestoreOptions) -> Result<RestoreSummary, AutotrackError> {
    let record = read_transforms(&opts.json_path)?;
    let intrinsics = record.select_intrinsics(opts.camera_id)?;
    tracing::info!(
        width = intrinsics.w,
        height = intrinsics.h,
        fisheye = intrinsics.is_fisheye(),
        direction = ?opts.direction,
        "loaded calibration"
    );

    let frames: Vec<String> = record
        .frames
        .iter()
        .filter(|f| opts.camera_id.is_none() || f.camera_id == opts.camera_id)
        .map(|f| f.file_path.clone())
        .collect();
    let inputs = collect_inputs(opts, &frames)?;
    if inputs.is_empty() {
        tracing::warn!("no images to process");
        return Ok(RestoreSummary::default());
    }

    let outputs = output_paths(&inputs, input_base(opts).as_deref())?;
    let table = restore_table(intrinsics, opts.direction)?;
    std::fs::create_dir_all(&opts.output_dir)?;

    let mut summary = RestoreSummary::default();
    for (idx, (path, rel)) in inputs.iter().zip(&outputs).enumerate() {
        match restore_one(path, &table, &opts.output_dir.join(rel))? {
            Some(out) => summary.written.push(out),
            None => summary.skipped.push(path.clone()),
        }
        if (idx + 1) % 10 == 0 {
            tracing::info!(done = idx + 1, total = inputs.len(), "processed images");
        }
    }

    tracing::info!(
        written = summary.written.len(),
        skipped = summary.skipped.len(),
        out = %opts.output_dir.display(),
        "restore complete"
    );
    Ok(summary)
}

fn restore_one(
    path: &Path,
    table: &RemapTable,
    out_path: &Path,
) -> Result<Option<PathBuf>, AutotrackError> {
    if !path.is_file() {
        tracing::warn!(path = %path.display(), "image not found; skipping");
        return Ok(None);
    }
    let img = match image::open(path) {
        Ok(img) => img,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not read image; skipping");
            return Ok(None);
        }
    };
    if (img.width(), img.height()) != (table.width, table.height) {
        tracing::warn!(
            path = %path.display(),
            width = img.width(),
            height = img.height(),
            expected_width = table.width,
            expected_height = table.height,
            "resolution does not match the calibration; skipping"
        );
        return Ok(None);
    }

    let out = remap_image(&img, table, Interpolation::Bilinear)?;
    save_image(&out, out_path)?;
    Ok(Some(out_path.to_path_buf()))
}
