//! The training-pose file (`transforms.json`).
//!
//! Field names follow nerfstudio. In single-camera mode the intrinsics live
//! at the top level; in multi-camera mode there is one block per camera in
//! `cameras` and every frame carries its camera's intrinsics and id.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AutotrackError;
use crate::model::CameraId;

/// Lens model tag written as `camera_model`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModelName {
    /// Pinhole with radial/tangential (and optionally rational) distortion.
    #[default]
    #[serde(rename = "OPENCV")]
    OpenCv,
    /// Equidistant fisheye with `k1..k4`.
    #[serde(rename = "OPENCV_FISHEYE")]
    OpenCvFisheye,
    /// Pinhole without distortion (undistorted output).
    #[serde(rename = "PINHOLE")]
    Pinhole,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One set of camera intrinsics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    #[serde(default)]
    pub camera_model: CameraModelName,
    pub fl_x: f64,
    pub fl_y: f64,
    pub cx: f64,
    pub cy: f64,
    pub w: u32,
    pub h: u32,
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub k4: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub k5: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub k6: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    /// Legacy calibration records mark fisheye lenses with this flag instead
    /// of `camera_model`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_fisheye: bool,
}

impl Intrinsics {
    /// Distortion-free intrinsics with the given focal lengths and centre.
    pub fn pinhole(fl_x: f64, fl_y: f64, cx: f64, cy: f64, w: u32, h: u32) -> Self {
        Self {
            camera_model: CameraModelName::Pinhole,
            fl_x,
            fl_y,
            cx,
            cy,
            w,
            h,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            k4: 0.0,
            k5: 0.0,
            k6: 0.0,
            p1: 0.0,
            p2: 0.0,
            is_fisheye: false,
        }
    }

    pub fn is_fisheye(&self) -> bool {
        self.is_fisheye || self.camera_model == CameraModelName::OpenCvFisheye
    }

    /// Whether any distortion coefficient is non-zero.
    pub fn has_distortion(&self) -> bool {
        [
            self.k1, self.k2, self.k3, self.k4, self.k5, self.k6, self.p1, self.p2,
        ]
        .iter()
        .any(|k| *k != 0.0)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.w, self.h)
    }
}

/// Intrinsics of one physical camera in multi-camera mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraBlock {
    pub camera_id: CameraId,
    #[serde(flatten)]
    pub intrinsics: Intrinsics,
}

/// One registered frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub file_path: String,
    /// Camera-to-world, row-major.
    pub transform_matrix: [[f64; 4]; 4],
    #[serde(default)]
    pub colmap_im_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<CameraId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_path: Option<String>,
    #[serde(flatten)]
    pub intrinsics: Option<Intrinsics>,
}

/// The full training-pose document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformsFile {
    #[serde(flatten)]
    pub intrinsics: Option<Intrinsics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cameras: Vec<CameraBlock>,
    pub frames: Vec<FrameRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_transform: Option<[[f64; 4]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ply_file_path: Option<String>,
}

impl TransformsFile {
    /// Intrinsics that apply to `frame`: its own override, then its camera's
    /// block, then the global block.
    pub fn intrinsics_for<'a>(&'a self, frame: &'a FrameRecord) -> Option<&'a Intrinsics> {
        if let Some(own) = &frame.intrinsics {
            return Some(own);
        }
        if let Some(id) = frame.camera_id {
            if let Some(block) = self.camera(id) {
                return Some(&block.intrinsics);
            }
        }
        self.intrinsics.as_ref()
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraBlock> {
        self.cameras.iter().find(|block| block.camera_id == id)
    }

    /// Select a calibration: the given camera's block, or the global block.
    pub fn select_intrinsics(
        &self,
        camera_id: Option<CameraId>,
    ) -> Result<&Intrinsics, AutotrackError> {
        match camera_id {
            Some(id) => self.camera(id).map(|block| &block.intrinsics).ok_or_else(|| {
                AutotrackError::schema(format!("no intrinsics block for camera {id}"))
            }),
            None => self
                .intrinsics
                .as_ref()
                .or_else(|| match self.cameras.as_slice() {
                    [only] => Some(&only.intrinsics),
                    _ => None,
                })
                .ok_or_else(|| {
                    AutotrackError::schema(
                        "no global intrinsics; select a camera with --camera-id",
                    )
                }),
        }
    }
}

/// Read a transforms file.
pub fn read_transforms(path: &Path) -> Result<TransformsFile, AutotrackError> {
    let file = File::open(path).map_err(AutotrackError::Io)?;
    let reader = BufReader::new(file);

    serde_json::from_reader(reader).map_err(|source| AutotrackError::TransformsParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a transforms file (pretty-printed, 4-space indentation).
pub fn write_transforms(path: &Path, transforms: &TransformsFile) -> Result<(), AutotrackError> {
    let file = File::create(path).map_err(AutotrackError::Io)?;
    let mut writer = BufWriter::new(file);
    write_pretty(&mut writer, transforms).map_err(|source| AutotrackError::JsonWrite {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush()?;
    Ok(())
}

/// Serialize any value as JSON with 4-space indentation.
pub(crate) fn write_pretty<W: Write, T: Serialize + ?Sized>(
    writer: W,
    value: &T,
) -> Result<(), serde_json::Error> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
    value.serialize(&mut ser)
}

/// Parse a transforms document from bytes.
///
/// Useful for fuzzing and testing without file I/O.
pub fn from_transforms_slice(bytes: &[u8]) -> Result<TransformsFile, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Render a transforms document as a string.
pub fn to_transforms_string(transforms: &TransformsFile) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    write_pretty(&mut buf, transforms)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
