//! Batch configuration and the collaborator command lines built from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AutotrackError;
use crate::pipeline::runner::Invocation;

/// Colour conversion applied while extracting frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorSpace {
    /// Frames are written as decoded.
    #[default]
    None,
    /// Linear ACEScg footage converted to sRGB.
    AcesCg,
}

/// Locations of the external tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub colmap: PathBuf,
    pub glomap: PathBuf,
    pub hython: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            colmap: PathBuf::from("colmap"),
            glomap: PathBuf::from("glomap"),
            hython: PathBuf::from("hython"),
        }
    }
}

/// `hython` inside a Houdini installation, or the bare name for a PATH lookup.
pub fn resolve_hython(hfs: Option<&Path>) -> PathBuf {
    match hfs {
        Some(hfs) => {
            let exe = if cfg!(windows) { "hython.exe" } else { "hython" };
            hfs.join("bin").join(exe)
        }
        None => PathBuf::from("hython"),
    }
}

/// Everything a batch run needs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Frame scale factor applied during extraction.
    pub scale: f64,
    pub multi_camera: bool,
    pub skip_undistort: bool,
    pub skip_scene: bool,
    /// Houdini script receiving `<json> <ply> <hip>`.
    pub scene_script: Option<PathBuf>,
    pub color_space: ColorSpace,
    pub lut: Option<PathBuf>,
    pub mask_root: Option<PathBuf>,
    /// Sequential matching overlap.
    pub overlap: u32,
    pub use_gpu: bool,
    pub timeout: Option<Duration>,
    pub overwrite: bool,
    pub tools: ToolPaths,
}

impl PipelineConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            scale: 0.5,
            multi_camera: false,
            skip_undistort: false,
            skip_scene: false,
            scene_script: None,
            color_space: ColorSpace::None,
            lut: None,
            mask_root: None,
            overlap: 12,
            use_gpu: true,
            timeout: None,
            overwrite: false,
            tools: ToolPaths::default(),
        }
    }

    /// Run-scoped checks, done before any clip is touched.
    pub fn validate(&self) -> Result<(), AutotrackError> {
        if !self.input.is_dir() {
            return Err(invalid(format!(
                "input directory {} does not exist",
                self.input.display()
            )));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 || self.scale > 4.0 {
            return Err(invalid(format!(
                "scale must be in (0, 4], got {}",
                self.scale
            )));
        }
        if self.overlap == 0 {
            return Err(invalid("overlap must be at least 1"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout must be positive"));
        }
        if let Some(lut) = &self.lut {
            require_file(lut, "LUT")?;
        }
        if let Some(root) = &self.mask_root {
            if !root.is_dir() {
                return Err(invalid(format!(
                    "mask root {} does not exist",
                    root.display()
                )));
            }
        }
        if !self.skip_scene {
            match &self.scene_script {
                Some(script) => require_file(script, "scene script")?,
                None => {
                    return Err(invalid(
                        "a scene script is required unless scene export is skipped",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Tools that must be reachable for this configuration.
    pub fn required_tools(&self) -> Vec<&Path> {
        let mut tools = vec![
            self.tools.ffmpeg.as_path(),
            self.tools.colmap.as_path(),
            self.tools.glomap.as_path(),
        ];
        if !self.skip_scene {
            tools.push(self.tools.hython.as_path());
        }
        tools
    }

    /// `-vf` filter chain for frame extraction, if any.
    pub fn video_filters(&self) -> Option<String> {
        let mut filters = Vec::new();
        if self.color_space == ColorSpace::AcesCg {
            filters.push(
                "zscale=tin=linear:t=iec61966-2-1:pin=bt2020:p=bt709:min=bt2020nc:m=bt709"
                    .to_string(),
            );
        }
        if let Some(lut) = &self.lut {
            let lut = lut.to_string_lossy().replace('\\', "/");
            filters.push(format!("lut3d='{lut}'"));
        }
        if self.scale != 1.0 {
            filters.push(format!("scale=iw*{0}:ih*{0}", self.scale));
        }
        (!filters.is_empty()).then(|| filters.join(","))
    }

    pub fn ffmpeg_extract(&self, video: &Path, frame_pattern: &Path) -> Invocation {
        let mut inv = Invocation::new(&self.tools.ffmpeg)
            .args(["-loglevel", "error", "-stats", "-i"])
            .arg(video)
            .args(["-qscale:v", "2"]);
        if let Some(filters) = self.video_filters() {
            inv = inv.arg("-vf").arg(filters);
        }
        inv.arg(frame_pattern)
    }

    pub fn colmap_feature_extractor(
        &self,
        database: &Path,
        images: &Path,
        mask_dir: Option<&Path>,
    ) -> Invocation {
        let mut inv = Invocation::new(&self.tools.colmap)
            .arg("feature_extractor")
            .arg("--database_path")
            .arg(database)
            .arg("--image_path")
            .arg(images)
            .args(["--SiftExtraction.use_gpu", if self.use_gpu { "1" } else { "0" }]);
        inv = if self.multi_camera {
            inv.args(["--ImageReader.single_camera_per_folder", "1"])
        } else {
            inv.args(["--ImageReader.single_camera", "1"])
        };
        if let Some(mask_dir) = mask_dir {
            inv = inv.arg("--ImageReader.mask_path").arg(mask_dir);
        }
        inv
    }

    pub fn colmap_sequential_matcher(&self, database: &Path) -> Invocation {
        Invocation::new(&self.tools.colmap)
            .arg("sequential_matcher")
            .arg("--database_path")
            .arg(database)
            .arg("--SequentialMatching.overlap")
            .arg(self.overlap.to_string())
    }

    pub fn glomap_mapper(&self, database: &Path, images: &Path, sparse: &Path) -> Invocation {
        Invocation::new(&self.tools.glomap)
            .arg("mapper")
            .arg("--database_path")
            .arg(database)
            .arg("--image_path")
            .arg(images)
            .arg("--output_path")
            .arg(sparse)
    }

    /// `hython <script> <json> <ply> <hip>`, paths `/`-separated.
    pub fn hython_scene(&self, script: &Path, json: &Path, ply: &Path, hip: &Path) -> Invocation {
        let slash = |p: &Path| p.to_string_lossy().replace('\\', "/");
        Invocation::new(&self.tools.hython)
            .arg(script)
            .arg(slash(json))
            .arg(slash(ply))
            .arg(slash(hip))
    }
}

fn invalid(message: impl Into<String>) -> AutotrackError {
    AutotrackError::InvalidConfig(message.into())
}

fn require_file(path: &Path, what: &str) -> Result<(), AutotrackError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(invalid(format!("{what} {} does not exist", path.display())))
    }
}
