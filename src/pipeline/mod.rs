//! Batch orchestration: one state machine per clip.
//!
//! Clips are processed one after another. Each clip walks the states of
//! [`ClipState`] in order; before a stage starts, the artifacts its
//! predecessor leaves on disk are checked. A clip-scoped error fails only
//! that clip, a run-scoped one (missing tool, cancellation) stops the batch
//! after recording the failing clip.

pub mod config;
pub mod report;
pub mod runner;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::error::{AutotrackError, ErrorScope};
use crate::fsutil::{self, IMAGE_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::masks::{ClipMaskQuery, MaskProvider, MaskResolution, NoMasks};
use crate::model::{self, SparseModel};
use crate::transforms::{self, ConvertOptions, Conversion, POINT_CLOUD_FILE, TRANSFORMS_FILE};
use crate::undistort::{self, UndistortOptions, UNDISTORTED_TRANSFORMS_FILE};

pub use config::{resolve_hython, ColorSpace, PipelineConfig, ToolPaths};
pub use report::{BatchReport, ClipIssue, ClipIssueCode, ClipOutcome, ClipStatus};
pub use runner::{CancelFlag, Invocation, ProcessRunner, ToolOutput, ToolRunner};

/// Name of the progress log written into the output directory.
pub const LOG_FILE: &str = "autotrack.log";

/// Per-clip pipeline state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipState {
    Init,
    FramesExtracted,
    MasksResolved,
    FeaturesExtracted,
    Matched,
    Mapped,
    ModelExported,
    PointCloudConverted,
    TransformsGenerated,
    Undistorted,
    SceneBuilt,
    Done,
    Failed,
}

impl ClipState {
    /// The state following `self` on the success path.
    pub fn next(self) -> Option<ClipState> {
        use ClipState::*;
        match self {
            Init => Some(FramesExtracted),
            FramesExtracted => Some(MasksResolved),
            MasksResolved => Some(FeaturesExtracted),
            FeaturesExtracted => Some(Matched),
            Matched => Some(Mapped),
            Mapped => Some(ModelExported),
            ModelExported => Some(PointCloudConverted),
            PointCloudConverted => Some(TransformsGenerated),
            TransformsGenerated => Some(Undistorted),
            Undistorted => Some(SceneBuilt),
            SceneBuilt => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClipState::Done | ClipState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClipState::Init => "Init",
            ClipState::FramesExtracted => "FramesExtracted",
            ClipState::MasksResolved => "MasksResolved",
            ClipState::FeaturesExtracted => "FeaturesExtracted",
            ClipState::Matched => "Matched",
            ClipState::Mapped => "Mapped",
            ClipState::ModelExported => "ModelExported",
            ClipState::PointCloudConverted => "PointCloudConverted",
            ClipState::TransformsGenerated => "TransformsGenerated",
            ClipState::Undistorted => "Undistorted",
            ClipState::SceneBuilt => "SceneBuilt",
            ClipState::Done => "Done",
            ClipState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ClipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An input clip: a video file `D/X.ext`, or a directory `D/X` holding one
/// video per camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClipSource {
    pub name: String,
    /// Directory containing the clip (`D`).
    pub parent: PathBuf,
    pub videos: Vec<PathBuf>,
    pub is_directory: bool,
}

/// Find the clips under `input`, sorted by name.
///
/// Mask directories (`mask/`, `*_mask/`) and directories without videos are
/// ignored. Two clips with the same name are a configuration error since
/// they would share an output directory.
pub fn discover_clips(input: &Path) -> Result<Vec<ClipSource>, AutotrackError> {
    let mut clips = Vec::new();
    for video in fsutil::list_files(input, VIDEO_EXTENSIONS, false)? {
        let Some(name) = video.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        clips.push(ClipSource {
            name,
            parent: input.to_path_buf(),
            videos: vec![video],
            is_directory: false,
        });
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(input)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() || fsutil::is_hidden(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "mask" || name.ends_with("_mask") {
            continue;
        }
        dirs.push((name, path));
    }
    for (name, path) in dirs {
        let videos = fsutil::list_files(&path, VIDEO_EXTENSIONS, false)?;
        if videos.is_empty() {
            tracing::debug!(dir = %path.display(), "no videos; not a clip");
            continue;
        }
        clips.push(ClipSource {
            name,
            parent: input.to_path_buf(),
            videos,
            is_directory: true,
        });
    }

    clips.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in clips.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(AutotrackError::InvalidConfig(format!(
                "two inputs would both write clip '{}'",
                pair[0].name
            )));
        }
    }
    Ok(clips)
}

/// Paths of one clip's outputs. Every stage works from these; nothing
/// depends on the process working directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClipLayout {
    pub name: String,
    pub root: PathBuf,
    pub images_dir: PathBuf,
    pub sparse_dir: PathBuf,
    /// `sparse/0`, the mapper's model.
    pub model_dir: PathBuf,
    pub database: PathBuf,
    pub transforms: PathBuf,
    pub point_cloud: PathBuf,
    pub undistort_dir: PathBuf,
    pub hip: PathBuf,
}

impl ClipLayout {
    pub fn new(output: &Path, name: &str) -> Self {
        let root = output.join(name);
        let sparse_dir = root.join("sparse");
        Self {
            name: name.to_string(),
            images_dir: root.join("images"),
            model_dir: sparse_dir.join("0"),
            sparse_dir,
            database: root.join("database.db"),
            transforms: root.join(TRANSFORMS_FILE),
            point_cloud: root.join(POINT_CLOUD_FILE),
            undistort_dir: root.join("undistort"),
            hip: root.join(format!("{name}.hip")),
            root,
        }
    }

    pub fn undistorted_transforms(&self) -> PathBuf {
        self.undistort_dir.join(UNDISTORTED_TRANSFORMS_FILE)
    }

    /// Frame pattern for one source video.
    pub fn frame_pattern(&self, source: &ClipSource, video: &Path) -> PathBuf {
        let dir = if source.is_directory {
            let stem = video
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.images_dir.join(stem)
        } else {
            self.images_dir.clone()
        };
        dir.join("frame_%06d.jpg")
    }

    fn frame_count(&self) -> Result<usize, AutotrackError> {
        if !self.images_dir.is_dir() {
            return Ok(0);
        }
        Ok(fsutil::list_files(&self.images_dir, IMAGE_EXTENSIONS, true)?.len())
    }
}

/// Runs a batch.
pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn ToolRunner,
    masks: &'a dyn MaskProvider,
    cancel: CancelFlag,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a PipelineConfig, runner: &'a dyn ToolRunner) -> Self {
        Self {
            config,
            runner,
            masks: &NoMasks,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_masks(mut self, masks: &'a dyn MaskProvider) -> Self {
        self.masks = masks;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check that every required tool can be started.
    pub fn preflight(&self) -> Result<(), AutotrackError> {
        for tool in self.config.required_tools() {
            self.runner.probe(tool)?;
        }
        Ok(())
    }

    /// Process every clip under the input directory.
    ///
    /// Configuration and preflight problems are returned as errors before
    /// any clip is touched; everything later ends up in the report.
    pub fn run(&self) -> Result<BatchReport, AutotrackError> {
        self.config.validate()?;
        self.preflight()?;
        let clips = discover_clips(&self.config.input)?;
        std::fs::create_dir_all(&self.config.output)?;

        let mut report = BatchReport::new(&self.config.input, &self.config.output);
        if clips.is_empty() {
            tracing::info!(input = %self.config.input.display(), "no clips found");
            return Ok(report);
        }
        tracing::info!(clips = clips.len(), "starting batch");

        let total = clips.len();
        for (idx, source) in clips.iter().enumerate() {
            if report.aborted.is_some() || self.cancel.is_cancelled() {
                report.not_started.push(source.name.clone());
                continue;
            }
            tracing::info!("[{}/{}] processing '{}'", idx + 1, total, source.name);
            let (outcome, abort) = self.process_clip(source);
            if let Some(reason) = abort {
                report.aborted = Some(reason);
            }
            report.push(outcome);
        }
        if self.cancel.is_cancelled() && report.aborted.is_none() {
            report.aborted = Some("cancelled by the user".to_string());
        }

        tracing::info!(
            done = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "batch finished"
        );
        Ok(report)
    }

    /// Run one clip to a terminal state. The second value is set when the
    /// error that stopped the clip should stop the whole run.
    pub fn process_clip(&self, source: &ClipSource) -> (ClipOutcome, Option<String>) {
        let layout = ClipLayout::new(&self.config.output, &source.name);
        if layout.root.exists() {
            if !self.config.overwrite {
                tracing::info!(clip = %source.name, "output exists; skipping");
                return (ClipOutcome::skipped(&source.name, layout.root), None);
            }
            tracing::info!(clip = %source.name, "removing previous output");
            if let Err(err) = std::fs::remove_dir_all(&layout.root) {
                let mut outcome = ClipOutcome::skipped(&source.name, layout.root.clone());
                outcome.status = ClipStatus::Failed;
                outcome.state = ClipState::Failed;
                outcome.failed_stage = Some(ClipState::FramesExtracted);
                outcome.error = Some(AutotrackError::Io(err).to_string());
                return (outcome, None);
            }
        }

        let started = Instant::now();
        let mut clip = ClipRun {
            orchestrator: self,
            source,
            layout,
            state: ClipState::Init,
            masks: None,
            model: None,
            conversion: None,
            issues: Vec::new(),
            frames: 0,
        };
        let result = clip.advance();
        let elapsed_secs = started.elapsed().as_secs_f64();

        let mut outcome = ClipOutcome {
            clip: source.name.clone(),
            output_dir: clip.layout.root.clone(),
            status: ClipStatus::Done,
            state: clip.state,
            failed_stage: None,
            error: None,
            diagnostic: None,
            issues: clip.issues,
            frames: clip.frames,
            elapsed_secs,
        };

        match result {
            Ok(()) => {
                tracing::info!(clip = %source.name, elapsed_secs, "clip done");
                (outcome, None)
            }
            Err((stage, err)) => {
                tracing::error!(
                    clip = %source.name,
                    stage = %stage,
                    error = %err,
                    "clip failed"
                );
                if let Some(diagnostic) = err.diagnostic() {
                    for line in diagnostic.lines() {
                        tracing::error!(clip = %source.name, "  | {line}");
                    }
                }
                outcome.status = ClipStatus::Failed;
                outcome.state = ClipState::Failed;
                outcome.failed_stage = Some(stage);
                outcome.error = Some(err.to_string());
                outcome.diagnostic = err.diagnostic().map(str::to_string);
                let abort = (err.scope() == ErrorScope::Run).then(|| err.to_string());
                (outcome, abort)
            }
        }
    }
}

/// Mutable state of one clip while its stages run.
struct ClipRun<'o, 'a> {
    orchestrator: &'o Orchestrator<'a>,
    source: &'o ClipSource,
    layout: ClipLayout,
    state: ClipState,
    masks: Option<MaskResolution>,
    model: Option<SparseModel>,
    conversion: Option<Conversion>,
    issues: Vec<ClipIssue>,
    frames: usize,
}

impl ClipRun<'_, '_> {
    fn config(&self) -> &PipelineConfig {
        self.orchestrator.config
    }

    fn advance(&mut self) -> Result<(), (ClipState, AutotrackError)> {
        while let Some(next) = self.state.next() {
            self.check_artifacts(next)
                .and_then(|()| self.enter(next))
                .map_err(|err| (next, err))?;
            self.state = next;
        }
        Ok(())
    }

    fn require(&self, stage: ClipState, path: &Path) -> Result<(), AutotrackError> {
        if path.exists() {
            Ok(())
        } else {
            Err(AutotrackError::MissingArtifact {
                stage,
                path: path.to_path_buf(),
            })
        }
    }

    /// Artifacts the predecessor of `stage` must have left.
    fn check_artifacts(&self, stage: ClipState) -> Result<(), AutotrackError> {
        let layout = &self.layout;
        match stage {
            ClipState::FramesExtracted => {
                for video in &self.source.videos {
                    self.require(stage, video)?;
                }
                Ok(())
            }
            ClipState::MasksResolved | ClipState::FeaturesExtracted => {
                if layout.frame_count()? == 0 {
                    return Err(AutotrackError::MissingArtifact {
                        stage,
                        path: layout.images_dir.clone(),
                    });
                }
                Ok(())
            }
            ClipState::Matched | ClipState::Mapped => self.require(stage, &layout.database),
            ClipState::ModelExported | ClipState::PointCloudConverted => {
                self.require(stage, &layout.model_dir)
            }
            ClipState::TransformsGenerated => self.require(stage, &layout.point_cloud),
            ClipState::Undistorted => {
                if self.config().skip_undistort {
                    return Ok(());
                }
                self.require(stage, &layout.transforms)
            }
            ClipState::SceneBuilt => {
                if self.config().skip_scene {
                    return Ok(());
                }
                self.require(stage, &layout.point_cloud)?;
                self.require(stage, &self.scene_transforms())
            }
            ClipState::Init | ClipState::Done | ClipState::Failed => Ok(()),
        }
    }

    /// Transforms handed to the scene export.
    fn scene_transforms(&self) -> PathBuf {
        if self.config().skip_undistort {
            self.layout.transforms.clone()
        } else {
            self.layout.undistorted_transforms()
        }
    }

    fn run_tool(&self, invocation: &runner::Invocation) -> Result<(), AutotrackError> {
        let output = self.orchestrator.runner.run(invocation)?;
        tracing::debug!(
            tool = %invocation.tool_name(),
            lines = output.lines,
            elapsed_secs = output.elapsed.as_secs_f64(),
            "tool finished"
        );
        Ok(())
    }

    fn enter(&mut self, stage: ClipState) -> Result<(), AutotrackError> {
        let clip = self.source.name.clone();
        match stage {
            ClipState::FramesExtracted => {
                tracing::info!(clip = %clip, "extracting frames");
                std::fs::create_dir_all(&self.layout.images_dir)?;
                std::fs::create_dir_all(&self.layout.sparse_dir)?;
                for video in &self.source.videos {
                    let pattern = self.layout.frame_pattern(self.source, video);
                    if let Some(dir) = pattern.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    let inv = self.config().ffmpeg_extract(video, &pattern);
                    self.run_tool(&inv)?;
                }
                self.frames = self.layout.frame_count()?;
                if self.frames == 0 {
                    return Err(AutotrackError::MissingArtifact {
                        stage,
                        path: self.layout.images_dir.clone(),
                    });
                }
                tracing::info!(clip = %clip, frames = self.frames, "frames extracted");
            }
            ClipState::MasksResolved => {
                let query = ClipMaskQuery {
                    clip_name: &self.source.name,
                    clip_parent: &self.source.parent,
                    images_dir: &self.layout.images_dir,
                };
                let resolution = self.orchestrator.masks.resolve(&query)?;
                if let Some(resolution) = &resolution {
                    if resolution.is_disabled() {
                        self.issues.push(ClipIssue::new(
                            ClipIssueCode::MaskNotFound,
                            "no mask directory found; masking disabled",
                        ));
                    } else if !resolution.missing.is_empty() {
                        self.issues.push(ClipIssue::new(
                            ClipIssueCode::FramesWithoutMask,
                            format!("{} frame(s) have no mask", resolution.missing.len()),
                        ));
                    }
                }
                self.masks = resolution;
            }
            ClipState::FeaturesExtracted => {
                tracing::info!(clip = %clip, "colmap feature_extractor");
                let mask_dir = self.masks.as_ref().and_then(|m| m.dir.as_deref());
                let inv = self.config().colmap_feature_extractor(
                    &self.layout.database,
                    &self.layout.images_dir,
                    mask_dir,
                );
                self.run_tool(&inv)?;
            }
            ClipState::Matched => {
                tracing::info!(clip = %clip, "colmap sequential_matcher");
                let inv = self
                    .config()
                    .colmap_sequential_matcher(&self.layout.database);
                self.run_tool(&inv)?;
            }
            ClipState::Mapped => {
                tracing::info!(clip = %clip, "glomap mapper");
                let inv = self.config().glomap_mapper(
                    &self.layout.database,
                    &self.layout.images_dir,
                    &self.layout.sparse_dir,
                );
                self.run_tool(&inv)?;
            }
            ClipState::ModelExported => {
                let model = model::read_model(&self.layout.model_dir)?;
                model::write_model_text(&self.layout.model_dir, &model)?;
                model::write_model_text(&self.layout.sparse_dir, &model)?;
                tracing::info!(
                    clip = %clip,
                    cameras = model.cameras.len(),
                    images = model.images.len(),
                    points = model.points.len(),
                    "exported text model"
                );
                self.model = Some(model);
            }
            ClipState::PointCloudConverted => {
                let model = match self.model.take() {
                    Some(model) => model,
                    None => model::read_model(&self.layout.model_dir)?,
                };
                let opts = ConvertOptions {
                    multi_camera: self.config().multi_camera,
                    images_dir: Some(self.layout.images_dir.clone()),
                    mask_paths: self
                        .masks
                        .as_ref()
                        .map(MaskResolution::path_map)
                        .unwrap_or_default(),
                    ..ConvertOptions::default()
                };
                let conversion = transforms::convert_model(&model, &self.layout.model_dir, &opts)?;
                if conversion.normalization.degenerate {
                    self.issues.push(ClipIssue::new(
                        ClipIssueCode::DegenerateNormalization,
                        "camera positions do not spread; scene was only recentred",
                    ));
                }
                model::io_ply::write_ply(&self.layout.point_cloud, &conversion.points)?;
                self.conversion = Some(conversion);
            }
            ClipState::TransformsGenerated => {
                let Some(conversion) = self.conversion.take() else {
                    return Err(AutotrackError::MissingArtifact {
                        stage,
                        path: self.layout.transforms.clone(),
                    });
                };
                transforms::write_transforms(&self.layout.transforms, &conversion.transforms)?;
                tracing::info!(
                    clip = %clip,
                    frames = conversion.transforms.frames.len(),
                    points = conversion.points.len(),
                    "wrote training poses"
                );
            }
            ClipState::Undistorted => {
                if self.config().skip_undistort {
                    tracing::info!(clip = %clip, "undistortion skipped");
                    return Ok(());
                }
                let opts = UndistortOptions {
                    json_path: self.layout.transforms.clone(),
                    output_dir: self.layout.undistort_dir.clone(),
                    masks_dir: self.masks.as_ref().and_then(|m| m.dir.clone()),
                };
                let summary = undistort::undistort_transforms(&opts)?;
                if !summary.skipped.is_empty() {
                    self.issues.push(ClipIssue::new(
                        ClipIssueCode::FramesSkipped,
                        format!(
                            "{} frame(s) missing on disk were not undistorted",
                            summary.skipped.len()
                        ),
                    ));
                }
            }
            ClipState::SceneBuilt => {
                if self.config().skip_scene {
                    tracing::info!(clip = %clip, "scene export skipped");
                    return Ok(());
                }
                let Some(script) = self.config().scene_script.as_deref() else {
                    return Err(AutotrackError::InvalidConfig(
                        "no scene script configured".to_string(),
                    ));
                };
                tracing::info!(clip = %clip, "building Houdini scene");
                let inv = self.config().hython_scene(
                    script,
                    &self.scene_transforms(),
                    &self.layout.point_cloud,
                    &self.layout.hip,
                );
                self.run_tool(&inv)?;
            }
            ClipState::Init | ClipState::Done | ClipState::Failed => {}
        }
        Ok(())
    }
}
