//! Autotrack: batch camera tracking for footage.
//!
//! Autotrack drives ffmpeg, COLMAP, GLOMAP and Houdini's `hython` over a
//! folder of clips and turns each reconstruction into nerfstudio-style
//! training poses, a point cloud and undistorted plates.
//!
//! # Modules
//!
//! - [`model`]: COLMAP sparse models (binary and text) and PLY point clouds
//! - [`geometry`]: pose conversion and scene normalization
//! - [`transforms`]: sparse model → `transforms.json`
//! - [`masks`]: mask lookup and renaming
//! - [`undistort`]: per-camera remapping of frames and masks
//! - [`restore`]: apply or remove lens distortion from a calibration record
//! - [`pipeline`]: the per-clip state machine and tool runner
//! - [`error`]: Error types for autotrack operations

pub mod error;
pub mod fsutil;
pub mod geometry;
pub mod logging;
pub mod masks;
pub mod model;
pub mod pipeline;
pub mod restore;
pub mod transforms;
pub mod undistort;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

pub use error::AutotrackError;

/// The autotrack CLI application.
#[derive(Parser)]
#[command(name = "autotrack")]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Less log output (-q warnings only, -qq errors only).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Track every clip in a folder: frames, reconstruction, poses, plates, scene.
    Run(RunArgs),
    /// Convert a sparse model into transforms.json and points3D.ply.
    Convert(ConvertArgs),
    /// Undistort the frames and masks listed in a transforms file.
    Undistort(UndistortArgs),
    /// Apply (or remove) a calibration's lens distortion on images.
    Restore(RestoreArgs),
    /// Write a sparse model in COLMAP's text encoding.
    ExportText(ExportTextArgs),
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ColorSpaceArg {
    #[default]
    None,
    Acescg,
}

impl From<ColorSpaceArg> for pipeline::ColorSpace {
    fn from(value: ColorSpaceArg) -> Self {
        match value {
            ColorSpaceArg::None => pipeline::ColorSpace::None,
            ColorSpaceArg::Acescg => pipeline::ColorSpace::AcesCg,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// Arguments for the run subcommand.
#[derive(clap::Args)]
struct RunArgs {
    /// Folder with the input clips (videos, or one folder of videos per clip).
    input: PathBuf,

    /// Folder receiving one sub-folder per clip.
    output: PathBuf,

    /// Frame scale factor applied during extraction.
    #[arg(long, default_value_t = 0.5)]
    scale: f64,

    /// One camera per source folder instead of one shared camera.
    #[arg(long)]
    multi_cams: bool,

    /// Do not build the Houdini scene.
    #[arg(long)]
    skip_scene: bool,

    /// Do not undistort frames.
    #[arg(long)]
    skip_undistort: bool,

    /// Houdini installation; hython is taken from its bin folder.
    #[arg(long, env = "HFS")]
    hfs: Option<PathBuf>,

    /// Explicit path to hython (overrides --hfs).
    #[arg(long, env = "AUTOTRACK_SCENE_TOOL")]
    scene_tool: Option<PathBuf>,

    /// Houdini script called as `hython <script> <json> <ply> <hip>`.
    #[arg(long, env = "AUTOTRACK_SCENE_SCRIPT")]
    scene_script: Option<PathBuf>,

    /// Colour conversion applied to extracted frames.
    #[arg(long, value_enum, default_value_t = ColorSpaceArg::None)]
    color_space: ColorSpaceArg,

    /// .cube LUT applied to extracted frames.
    #[arg(long)]
    lut: Option<PathBuf>,

    /// Extra root searched for `<clip>_mask` folders.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Disable mask lookup entirely.
    #[arg(long, conflicts_with = "mask")]
    no_masks: bool,

    /// Sequential matching overlap.
    #[arg(long, default_value_t = 12)]
    overlap: u32,

    /// Kill a tool that runs longer than this many seconds.
    #[arg(long, env = "AUTOTRACK_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Reprocess clips whose output folder already exists.
    #[arg(long)]
    overwrite: bool,

    /// Run SIFT extraction on the CPU.
    #[arg(long)]
    no_gpu: bool,

    #[arg(long, env = "AUTOTRACK_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long, env = "AUTOTRACK_COLMAP", default_value = "colmap")]
    colmap: PathBuf,

    #[arg(long, env = "AUTOTRACK_GLOMAP", default_value = "glomap")]
    glomap: PathBuf,

    /// Format of the final batch report.
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,
}

impl RunArgs {
    fn to_config(&self) -> pipeline::PipelineConfig {
        let mut cfg = pipeline::PipelineConfig::new(&self.input, &self.output);
        cfg.scale = self.scale;
        cfg.multi_camera = self.multi_cams;
        cfg.skip_scene = self.skip_scene;
        cfg.skip_undistort = self.skip_undistort;
        cfg.scene_script = self.scene_script.clone();
        cfg.color_space = self.color_space.into();
        cfg.lut = self.lut.clone();
        cfg.mask_root = self.mask.clone();
        cfg.overlap = self.overlap;
        cfg.use_gpu = !self.no_gpu;
        cfg.timeout = self.timeout_secs.map(Duration::from_secs);
        cfg.overwrite = self.overwrite;
        cfg.tools = pipeline::ToolPaths {
            ffmpeg: self.ffmpeg.clone(),
            colmap: self.colmap.clone(),
            glomap: self.glomap.clone(),
            hython: self
                .scene_tool
                .clone()
                .unwrap_or_else(|| pipeline::resolve_hython(self.hfs.as_deref())),
        };
        cfg
    }
}

/// Arguments for the convert subcommand.
#[derive(clap::Args)]
struct ConvertArgs {
    /// Model folder (cameras/images/points3D as .bin or .txt).
    sparse_dir: PathBuf,

    /// Folder receiving transforms.json and points3D.ply.
    out_dir: PathBuf,

    /// Folder with the registered images; enables resolution checks.
    #[arg(long)]
    images: Option<PathBuf>,

    /// One intrinsics block per camera.
    #[arg(long)]
    multi_cams: bool,

    /// Mask folder laid out like the images folder (`<frame>.png`).
    #[arg(long)]
    masks: Option<PathBuf>,
}

/// Arguments for the undistort subcommand.
#[derive(clap::Args)]
struct UndistortArgs {
    #[arg(long)]
    json_path: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    /// Mask folder laid out like the images folder (`<frame>.png`).
    #[arg(long)]
    masks: Option<PathBuf>,
}

/// Arguments for the restore subcommand.
#[derive(clap::Args)]
struct RestoreArgs {
    /// Calibration record (transforms.json).
    #[arg(long)]
    json_path: PathBuf,

    #[arg(long, default_value = "restored_output")]
    output_dir: PathBuf,

    /// Process the images in this folder instead of the record's frames.
    #[arg(long)]
    image_dir: Option<PathBuf>,

    /// Process the .exr files of the image folder.
    #[arg(long)]
    exr: bool,

    /// Remove distortion instead of applying it.
    #[arg(long)]
    undistort: bool,

    /// Camera block to use when the record has several.
    #[arg(long)]
    camera_id: Option<u32>,

    /// Explicit images to process.
    inputs: Vec<PathBuf>,
}

/// Arguments for the export-text subcommand.
#[derive(clap::Args)]
struct ExportTextArgs {
    model_dir: PathBuf,
    out_dir: PathBuf,
}

/// Run the autotrack CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), AutotrackError> {
    let cli = Cli::parse();
    let verbosity = i8::try_from(cli.verbose).unwrap_or(i8::MAX)
        - i8::try_from(cli.quiet).unwrap_or(i8::MAX);
    let verbosity = verbosity.clamp(-2, 2);

    match cli.command {
        Some(Commands::Run(args)) => run_batch(args, verbosity),
        Some(Commands::Convert(args)) => {
            logging::init(verbosity, None)?;
            run_convert(args)
        }
        Some(Commands::Undistort(args)) => {
            logging::init(verbosity, None)?;
            run_undistort(args)
        }
        Some(Commands::Restore(args)) => {
            logging::init(verbosity, None)?;
            run_restore(args)
        }
        Some(Commands::ExportText(args)) => {
            logging::init(verbosity, None)?;
            run_export_text(args)
        }
        None => {
            println!("autotrack {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Batch camera tracking for footage.");
            println!();
            println!("Run 'autotrack --help' for usage information.");
            Ok(())
        }
    }
}

/// Execute the run subcommand.
fn run_batch(args: RunArgs, verbosity: i8) -> Result<(), AutotrackError> {
    let config = args.to_config();
    // Validate before creating the output folder for the log file.
    config.validate()?;
    std::fs::create_dir_all(&config.output)?;
    logging::init(verbosity, Some(&config.output.join(pipeline::LOG_FILE)))?;

    let cancel = pipeline::CancelFlag::new();
    if let Err(err) = cancel.install_ctrlc() {
        tracing::warn!(error = %err, "could not install the Ctrl-C handler");
    }
    let runner = pipeline::ProcessRunner::new(config.timeout, cancel.clone());
    let directory_masks = masks::DirectoryMasks::new(config.mask_root.clone());
    let mut orchestrator = pipeline::Orchestrator::new(&config, &runner).with_cancel(cancel);
    if !args.no_masks {
        orchestrator = orchestrator.with_masks(&directory_masks);
    }

    let report = orchestrator.run()?;
    match args.report {
        ReportFormat::Json => {
            let json = serde_json::to_string_pretty(&report).map_err(|source| {
                AutotrackError::JsonWrite {
                    path: PathBuf::from("<stdout>"),
                    source,
                }
            })?;
            println!("{json}");
        }
        ReportFormat::Text => print!("{report}"),
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(AutotrackError::BatchFailed {
            failed: report.failed() + report.not_started.len(),
            total: report.total(),
        })
    }
}

/// Execute the convert subcommand.
fn run_convert(args: ConvertArgs) -> Result<(), AutotrackError> {
    let model = model::read_model(&args.sparse_dir)?;
    let mask_paths = match &args.masks {
        Some(mask_dir) => mask_paths_for(&model, mask_dir, args.images.as_deref())?,
        None => Default::default(),
    };
    let opts = transforms::ConvertOptions {
        multi_camera: args.multi_cams,
        images_dir: args.images.clone(),
        mask_paths,
        ..transforms::ConvertOptions::default()
    };
    let conversion = transforms::convert_model(&model, &args.sparse_dir, &opts)?;
    transforms::write_conversion(&args.out_dir, &conversion)?;

    println!(
        "Wrote {} frame(s), {} camera block(s), {} point(s) to {}",
        conversion.transforms.frames.len(),
        conversion.transforms.cameras.len().max(1),
        conversion.points.len(),
        args.out_dir.display()
    );
    Ok(())
}

/// Mask path per image name. With an images folder, legacy mask names are
/// normalized first.
fn mask_paths_for(
    model: &model::SparseModel,
    mask_dir: &Path,
    images: Option<&Path>,
) -> Result<std::collections::BTreeMap<String, String>, AutotrackError> {
    if let Some(images) = images {
        return Ok(masks::normalize_mask_dir(mask_dir, images)?.path_map());
    }
    Ok(model
        .images
        .values()
        .filter_map(|image| {
            let path = masks::expected_mask_path(mask_dir, &image.name);
            path.is_file()
                .then(|| (image.name.clone(), path.to_string_lossy().replace('\\', "/")))
        })
        .collect())
}

/// Execute the undistort subcommand.
fn run_undistort(args: UndistortArgs) -> Result<(), AutotrackError> {
    let summary = undistort::undistort_transforms(&undistort::UndistortOptions {
        json_path: args.json_path,
        output_dir: args.output_dir,
        masks_dir: args.masks,
    })?;
    println!(
        "Undistorted {} frame(s) ({} mask(s), {} skipped) into {}",
        summary.written,
        summary.masks_written,
        summary.skipped.len(),
        summary.output_json.display()
    );
    Ok(())
}

/// Execute the restore subcommand.
fn run_restore(args: RestoreArgs) -> Result<(), AutotrackError> {
    let summary = restore::restore(&restore::RestoreOptions {
        json_path: args.json_path,
        output_dir: args.output_dir.clone(),
        image_dir: args.image_dir,
        exr: args.exr,
        inputs: args.inputs,
        direction: if args.undistort {
            restore::RestoreDirection::Undistort
        } else {
            restore::RestoreDirection::Distort
        },
        camera_id: args.camera_id.map(model::CameraId::new),
    })?;
    println!(
        "Restored {} image(s) ({} skipped) into {}",
        summary.written.len(),
        summary.skipped.len(),
        args.output_dir.display()
    );
    Ok(())
}

/// Execute the export-text subcommand.
fn run_export_text(args: ExportTextArgs) -> Result<(), AutotrackError> {
    let model = model::read_model(&args.model_dir)?;
    model::write_model_text(&args.out_dir, &model)?;
    println!(
        "Exported {} camera(s), {} image(s), {} point(s) to {}",
        model.cameras.len(),
        model.images.len(),
        model.points.len(),
        args.out_dir.display()
    );
    Ok(())
}
