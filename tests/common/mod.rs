#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use autotrack::model::{
    self, CameraId, CameraModel, CameraModelKind, ImageId, Observation, Point3D, PointId,
    ReconstructedImage, SparseModel, TrackElement,
};
use autotrack::pipeline::{Invocation, ToolOutput, ToolRunner};
use autotrack::AutotrackError;

/// Builds small, internally consistent sparse models.
#[derive(Default)]
pub struct ModelBuilder {
    model: SparseModel,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn camera(
        mut self,
        id: u32,
        kind: CameraModelKind,
        width: u64,
        height: u64,
        params: &[f64],
    ) -> Self {
        self.model.cameras.insert(
            CameraId::new(id),
            CameraModel {
                id: CameraId::new(id),
                kind,
                width,
                height,
                params: params.to_vec(),
            },
        );
        self
    }

    /// Image looking down +z from `position`, with identity rotation.
    pub fn image(mut self, id: u32, camera_id: u32, name: &str, position: [f64; 3]) -> Self {
        self.model.images.insert(
            ImageId::new(id),
            ReconstructedImage {
                id: ImageId::new(id),
                camera_id: CameraId::new(camera_id),
                qvec: [1.0, 0.0, 0.0, 0.0],
                tvec: [-position[0], -position[1], -position[2]],
                name: name.to_string(),
                observations: Vec::new(),
            },
        );
        self
    }

    /// Point observed by `images`; an observation is appended to each.
    pub fn point(mut self, id: u64, xyz: [f64; 3], images: &[u32]) -> Self {
        let mut track = Vec::new();
        for image_id in images {
            let image = self
                .model
                .images
                .get_mut(&ImageId::new(*image_id))
                .expect("point observed by unknown image");
            track.push(TrackElement {
                image_id: image.id,
                point2d_idx: image.observations.len() as u32,
            });
            image.observations.push(Observation {
                xy: [1.5, 2.5],
                point3d_id: Some(PointId::new(id)),
            });
        }
        self.model.points.insert(
            PointId::new(id),
            Point3D {
                id: PointId::new(id),
                xyz,
                rgb: [(id * 20) as u8, 100, 200],
                error: 0.5,
                track,
            },
        );
        self
    }

    pub fn build(self) -> SparseModel {
        self.model
    }
}

/// Two cameras in sub-folders `cam_a` (3 frames) and `cam_b` (2 frames),
/// ten points each seen by two images.
pub fn two_camera_model() -> SparseModel {
    let mut builder = ModelBuilder::new()
        .camera(1, CameraModelKind::Pinhole, 32, 24, &[30.0, 30.0, 16.0, 12.0])
        .camera(
            2,
            CameraModelKind::SimpleRadial,
            40,
            30,
            &[35.0, 20.0, 15.0, -0.05],
        );
    let frames = [
        (1, 1, "cam_a/frame_000001.jpg", [0.0, 0.0, 0.0]),
        (2, 1, "cam_a/frame_000002.jpg", [1.0, 0.0, 0.0]),
        (3, 1, "cam_a/frame_000003.jpg", [2.0, 0.5, 0.0]),
        (4, 2, "cam_b/frame_000001.jpg", [0.0, 2.0, 0.5]),
        (5, 2, "cam_b/frame_000002.jpg", [1.0, 2.0, 1.0]),
    ];
    for (id, cam, name, position) in frames {
        builder = builder.image(id, cam, name, position);
    }
    for p in 0..10u64 {
        let a = (p % 5) as u32 + 1;
        let b = ((p + 2) % 5) as u32 + 1;
        builder = builder.point(p + 1, [p as f64 * 0.3, 1.0, 6.0 + p as f64 * 0.1], &[a, b]);
    }
    builder.build()
}

/// Single camera, `frames` images named `frame_NNNNNN.jpg`.
pub fn single_camera_model(frames: u32) -> SparseModel {
    let mut builder = ModelBuilder::new().camera(
        1,
        CameraModelKind::SimpleRadial,
        32,
        24,
        &[28.0, 16.0, 12.0, -0.08],
    );
    for i in 1..=frames {
        builder = builder.image(
            i,
            1,
            &format!("frame_{i:06}.jpg"),
            [i as f64, (i % 2) as f64, 0.0],
        );
    }
    for p in 0..4u64 {
        let a = (p as u32 % frames) + 1;
        builder = builder.point(p + 1, [p as f64, 0.0, 5.0], &[a]);
    }
    builder.build()
}

/// Write a gradient image of each camera's resolution for every image of
/// the model, under `images_dir`. Images of unknown cameras are skipped.
pub fn write_frames(images_dir: &Path, model: &SparseModel) {
    for image in model.images.values() {
        let Some(camera) = model.cameras.get(&image.camera_id) else {
            continue;
        };
        let path = images_dir.join(&image.name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = image::RgbImage::from_fn(camera.width as u32, camera.height as u32, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, 128])
        });
        img.save(&path).unwrap();
    }
}

/// Stand-in for ffmpeg, colmap, glomap and hython.
///
/// Each tool produces the artifacts the real one would: frames for the
/// clip's model, a database file, the clip's sparse model and the scene
/// file. Models are looked up by clip name.
#[derive(Default)]
pub struct FakeRunner {
    pub models: BTreeMap<String, SparseModel>,
    /// Tool names reported as unreachable by `probe`.
    pub missing: BTreeSet<String>,
    /// `(clip, subcommand)` pairs that exit nonzero, e.g. `("b", "mapper")`.
    pub failures: BTreeSet<(String, String)>,
    pub calls: RefCell<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn with_model(mut self, clip: &str, model: SparseModel) -> Self {
        self.models.insert(clip.to_string(), model);
        self
    }

    pub fn fail(mut self, clip: &str, subcommand: &str) -> Self {
        self.failures
            .insert((clip.to_string(), subcommand.to_string()));
        self
    }

    pub fn calls_to(&self, subcommand: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|inv| subcommand_of(inv) == subcommand)
            .count()
    }
}

fn subcommand_of(inv: &Invocation) -> String {
    match inv.tool_name().as_str() {
        "colmap" | "glomap" => inv
            .args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Clip output folder for a path somewhere inside it.
fn clip_root_of(path: &Path) -> PathBuf {
    let images = path
        .ancestors()
        .find(|p| p.file_name().is_some_and(|n| n == "images" || n == "sparse"))
        .unwrap_or(path);
    images.parent().unwrap_or(images).to_path_buf()
}

fn clip_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl ToolRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, AutotrackError> {
        self.calls.borrow_mut().push(invocation.clone());
        let subcommand = subcommand_of(invocation);

        let root = match subcommand.as_str() {
            "ffmpeg" => clip_root_of(Path::new(invocation.args.last().unwrap())),
            "feature_extractor" | "mapper" => {
                clip_root_of(Path::new(invocation.flag_value("--image_path").unwrap()))
            }
            "sequential_matcher" => Path::new(invocation.flag_value("--database_path").unwrap())
                .parent()
                .unwrap()
                .to_path_buf(),
            _ => Path::new(invocation.args.last().unwrap())
                .parent()
                .unwrap()
                .to_path_buf(),
        };
        let clip = clip_name(&root);

        if self.failures.contains(&(clip.clone(), subcommand.clone())) {
            return Err(AutotrackError::CollaboratorExit {
                program: invocation.tool_name(),
                status: "exit status: 1".to_string(),
                diagnostic: format!("{subcommand} failed for {clip}"),
            });
        }

        match subcommand.as_str() {
            "ffmpeg" => {
                if let Some(model) = self.models.get(&clip) {
                    write_frames(&root.join("images"), model);
                }
            }
            "feature_extractor" => {
                let db = invocation.flag_value("--database_path").unwrap();
                fs::write(db, b"db").unwrap();
            }
            "mapper" => {
                if let Some(model) = self.models.get(&clip) {
                    let out = Path::new(invocation.flag_value("--output_path").unwrap());
                    model::write_model_bin(&out.join("0"), model)?;
                }
            }
            "hython" => {
                fs::write(invocation.args.last().unwrap(), b"hip").unwrap();
            }
            _ => {}
        }

        Ok(ToolOutput::default())
    }

    fn probe(&self, program: &Path) -> Result<(), AutotrackError> {
        let name = program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.missing.contains(&name) {
            return Err(AutotrackError::MissingCollaborator {
                program: name,
                hint: "not found on PATH".to_string(),
            });
        }
        Ok(())
    }
}
