//! Mask discovery and normalization.
//!
//! A clip `X` living in directory `D` may have masks in `D/mask/X_mask/`,
//! `D/X_mask/` or `<root>/X_mask/` (first existing wins). Inside that
//! directory the mask for frame `rel/frame_NNNNNN.ext` must be named
//! `rel/frame_NNNNNN.ext.png`, which is what the feature extractor expects.
//! Masks stored under the legacy names `rel/frame_NNNNNN.png` or
//! `rel/frame_NNNNNN.ext` are renamed in place.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AutotrackError;
use crate::fsutil::{self, IMAGE_EXTENSIONS};

/// A resolved mask for one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskRecord {
    /// Frame name relative to the images directory, `/`-separated.
    pub frame: String,
    pub path: PathBuf,
    /// First path component of the frame name (the camera sub-folder), if any.
    pub camera_group: Option<String>,
}

/// Outcome of resolving masks for one clip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaskResolution {
    /// The mask directory in use; `None` when masking is disabled.
    pub dir: Option<PathBuf>,
    pub records: Vec<MaskRecord>,
    /// Number of legacy-named masks renamed during this pass.
    pub renamed: usize,
    /// Frames without a mask.
    pub missing: Vec<String>,
}

impl MaskResolution {
    /// Whether a mask directory was configured but could not be found.
    pub fn is_disabled(&self) -> bool {
        self.dir.is_none()
    }

    /// Mask path per frame name.
    pub fn path_map(&self) -> std::collections::BTreeMap<String, String> {
        self.records
            .iter()
            .map(|r| (r.frame.clone(), r.path.to_string_lossy().replace('\\', "/")))
            .collect()
    }
}

/// Where a clip comes from, as far as mask lookup is concerned.
#[derive(Clone, Debug)]
pub struct ClipMaskQuery<'a> {
    /// Clip name (`X`): the video stem or source directory name.
    pub clip_name: &'a str,
    /// Directory containing the clip (`D`).
    pub clip_parent: &'a Path,
    /// Extracted frames of the clip.
    pub images_dir: &'a Path,
}

/// Masking capability.
pub trait MaskProvider {
    /// Locate and normalize the masks for one clip.
    fn resolve(&self, query: &ClipMaskQuery<'_>) -> Result<Option<MaskResolution>, AutotrackError>;
}

/// Masking disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMasks;

impl MaskProvider for NoMasks {
    fn resolve(
        &self,
        _query: &ClipMaskQuery<'_>,
    ) -> Result<Option<MaskResolution>, AutotrackError> {
        Ok(None)
    }
}

/// Masks stored next to the footage (or under an explicit root).
#[derive(Clone, Debug, Default)]
pub struct DirectoryMasks {
    pub root: Option<PathBuf>,
}

impl DirectoryMasks {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    /// Candidate mask directories in lookup order.
    pub fn candidates(&self, clip_name: &str, clip_parent: &Path) -> Vec<PathBuf> {
        let dir_name = format!("{clip_name}_mask");
        let mut out = vec![
            clip_parent.join("mask").join(&dir_name),
            clip_parent.join(&dir_name),
        ];
        if let Some(root) = &self.root {
            out.push(root.join(&dir_name));
        }
        out
    }
}

impl MaskProvider for DirectoryMasks {
    fn resolve(&self, query: &ClipMaskQuery<'_>) -> Result<Option<MaskResolution>, AutotrackError> {
        let found = self
            .candidates(query.clip_name, query.clip_parent)
            .into_iter()
            .find(|dir| dir.is_dir());

        let Some(dir) = found else {
            tracing::warn!(clip = query.clip_name, "no mask directory found; masking disabled");
            return Ok(Some(MaskResolution::default()));
        };

        let resolution = normalize_mask_dir(&dir, query.images_dir)?;
        Ok(Some(resolution))
    }
}

/// Expected mask path for a frame: `<mask_dir>/<frame>.png`.
pub fn expected_mask_path(mask_dir: &Path, frame: &str) -> PathBuf {
    mask_dir.join(format!("{frame}.png"))
}

fn legacy_mask_paths(mask_dir: &Path, frame: &str) -> Vec<PathBuf> {
    let own_name = mask_dir.join(frame);
    let png_name = own_name.with_extension("png");
    if png_name == own_name {
        vec![own_name]
    } else {
        vec![png_name, own_name]
    }
}

/// Match every frame under `images_dir` to a mask in `mask_dir`, renaming
/// legacy names to the expected one.
///
/// Renaming only happens when the expected name is absent, so running this
/// twice renames nothing the second time.
pub fn normalize_mask_dir(
    mask_dir: &Path,
    images_dir: &Path,
) -> Result<MaskResolution, AutotrackError> {
    let frames = fsutil::list_files(images_dir, IMAGE_EXTENSIONS, true)?;
    let mut resolution = MaskResolution {
        dir: Some(mask_dir.to_path_buf()),
        ..MaskResolution::default()
    };

    for frame_path in frames {
        let frame = fsutil::rel_string(images_dir, &frame_path);
        let expected = expected_mask_path(mask_dir, &frame);

        if !expected.is_file() {
            let legacy = legacy_mask_paths(mask_dir, &frame)
                .into_iter()
                .find(|candidate| candidate.is_file());
            match legacy {
                Some(legacy) => {
                    tracing::debug!(
                        from = %legacy.display(),
                        to = %expected.display(),
                        "renaming mask"
                    );
                    fs::rename(&legacy, &expected)?;
                    resolution.renamed += 1;
                }
                None => {
                    resolution.missing.push(frame);
                    continue;
                }
            }
        }

        let camera_group = frame
            .split_once('/')
            .map(|(group, _)| group.to_string());
        resolution.records.push(MaskRecord {
            frame,
            path: expected,
            camera_group,
        });
    }

    if !resolution.missing.is_empty() {
        tracing::warn!(
            dir = %mask_dir.display(),
            missing = resolution.missing.len(),
            "frames without a mask"
        );
    }
    tracing::info!(
        dir = %mask_dir.display(),
        masks = resolution.records.len(),
        renamed = resolution.renamed,
        "resolved masks"
    );
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"m").unwrap();
    }

    #[test]
    fn candidates_follow_lookup_order() {
        let masks = DirectoryMasks::new(Some(PathBuf::from("/masks")));
        let c = masks.candidates("shot01", Path::new("/footage"));
        assert_eq!(
            c,
            vec![
                PathBuf::from("/footage/mask/shot01_mask"),
                PathBuf::from("/footage/shot01_mask"),
                PathBuf::from("/masks/shot01_mask"),
            ]
        );
    }

    #[test]
    fn legacy_names_are_renamed_and_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let masks = dir.path().join("shot_mask");
        touch(&images.join("cam_a/frame_000001.jpg"));
        touch(&images.join("cam_a/frame_000002.jpg"));
        touch(&images.join("cam_b/frame_000001.jpg"));
        touch(&masks.join("cam_a/frame_000001.png"));
        touch(&masks.join("cam_a/frame_000002.jpg"));
        touch(&masks.join("cam_b/frame_000001.jpg.png"));

        let res = normalize_mask_dir(&masks, &images).unwrap();
        assert_eq!(res.renamed, 2);
        assert_eq!(res.records.len(), 3);
        assert!(res.missing.is_empty());
        assert!(masks.join("cam_a/frame_000001.jpg.png").is_file());
        assert!(!masks.join("cam_a/frame_000001.png").exists());
        assert_eq!(res.records[2].camera_group.as_deref(), Some("cam_b"));
    }

    #[test]
    fn frames_without_masks_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let masks = dir.path().join("m");
        touch(&images.join("frame_000001.jpg"));
        fs::create_dir_all(&masks).unwrap();

        let res = normalize_mask_dir(&masks, &images).unwrap();
        assert_eq!(res.missing, vec!["frame_000001.jpg".to_string()]);
        assert!(res.records.is_empty());
    }

    #[test]
    fn missing_directory_disables_masking() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryMasks::default();
        let query = ClipMaskQuery {
            clip_name: "shot",
            clip_parent: dir.path(),
            images_dir: dir.path(),
        };
        let res = provider.resolve(&query).unwrap().unwrap();
        assert!(res.is_disabled());
        assert!(NoMasks.resolve(&query).unwrap().is_none());
    }
}
