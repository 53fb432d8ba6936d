//! Small filesystem helpers shared by the mask resolver, the restorer and
//! clip discovery.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::AutotrackError;

/// Extensions recognised as frame images.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "tif", "tiff", "bmp", "exr", "hdr",
];

/// Extensions recognised as source videos.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "mxf", "m4v", "webm"];

pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };

    allowed
        .iter()
        .any(|allowed_ext| ext.eq_ignore_ascii_case(allowed_ext))
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Files under `root` with one of `extensions`, sorted by path.
///
/// Hidden files and directories are skipped. With `recursive == false` only
/// the direct children of `root` are listed.
pub fn list_files(
    root: &Path,
    extensions: &[&str],
    recursive: bool,
) -> Result<Vec<PathBuf>, AutotrackError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// `path` relative to `root`, `/`-separated.
pub fn rel_string(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}
