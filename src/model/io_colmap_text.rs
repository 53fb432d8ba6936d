//! COLMAP text model reader and writer (`cameras.txt`, `images.txt`,
//! `points3D.txt`).
//!
//! Lines starting with `#` are comments. The header comments COLMAP writes
//! (`# Number of cameras: N`, `# Number of images: N, ...`,
//! `# Number of points: N, ...`) are checked against the records actually
//! read when present. `images.txt` holds two lines per image; the second
//! (the 2-D observations) may be empty.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::ids::{CameraId, ImageId, PointId};
use super::types::{
    CameraModel, CameraModelKind, Observation, Point3D, ReconstructedImage, SparseModel,
    TrackElement,
};
use crate::error::AutotrackError;

/// Read `cameras.txt`.
pub fn read_cameras_txt(path: &Path) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    let text = fs::read_to_string(path)?;
    parse_cameras(&text, path)
}

/// Read `images.txt`.
pub fn read_images_txt(
    path: &Path,
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    let text = fs::read_to_string(path)?;
    parse_images(&text, path)
}

/// Read `points3D.txt`.
pub fn read_points3d_txt(path: &Path) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    let text = fs::read_to_string(path)?;
    parse_points3d(&text, path)
}

/// Parse `cameras.txt` content from a string.
pub fn from_cameras_txt_str(
    text: &str,
) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    parse_cameras(text, Path::new("<memory>/cameras.txt"))
}

/// Parse `images.txt` content from a string.
pub fn from_images_txt_str(
    text: &str,
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    parse_images(text, Path::new("<memory>/images.txt"))
}

/// Parse `points3D.txt` content from a string.
pub fn from_points3d_txt_str(text: &str) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    parse_points3d(text, Path::new("<memory>/points3D.txt"))
}

fn parse_cameras(
    text: &str,
    path: &Path,
) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    let mut declared = None;
    let mut cameras = BTreeMap::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(count) = header_count(comment, "Number of cameras:") {
                declared = Some(parse_field::<usize>(count, "camera count", path, line_no)?);
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(line_error(
                path,
                line_no,
                format!("expected at least 4 fields, got {}", parts.len()),
            ));
        }
        let id = CameraId::new(parse_field(parts[0], "camera id", path, line_no)?);
        let kind = CameraModelKind::from_name(parts[1]).ok_or_else(|| {
            line_error(path, line_no, format!("unknown camera model '{}'", parts[1]))
        })?;
        let width = parse_field(parts[2], "width", path, line_no)?;
        let height = parse_field(parts[3], "height", path, line_no)?;
        let params = parts[4..]
            .iter()
            .map(|p| parse_field::<f64>(p, "camera parameter", path, line_no))
            .collect::<Result<Vec<_>, _>>()?;
        if params.len() != kind.num_params() {
            return Err(line_error(
                path,
                line_no,
                format!(
                    "{kind} expects {} parameter(s), got {}",
                    kind.num_params(),
                    params.len()
                ),
            ));
        }

        let camera = CameraModel {
            id,
            kind,
            width,
            height,
            params,
        };
        if cameras.insert(id, camera).is_some() {
            return Err(line_error(path, line_no, format!("duplicate camera id {id}")));
        }
    }

    check_declared(declared, cameras.len(), "camera", path)?;
    Ok(cameras)
}

fn parse_images(
    text: &str,
    path: &Path,
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    let mut declared = None;
    let mut images = BTreeMap::new();
    let mut lines = text.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let line_no = idx + 1;
        let line = line.trim();
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(count) = header_count(comment, "Number of images:") {
                declared = Some(parse_field::<usize>(count, "image count", path, line_no)?);
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        // NAME is the rest of the line and may itself contain spaces.
        let Some((parts, name)) = split_leading_fields::<9>(line).filter(|(_, n)| !n.is_empty())
        else {
            return Err(line_error(
                path,
                line_no,
                format!(
                    "expected at least 10 fields, got {}",
                    line.split_whitespace().count()
                ),
            ));
        };
        let id = ImageId::new(parse_field(parts[0], "image id", path, line_no)?);
        let mut pose = [0.0f64; 7];
        for (slot, part) in pose.iter_mut().zip(&parts[1..8]) {
            *slot = parse_field(part, "pose component", path, line_no)?;
        }
        let camera_id = CameraId::new(parse_field(parts[8], "camera id", path, line_no)?);
        let name = name.to_string();

        // The observation line directly follows; a missing final line counts as empty.
        let (obs_line_no, obs_line) = match lines.next() {
            Some((idx, l)) => (idx + 1, l),
            None => (line_no + 1, ""),
        };
        let observations = parse_observations(obs_line, path, obs_line_no)?;

        let image = ReconstructedImage {
            id,
            camera_id,
            qvec: [pose[0], pose[1], pose[2], pose[3]],
            tvec: [pose[4], pose[5], pose[6]],
            name,
            observations,
        };
        if images.insert(id, image).is_some() {
            return Err(line_error(path, line_no, format!("duplicate image id {id}")));
        }
    }

    check_declared(declared, images.len(), "image", path)?;
    Ok(images)
}

fn parse_observations(
    line: &str,
    path: &Path,
    line_no: usize,
) -> Result<Vec<Observation>, AutotrackError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() % 3 != 0 {
        return Err(line_error(
            path,
            line_no,
            format!(
                "observation fields must come in (X, Y, POINT3D_ID) triples, got {}",
                parts.len()
            ),
        ));
    }
    parts
        .chunks_exact(3)
        .map(|triple| {
            let x = parse_field(triple[0], "observation x", path, line_no)?;
            let y = parse_field(triple[1], "observation y", path, line_no)?;
            let raw: i64 = parse_field(triple[2], "point id", path, line_no)?;
            Ok(Observation {
                xy: [x, y],
                point3d_id: u64::try_from(raw).ok().map(PointId::new),
            })
        })
        .collect()
}

fn parse_points3d(
    text: &str,
    path: &Path,
) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    let mut declared = None;
    let mut points = BTreeMap::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(count) = header_count(comment, "Number of points:") {
                declared = Some(parse_field::<usize>(count, "point count", path, line_no)?);
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 || (parts.len() - 8) % 2 != 0 {
            return Err(line_error(
                path,
                line_no,
                format!(
                    "expected 8 fields plus (IMAGE_ID, POINT2D_IDX) pairs, got {}",
                    parts.len()
                ),
            ));
        }
        let id = PointId::new(parse_field(parts[0], "point id", path, line_no)?);
        let xyz = [
            parse_field(parts[1], "x", path, line_no)?,
            parse_field(parts[2], "y", path, line_no)?,
            parse_field(parts[3], "z", path, line_no)?,
        ];
        let rgb = [
            parse_field(parts[4], "red", path, line_no)?,
            parse_field(parts[5], "green", path, line_no)?,
            parse_field(parts[6], "blue", path, line_no)?,
        ];
        let error = parse_field(parts[7], "error", path, line_no)?;
        let track = parts[8..]
            .chunks_exact(2)
            .map(|pair| {
                Ok(TrackElement {
                    image_id: ImageId::new(parse_field(pair[0], "track image id", path, line_no)?),
                    point2d_idx: parse_field(pair[1], "track point index", path, line_no)?,
                })
            })
            .collect::<Result<Vec<_>, AutotrackError>>()?;

        let point = Point3D {
            id,
            xyz,
            rgb,
            error,
            track,
        };
        if points.insert(id, point).is_some() {
            return Err(line_error(path, line_no, format!("duplicate point id {id}")));
        }
    }

    check_declared(declared, points.len(), "point", path)?;
    Ok(points)
}

/// Extract the count from a header comment such as
/// ` Number of images: 5, mean observations per image: 12.4`.
fn header_count<'a>(comment: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = comment.trim().strip_prefix(prefix)?;
    Some(rest.split(',').next().unwrap_or(rest).trim())
}

/// Split off the first `N` whitespace-separated fields and return the
/// remainder of the line, trimmed.
fn split_leading_fields<const N: usize>(line: &str) -> Option<([&str; N], &str)> {
    let mut fields = [""; N];
    let mut rest = line;
    for slot in &mut fields {
        let trimmed = rest.trim_start();
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        if end == 0 {
            return None;
        }
        *slot = &trimmed[..end];
        rest = &trimmed[end..];
    }
    Some((fields, rest.trim()))
}

fn parse_field<T: FromStr>(
    raw: &str,
    what: &str,
    path: &Path,
    line_no: usize,
) -> Result<T, AutotrackError> {
    raw.parse::<T>()
        .map_err(|_| line_error(path, line_no, format!("invalid {what} '{raw}'")))
}

fn line_error(path: &Path, line_no: usize, message: String) -> AutotrackError {
    AutotrackError::malformed(path, format!("line {line_no}: {message}"))
}

fn check_declared(
    declared: Option<usize>,
    actual: usize,
    what: &str,
    path: &Path,
) -> Result<(), AutotrackError> {
    match declared {
        Some(expected) if expected != actual => Err(AutotrackError::malformed(
            path,
            format!("header declares {expected} {what}(s) but {actual} were read"),
        )),
        _ => Ok(()),
    }
}

/// Render `cameras.txt`.
pub fn cameras_to_txt_string(cameras: &BTreeMap<CameraId, CameraModel>) -> String {
    let mut out = String::new();
    out.push_str("# Camera list with one line of data per camera:\n");
    out.push_str("#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]\n");
    let _ = writeln!(out, "# Number of cameras: {}", cameras.len());
    for camera in cameras.values() {
        let _ = write!(
            out,
            "{} {} {} {}",
            camera.id, camera.kind, camera.width, camera.height
        );
        for param in &camera.params {
            let _ = write!(out, " {param}");
        }
        out.push('\n');
    }
    out
}

/// Render `images.txt`.
pub fn images_to_txt_string(model: &SparseModel) -> String {
    let mut out = String::new();
    out.push_str("# Image list with two lines of data per image:\n");
    out.push_str("#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME\n");
    out.push_str("#   POINTS2D[] as (X, Y, POINT3D_ID)\n");
    let _ = writeln!(
        out,
        "# Number of images: {}, mean observations per image: {}",
        model.images.len(),
        model.mean_observations_per_image()
    );
    for image in model.images.values() {
        let [qw, qx, qy, qz] = image.qvec;
        let [tx, ty, tz] = image.tvec;
        let _ = writeln!(
            out,
            "{} {qw} {qx} {qy} {qz} {tx} {ty} {tz} {} {}",
            image.id, image.camera_id, image.name
        );
        let observations: Vec<String> = image
            .observations
            .iter()
            .map(|obs| {
                let point = obs.point3d_id.map(|id| id.as_u64() as i64).unwrap_or(-1);
                format!("{} {} {point}", obs.xy[0], obs.xy[1])
            })
            .collect();
        out.push_str(&observations.join(" "));
        out.push('\n');
    }
    out
}

/// Render `points3D.txt`.
pub fn points3d_to_txt_string(model: &SparseModel) -> String {
    let mut out = String::new();
    out.push_str("# 3D point list with one line of data per point:\n");
    out.push_str("#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)\n");
    let _ = writeln!(
        out,
        "# Number of points: {}, mean track length: {}",
        model.points.len(),
        model.mean_track_length()
    );
    for point in model.points.values() {
        let [x, y, z] = point.xyz;
        let [r, g, b] = point.rgb;
        let _ = write!(out, "{} {x} {y} {z} {r} {g} {b} {}", point.id, point.error);
        for el in &point.track {
            let _ = write!(out, " {} {}", el.image_id, el.point2d_idx);
        }
        out.push('\n');
    }
    out
}

/// Write the three text files into `dir`.
pub fn write_model_text(dir: &Path, model: &SparseModel) -> Result<(), AutotrackError> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("cameras.txt"), cameras_to_txt_string(&model.cameras))?;
    fs::write(dir.join("images.txt"), images_to_txt_string(model))?;
    fs::write(dir.join("points3D.txt"), points3d_to_txt_string(model))?;
    Ok(())
}
