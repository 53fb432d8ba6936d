//! ASCII PLY point clouds (`x y z` float, `red green blue` uchar).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::AutotrackError;

/// A coloured point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlyVertex {
    pub xyz: [f64; 3],
    pub rgb: [u8; 3],
}

/// Render vertices as an ASCII PLY document.
pub fn to_ply_string(vertices: &[PlyVertex]) -> String {
    let mut out = String::new();
    out.push_str("ply\n");
    out.push_str("format ascii 1.0\n");
    let _ = writeln!(out, "element vertex {}", vertices.len());
    out.push_str("property float x\n");
    out.push_str("property float y\n");
    out.push_str("property float z\n");
    out.push_str("property uchar red\n");
    out.push_str("property uchar green\n");
    out.push_str("property uchar blue\n");
    out.push_str("end_header\n");
    for v in vertices {
        let [x, y, z] = v.xyz;
        let [r, g, b] = v.rgb;
        let _ = writeln!(out, "{:.8} {:.8} {:.8} {r} {g} {b}", x as f32, y as f32, z as f32);
    }
    out
}

/// Write vertices to `path` as ASCII PLY.
pub fn write_ply(path: &Path, vertices: &[PlyVertex]) -> Result<(), AutotrackError> {
    fs::write(path, to_ply_string(vertices))?;
    Ok(())
}

/// Read an ASCII PLY written by [`write_ply`].
///
/// Only the layout produced here is accepted (one vertex element with six
/// properties); anything else is `MalformedModel`.
pub fn read_ply(path: &Path) -> Result<Vec<PlyVertex>, AutotrackError> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();

    if lines.next().map(str::trim) != Some("ply") {
        return Err(AutotrackError::malformed(path, "missing 'ply' magic line"));
    }
    let mut count = None;
    for line in lines.by_ref() {
        let line = line.trim();
        if line == "end_header" {
            break;
        }
        if let Some(rest) = line.strip_prefix("format ") {
            if !rest.starts_with("ascii") {
                return Err(AutotrackError::malformed(
                    path,
                    format!("unsupported PLY format '{rest}'"),
                ));
            }
        }
        if let Some(rest) = line.strip_prefix("element vertex ") {
            count = Some(rest.trim().parse::<usize>().map_err(|_| {
                AutotrackError::malformed(path, format!("invalid vertex count '{rest}'"))
            })?);
        }
    }
    let count =
        count.ok_or_else(|| AutotrackError::malformed(path, "missing 'element vertex' header"))?;

    let mut vertices = Vec::with_capacity(count.min(1 << 16));
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(AutotrackError::malformed(
                path,
                format!("vertex line has {} field(s), expected 6", parts.len()),
            ));
        }
        let num = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| AutotrackError::malformed(path, format!("invalid coordinate '{s}'")))
        };
        let byte = |s: &str| {
            s.parse::<u8>()
                .map_err(|_| AutotrackError::malformed(path, format!("invalid colour '{s}'")))
        };
        vertices.push(PlyVertex {
            xyz: [num(parts[0])?, num(parts[1])?, num(parts[2])?],
            rgb: [byte(parts[3])?, byte(parts[4])?, byte(parts[5])?],
        });
    }

    if vertices.len() != count {
        return Err(AutotrackError::malformed(
            path,
            format!("header declares {count} vertices but {} were read", vertices.len()),
        ));
    }
    Ok(vertices)
}
