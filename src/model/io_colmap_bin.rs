//! COLMAP binary model reader and writer (`cameras.bin`, `images.bin`,
//! `points3D.bin`).
//!
//! All values are little-endian. Each file starts with a `u64` record count
//! which must match the number of records actually present; trailing bytes
//! after the last record are rejected.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufWriter, Cursor, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::ids::{CameraId, ImageId, PointId};
use super::types::{
    CameraModel, CameraModelKind, Observation, Point3D, ReconstructedImage, TrackElement,
};
use crate::error::AutotrackError;

/// Upper bound on pre-allocation driven by counts read from a file.
const MAX_PREALLOC: usize = 1 << 16;

/// Read `cameras.bin`.
pub fn read_cameras_bin(path: &Path) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    let bytes = fs::read(path)?;
    parse_cameras(&bytes, path)
}

/// Read `images.bin`.
pub fn read_images_bin(
    path: &Path,
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    let bytes = fs::read(path)?;
    parse_images(&bytes, path)
}

/// Read `points3D.bin`.
pub fn read_points3d_bin(path: &Path) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    let bytes = fs::read(path)?;
    parse_points3d(&bytes, path)
}

/// Parse `cameras.bin` content from memory.
pub fn from_cameras_bin_slice(
    bytes: &[u8],
) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    parse_cameras(bytes, Path::new("<memory>/cameras.bin"))
}

/// Parse `images.bin` content from memory.
pub fn from_images_bin_slice(
    bytes: &[u8],
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    parse_images(bytes, Path::new("<memory>/images.bin"))
}

/// Parse `points3D.bin` content from memory.
pub fn from_points3d_bin_slice(
    bytes: &[u8],
) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    parse_points3d(bytes, Path::new("<memory>/points3D.bin"))
}

fn parse_cameras(
    bytes: &[u8],
    path: &Path,
) -> Result<BTreeMap<CameraId, CameraModel>, AutotrackError> {
    let mut rd = ModelReader::new(bytes, path);
    let count = rd.read_count("camera")?;
    let mut cameras = BTreeMap::new();

    for _ in 0..count {
        let raw_id = rd.read_i32()?;
        let id = u32::try_from(raw_id)
            .map(CameraId::new)
            .map_err(|_| rd.error(format!("negative camera id {raw_id}")))?;
        let model_id = rd.read_i32()?;
        let kind = CameraModelKind::from_id(model_id)
            .ok_or_else(|| rd.error(format!("unknown camera model id {model_id}")))?;
        let width = rd.read_u64()?;
        let height = rd.read_u64()?;
        let params = (0..kind.num_params())
            .map(|_| rd.read_f64())
            .collect::<Result<Vec<_>, _>>()?;

        let camera = CameraModel {
            id,
            kind,
            width,
            height,
            params,
        };
        if cameras.insert(id, camera).is_some() {
            return Err(rd.error(format!("duplicate camera id {id}")));
        }
    }

    rd.finish()?;
    Ok(cameras)
}

fn parse_images(
    bytes: &[u8],
    path: &Path,
) -> Result<BTreeMap<ImageId, ReconstructedImage>, AutotrackError> {
    let mut rd = ModelReader::new(bytes, path);
    let count = rd.read_count("image")?;
    let mut images = BTreeMap::new();

    for _ in 0..count {
        let id = ImageId::new(rd.read_u32()?);
        let qvec = [rd.read_f64()?, rd.read_f64()?, rd.read_f64()?, rd.read_f64()?];
        let tvec = [rd.read_f64()?, rd.read_f64()?, rd.read_f64()?];
        let camera_id = CameraId::new(rd.read_u32()?);
        let name = rd.read_cstring()?;

        let num_points2d = rd.read_count("2-D point")?;
        let mut observations = Vec::with_capacity(num_points2d.min(MAX_PREALLOC));
        for _ in 0..num_points2d {
            let x = rd.read_f64()?;
            let y = rd.read_f64()?;
            let raw_point_id = rd.read_i64()?;
            observations.push(Observation {
                xy: [x, y],
                point3d_id: u64::try_from(raw_point_id).ok().map(PointId::new),
            });
        }

        let image = ReconstructedImage {
            id,
            camera_id,
            qvec,
            tvec,
            name,
            observations,
        };
        if images.insert(id, image).is_some() {
            return Err(rd.error(format!("duplicate image id {id}")));
        }
    }

    rd.finish()?;
    Ok(images)
}

fn parse_points3d(
    bytes: &[u8],
    path: &Path,
) -> Result<BTreeMap<PointId, Point3D>, AutotrackError> {
    let mut rd = ModelReader::new(bytes, path);
    let count = rd.read_count("point")?;
    let mut points = BTreeMap::new();

    for _ in 0..count {
        let id = PointId::new(rd.read_u64()?);
        let xyz = [rd.read_f64()?, rd.read_f64()?, rd.read_f64()?];
        let rgb = [rd.read_u8()?, rd.read_u8()?, rd.read_u8()?];
        let error = rd.read_f64()?;

        let track_len = rd.read_count("track element")?;
        let mut track = Vec::with_capacity(track_len.min(MAX_PREALLOC));
        for _ in 0..track_len {
            track.push(TrackElement {
                image_id: ImageId::new(rd.read_u32()?),
                point2d_idx: rd.read_u32()?,
            });
        }

        let point = Point3D {
            id,
            xyz,
            rgb,
            error,
            track,
        };
        if points.insert(id, point).is_some() {
            return Err(rd.error(format!("duplicate point id {id}")));
        }
    }

    rd.finish()?;
    Ok(points)
}

/// Write `cameras.bin`.
pub fn write_cameras_bin(
    path: &Path,
    cameras: &BTreeMap<CameraId, CameraModel>,
) -> Result<(), AutotrackError> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_u64::<LittleEndian>(cameras.len() as u64)?;
    for camera in cameras.values() {
        f.write_i32::<LittleEndian>(camera.id.as_u32() as i32)?;
        f.write_i32::<LittleEndian>(camera.kind.id())?;
        f.write_u64::<LittleEndian>(camera.width)?;
        f.write_u64::<LittleEndian>(camera.height)?;
        for param in &camera.params {
            f.write_f64::<LittleEndian>(*param)?;
        }
    }
    f.flush()?;
    Ok(())
}

/// Write `images.bin`.
pub fn write_images_bin(
    path: &Path,
    images: &BTreeMap<ImageId, ReconstructedImage>,
) -> Result<(), AutotrackError> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_u64::<LittleEndian>(images.len() as u64)?;
    for image in images.values() {
        f.write_u32::<LittleEndian>(image.id.as_u32())?;
        for v in image.qvec.iter().chain(&image.tvec) {
            f.write_f64::<LittleEndian>(*v)?;
        }
        f.write_u32::<LittleEndian>(image.camera_id.as_u32())?;
        f.write_all(image.name.as_bytes())?;
        f.write_u8(0)?;
        f.write_u64::<LittleEndian>(image.observations.len() as u64)?;
        for obs in &image.observations {
            f.write_f64::<LittleEndian>(obs.xy[0])?;
            f.write_f64::<LittleEndian>(obs.xy[1])?;
            let point_id = obs.point3d_id.map(|id| id.as_u64() as i64).unwrap_or(-1);
            f.write_i64::<LittleEndian>(point_id)?;
        }
    }
    f.flush()?;
    Ok(())
}

/// Write `points3D.bin`.
pub fn write_points3d_bin(
    path: &Path,
    points: &BTreeMap<PointId, Point3D>,
) -> Result<(), AutotrackError> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_u64::<LittleEndian>(points.len() as u64)?;
    for point in points.values() {
        f.write_u64::<LittleEndian>(point.id.as_u64())?;
        for v in point.xyz {
            f.write_f64::<LittleEndian>(v)?;
        }
        f.write_all(&point.rgb)?;
        f.write_f64::<LittleEndian>(point.error)?;
        f.write_u64::<LittleEndian>(point.track.len() as u64)?;
        for el in &point.track {
            f.write_u32::<LittleEndian>(el.image_id.as_u32())?;
            f.write_u32::<LittleEndian>(el.point2d_idx)?;
        }
    }
    f.flush()?;
    Ok(())
}

/// Little-endian reader over an in-memory file that reports errors against
/// its path.
struct ModelReader<'a> {
    cursor: Cursor<&'a [u8]>,
    path: &'a Path,
}

impl<'a> ModelReader<'a> {
    fn new(bytes: &'a [u8], path: &'a Path) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            path,
        }
    }

    fn remaining(&self) -> u64 {
        (self.cursor.get_ref().len() as u64).saturating_sub(self.cursor.position())
    }

    fn error(&self, message: impl Into<String>) -> AutotrackError {
        AutotrackError::malformed(
            self.path,
            format!(
                "{} (at byte offset {})",
                message.into(),
                self.cursor.position()
            ),
        )
    }

    /// Run one fixed-size read, turning a short read into a truncation error.
    fn read<T>(
        &mut self,
        size: u64,
        f: impl FnOnce(&mut Cursor<&'a [u8]>) -> std::io::Result<T>,
    ) -> Result<T, AutotrackError> {
        let remaining = self.remaining();
        if remaining < size {
            return Err(self.error(format!(
                "unexpected end of file: needed {size} byte(s), {remaining} remaining"
            )));
        }
        f(&mut self.cursor).map_err(|err| self.error(err.to_string()))
    }

    fn read_u8(&mut self) -> Result<u8, AutotrackError> {
        self.read(1, |c| c.read_u8())
    }

    fn read_u32(&mut self) -> Result<u32, AutotrackError> {
        self.read(4, |c| c.read_u32::<LittleEndian>())
    }

    fn read_i32(&mut self) -> Result<i32, AutotrackError> {
        self.read(4, |c| c.read_i32::<LittleEndian>())
    }

    fn read_u64(&mut self) -> Result<u64, AutotrackError> {
        self.read(8, |c| c.read_u64::<LittleEndian>())
    }

    fn read_i64(&mut self) -> Result<i64, AutotrackError> {
        self.read(8, |c| c.read_i64::<LittleEndian>())
    }

    fn read_f64(&mut self) -> Result<f64, AutotrackError> {
        self.read(8, |c| c.read_f64::<LittleEndian>())
    }

    /// Read a declared record count. Counts larger than the remaining bytes
    /// could possibly hold are rejected before any allocation.
    fn read_count(&mut self, what: &str) -> Result<usize, AutotrackError> {
        let raw = self.read_u64()?;
        let remaining = self.remaining();
        if raw > remaining {
            return Err(self.error(format!(
                "declared {raw} {what} record(s) but only {remaining} byte(s) remain"
            )));
        }
        Ok(raw as usize)
    }

    fn read_cstring(&mut self) -> Result<String, AutotrackError> {
        let mut buf = Vec::new();
        self.cursor.read_until(0, &mut buf)?;
        if buf.pop() != Some(0) {
            return Err(self.error("unterminated image name"));
        }
        String::from_utf8(buf).map_err(|_| self.error("image name is not valid UTF-8"))
    }

    fn finish(&self) -> Result<(), AutotrackError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(self.error(format!(
                "{extra} trailing byte(s) after the declared records"
            ))),
        }
    }
}
