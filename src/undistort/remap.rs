//! Precomputed sampling maps and a sample-type preserving remap.
//!
//! A [`RemapTable`] stores, for every output pixel, the source position to
//! sample. Tables are built once per camera with kornia's meshgrid and shared
//! read-only across frames; resampling is kornia's `remap`. Remapping keeps
//! the image's sample type: 8- and 16-bit samples are rounded and clamped,
//! 32-bit float samples are written unclamped so HDR content keeps its range.
//! Output pixels whose source position falls outside the source are zero.

use std::fmt;

use image::{DynamicImage, ImageBuffer, Pixel, Primitive};
use kornia_image::{Image, ImageError, ImageSize};
use kornia_tensor::CpuAllocator;
use kornia_imgproc::interpolation::grid::meshgrid_from_fn;
use kornia_imgproc::interpolation::{remap, InterpolationMode};
use kornia_tensor::CpuTensor2;
use nalgebra::{RowVector2, Vector2};
use opencv_ros_camera::UndistortedPixels;

use super::lens::{Lens, PinholeK};
use crate::error::AutotrackError;

/// How source pixels are sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    /// Bilinear, for imagery.
    Bilinear,
    /// Nearest neighbour, for masks.
    Nearest,
}

impl From<Interpolation> for InterpolationMode {
    fn from(value: Interpolation) -> Self {
        match value {
            Interpolation::Bilinear => InterpolationMode::Bilinear,
            Interpolation::Nearest => InterpolationMode::Nearest,
        }
    }
}

/// Per-pixel source coordinates for an output image of `width × height`.
///
/// Unmappable pixels hold NaN.
#[derive(Clone)]
pub struct RemapTable {
    pub width: u32,
    pub height: u32,
    pub map_x: CpuTensor2<f32>,
    pub map_y: CpuTensor2<f32>,
}

impl fmt::Debug for RemapTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemapTable")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl RemapTable {
    /// Build a table by evaluating `f(u, v) -> (src_u, src_v)` for every
    /// output pixel.
    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Result<Self, AutotrackError>
    where
        F: Fn(f64, f64) -> Option<(f64, f64)> + Sync,
    {
        let (map_x, map_y) = meshgrid_from_fn(width as usize, height as usize, |u, v| {
            let (sx, sy) = f(u as f64, v as f64).unwrap_or((f64::NAN, f64::NAN));
            Ok((sx as f32, sy as f32))
        })
        .map_err(ImageError::from)?;
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    /// Map producing an undistorted image (camera `new_k`) from a distorted
    /// source taken through `lens`.
    pub fn undistort(lens: &Lens, new_k: &PinholeK) -> Result<Self, AutotrackError> {
        match lens.plumb_bob(new_k)? {
            Some(intrinsics) => Self::from_fn(lens.width, lens.height, |u, v| {
                let undistorted = UndistortedPixels {
                    data: RowVector2::new(u, v),
                };
                let d = intrinsics.distort(&undistorted).data;
                Some((d[(0, 0)], d[(0, 1)]))
            }),
            None => Self::from_fn(lens.width, lens.height, |u, v| {
                let (x, y) = new_k.to_normalized(u, v);
                let (xd, yd) = lens.distort(x, y);
                Some(lens.k.to_pixel(xd, yd))
            }),
        }
    }

    /// Map producing a distorted image (as seen through `lens`) from an
    /// undistorted source with camera `new_k`.
    pub fn distort(lens: &Lens, new_k: &PinholeK) -> Result<Self, AutotrackError> {
        match lens.plumb_bob(new_k)? {
            Some(intrinsics) => Self::from_fn(lens.width, lens.height, |u, v| {
                let distorted = cam_geom::Pixels::new(Vector2::new(u, v).transpose());
                let p = intrinsics.undistort(&distorted).data;
                let (x, y) = (p[(0, 0)], p[(0, 1)]);
                (x.is_finite() && y.is_finite()).then_some((x, y))
            }),
            None => Self::from_fn(lens.width, lens.height, |u, v| {
                let (xd, yd) = lens.k.to_normalized(u, v);
                let (x, y) = lens.undistort(xd, yd)?;
                Some(new_k.to_pixel(x, y))
            }),
        }
    }

    /// Whether output pixel `idx` samples inside a `src_w × src_h` source.
    fn covers(&self, idx: usize, src_w: usize, src_h: usize) -> bool {
        let (x, y) = (self.map_x.as_slice()[idx], self.map_y.as_slice()[idx]);
        (0.0..=(src_w as f32 - 1.0)).contains(&x) && (0.0..=(src_h as f32 - 1.0)).contains(&y)
    }
}

/// Conversion between a sample type and the `f32` working space.
pub trait Sample: Primitive + Send + Sync {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Sample for u8 {
    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }
}

impl Sample for u16 {
    fn to_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 65535.0) as u16
    }
}

impl Sample for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

/// Remap one image buffer with `C` channels per pixel; the output has the
/// table's dimensions.
pub fn remap_buffer<P, const C: usize>(
    src: &ImageBuffer<P, Vec<P::Subpixel>>,
    table: &RemapTable,
    interpolation: Interpolation,
) -> Result<ImageBuffer<P, Vec<P::Subpixel>>, AutotrackError>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let (src_w, src_h) = (src.width() as usize, src.height() as usize);
    let source = Image::<f32, C, CpuAllocator>::new(
        ImageSize {
            width: src_w,
            height: src_h,
        },
        src.as_raw().iter().map(|v| v.to_f32()).collect(),
        CpuAllocator,
    )?;
    let mut remapped = Image::<f32, C, CpuAllocator>::from_size_val(
        ImageSize {
            width: table.width as usize,
            height: table.height as usize,
        },
        0.0,
        CpuAllocator,
    )?;
    remap(
        &source,
        &mut remapped,
        &table.map_x,
        &table.map_y,
        interpolation.into(),
    )?;

    let mut data = remapped.0.into_vec();
    for (idx, px) in data.chunks_exact_mut(C).enumerate() {
        if !table.covers(idx, src_w, src_h) {
            px.fill(0.0);
        }
    }
    let samples = data.into_iter().map(<P::Subpixel as Sample>::from_f32).collect();
    ImageBuffer::from_raw(table.width, table.height, samples).ok_or_else(|| {
        AutotrackError::schema(format!(
            "remapped buffer does not hold {}x{} pixels of {C} channel(s)",
            table.width, table.height
        ))
    })
}

/// Remap a decoded image, keeping its pixel layout and sample type.
pub fn remap_image(
    src: &DynamicImage,
    table: &RemapTable,
    interpolation: Interpolation,
) -> Result<DynamicImage, AutotrackError> {
    Ok(match src {
        DynamicImage::ImageLuma8(img) => {
            DynamicImage::ImageLuma8(remap_buffer::<_, 1>(img, table, interpolation)?)
        }
        DynamicImage::ImageLumaA8(img) => {
            DynamicImage::ImageLumaA8(remap_buffer::<_, 2>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgb8(img) => {
            DynamicImage::ImageRgb8(remap_buffer::<_, 3>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgba8(img) => {
            DynamicImage::ImageRgba8(remap_buffer::<_, 4>(img, table, interpolation)?)
        }
        DynamicImage::ImageLuma16(img) => {
            DynamicImage::ImageLuma16(remap_buffer::<_, 1>(img, table, interpolation)?)
        }
        DynamicImage::ImageLumaA16(img) => {
            DynamicImage::ImageLumaA16(remap_buffer::<_, 2>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgb16(img) => {
            DynamicImage::ImageRgb16(remap_buffer::<_, 3>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgba16(img) => {
            DynamicImage::ImageRgba16(remap_buffer::<_, 4>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgb32F(img) => {
            DynamicImage::ImageRgb32F(remap_buffer::<_, 3>(img, table, interpolation)?)
        }
        DynamicImage::ImageRgba32F(img) => {
            DynamicImage::ImageRgba32F(remap_buffer::<_, 4>(img, table, interpolation)?)
        }
        other => DynamicImage::ImageRgba32F(remap_buffer::<_, 4>(
            &other.to_rgba32f(),
            table,
            interpolation,
        )?),
    })
}
