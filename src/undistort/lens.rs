//! Lens distortion models and the padded ("keep all pixels") camera matrix.
//!
//! Two models are supported, both on normalized image coordinates:
//!
//! * the rational radial/tangential model
//!   `kr = (1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)`
//!   plus tangential `p1`, `p2`; it also covers the plain OpenCV and radial
//!   models (unused coefficients are zero);
//! * the equidistant fisheye model `θd = θ (1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸)`.
//!
//! Plumb-bob lenses (rational with `k4 = k5 = k6 = 0`) are remapped through
//! `opencv-ros-camera`; see [`Lens::plumb_bob`]. The evaluation here covers
//! the fisheye and full rational models it has no counterpart for, and the
//! padded camera matrix for every model.

use nalgebra::{Matrix3, Matrix3x4, Vector5};
use opencv_ros_camera::RosOpenCvIntrinsics;

use crate::error::AutotrackError;
use crate::transforms::Intrinsics;

const UNDISTORT_ITERATIONS: usize = 50;
const CONVERGENCE_EPS: f64 = 1e-12;

/// Focal lengths and principal point in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PinholeK {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeK {
    pub fn to_normalized(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }

    fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Distortion {
    Rational { k: [f64; 6], p: [f64; 2] },
    Fisheye { k: [f64; 4] },
}

/// A calibrated lens: pinhole projection plus distortion.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Lens {
    pub k: PinholeK,
    pub distortion: Distortion,
    pub width: u32,
    pub height: u32,
}

impl Lens {
    pub fn from_intrinsics(intr: &Intrinsics) -> Self {
        let distortion = if intr.is_fisheye() {
            Distortion::Fisheye {
                k: [intr.k1, intr.k2, intr.k3, intr.k4],
            }
        } else {
            Distortion::Rational {
                k: [intr.k1, intr.k2, intr.k3, intr.k4, intr.k5, intr.k6],
                p: [intr.p1, intr.p2],
            }
        };
        Self {
            k: PinholeK {
                fx: intr.fl_x,
                fy: intr.fl_y,
                cx: intr.cx,
                cy: intr.cy,
            },
            distortion,
            width: intr.w,
            height: intr.h,
        }
    }

    /// Apply distortion to an ideal normalized point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        match self.distortion {
            Distortion::Rational { k, p } => {
                let r2 = x * x + y * y;
                let kr = rational_factor(&k, r2);
                let xd = x * kr + 2.0 * p[0] * x * y + p[1] * (r2 + 2.0 * x * x);
                let yd = y * kr + p[0] * (r2 + 2.0 * y * y) + 2.0 * p[1] * x * y;
                (xd, yd)
            }
            Distortion::Fisheye { k } => {
                let r = (x * x + y * y).sqrt();
                if r < 1e-12 {
                    return (x, y);
                }
                let theta = r.atan();
                let scale = fisheye_theta_d(&k, theta) / r;
                (x * scale, y * scale)
            }
        }
    }

    /// Invert [`Lens::distort`] iteratively.
    ///
    /// Returns `None` when the iteration leaves the model's valid domain.
    pub fn undistort(&self, xd: f64, yd: f64) -> Option<(f64, f64)> {
        match self.distortion {
            Distortion::Rational { k, p } => {
                let (mut x, mut y) = (xd, yd);
                for _ in 0..UNDISTORT_ITERATIONS {
                    let r2 = x * x + y * y;
                    let kr = rational_factor(&k, r2);
                    if !kr.is_finite() || kr <= 0.0 {
                        return None;
                    }
                    let dx = 2.0 * p[0] * x * y + p[1] * (r2 + 2.0 * x * x);
                    let dy = p[0] * (r2 + 2.0 * y * y) + 2.0 * p[1] * x * y;
                    let nx = (xd - dx) / kr;
                    let ny = (yd - dy) / kr;
                    let step = (nx - x).abs() + (ny - y).abs();
                    (x, y) = (nx, ny);
                    if step < CONVERGENCE_EPS {
                        break;
                    }
                }
                (x.is_finite() && y.is_finite()).then_some((x, y))
            }
            Distortion::Fisheye { k } => {
                let theta_d = (xd * xd + yd * yd).sqrt();
                if theta_d < 1e-12 {
                    return Some((xd, yd));
                }
                let theta_d_clamped = theta_d.min(std::f64::consts::FRAC_PI_2);
                let mut theta = theta_d_clamped;
                for _ in 0..UNDISTORT_ITERATIONS {
                    let t2 = theta * theta;
                    let f = fisheye_theta_d(&k, theta) - theta_d_clamped;
                    let df = 1.0
                        + t2 * (3.0 * k[0] + t2 * (5.0 * k[1] + t2 * (7.0 * k[2] + t2 * 9.0 * k[3])));
                    if df.abs() < 1e-12 {
                        return None;
                    }
                    let step = f / df;
                    theta -= step;
                    if step.abs() < CONVERGENCE_EPS {
                        break;
                    }
                }
                if !(0.0..std::f64::consts::FRAC_PI_2).contains(&theta) {
                    return None;
                }
                let scale = theta.tan() / theta_d;
                Some((xd * scale, yd * scale))
            }
        }
    }

    /// The lens as OpenCV/ROS intrinsics whose projection matrix is `new_k`,
    /// or `None` when the model is fisheye or uses the rational denominator.
    pub fn plumb_bob(
        &self,
        new_k: &PinholeK,
    ) -> Result<Option<RosOpenCvIntrinsics<f64>>, AutotrackError> {
        let Distortion::Rational { k, p } = self.distortion else {
            return Ok(None);
        };
        if k[3..].iter().any(|c| *c != 0.0) {
            return Ok(None);
        }
        let coefficients = Vector5::new(k[0], k[1], p[0], p[1], k[2]);
        let distortion = opencv_ros_camera::Distortion::from_opencv_vec(coefficients);
        #[rustfmt::skip]
        let camera = Matrix3::new(
            self.k.fx, 0.0, self.k.cx,
            0.0, self.k.fy, self.k.cy,
            0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let projection = Matrix3x4::new(
            new_k.fx, 0.0, new_k.cx, 0.0,
            0.0, new_k.fy, new_k.cy, 0.0,
            0.0, 0.0, 1.0, 0.0,
        );
        RosOpenCvIntrinsics::from_components(projection, camera, distortion, Matrix3::identity())
            .map(Some)
            .map_err(|err| {
                AutotrackError::schema(format!("camera intrinsics are not usable: {err:?}"))
            })
    }

    /// Camera matrix for the undistorted image that keeps every source pixel
    /// in view at the same resolution. Uncovered output pixels are padding.
    ///
    /// Falls back to the original matrix when the boundary cannot be
    /// undistorted.
    pub fn padded_camera_matrix(&self) -> PinholeK {
        let candidate = match self.distortion {
            Distortion::Rational { .. } => self.padded_rational(),
            Distortion::Fisheye { .. } => self.padded_fisheye(),
        };
        match candidate {
            Some(k) if k.is_valid() => k,
            _ => {
                tracing::warn!(
                    width = self.width,
                    height = self.height,
                    "could not bound the undistorted image; keeping the original camera matrix"
                );
                self.k
            }
        }
    }

    /// Bounding box of a 9×9 grid spanning the image, undistorted.
    fn padded_rational(&self) -> Option<PinholeK> {
        const N: usize = 9;
        let (w, h) = (f64::from(self.width), f64::from(self.height));
        let (mut x0, mut x1) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y0, mut y1) = (f64::INFINITY, f64::NEG_INFINITY);
        for i in 0..N {
            for j in 0..N {
                let u = j as f64 * (w - 1.0) / (N - 1) as f64;
                let v = i as f64 * (h - 1.0) / (N - 1) as f64;
                let (xd, yd) = self.k.to_normalized(u, v);
                let (x, y) = self.undistort(xd, yd)?;
                x0 = x0.min(x);
                x1 = x1.max(x);
                y0 = y0.min(y);
                y1 = y1.max(y);
            }
        }
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        let fx = (w - 1.0) / (x1 - x0);
        let fy = (h - 1.0) / (y1 - y0);
        Some(PinholeK {
            fx,
            fy,
            cx: -fx * x0,
            cy: -fy * y0,
        })
    }

    /// Fit the undistorted edge midpoints, keeping the aspect ratio.
    fn padded_fisheye(&self) -> Option<PinholeK> {
        let (w, h) = (f64::from(self.width), f64::from(self.height));
        let aspect = self.k.fx / self.k.fy;
        let mut pts = Vec::with_capacity(4);
        for (u, v) in [(w / 2.0, 0.0), (w, h / 2.0), (w / 2.0, h), (0.0, h / 2.0)] {
            let (xd, yd) = self.k.to_normalized(u, v);
            let (x, y) = self.undistort(xd, yd)?;
            pts.push((x, y * aspect));
        }
        let cn_x = pts.iter().map(|p| p.0).sum::<f64>() / 4.0;
        let cn_y = pts.iter().map(|p| p.1).sum::<f64>() / 4.0;
        let min_x = pts.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let max_x = pts.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = pts.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_y = pts.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

        let f = [
            w * 0.5 / (cn_x - min_x),
            w * 0.5 / (max_x - cn_x),
            h * 0.5 * aspect / (cn_y - min_y),
            h * 0.5 * aspect / (max_y - cn_y),
        ]
        .into_iter()
        .fold(f64::INFINITY, f64::min);
        if !(f.is_finite() && f > 0.0) {
            return None;
        }
        Some(PinholeK {
            fx: f,
            fy: f / aspect,
            cx: -cn_x * f + w * 0.5,
            cy: (-cn_y * f + h * aspect * 0.5) / aspect,
        })
    }
}

fn rational_factor(k: &[f64; 6], r2: f64) -> f64 {
    let r4 = r2 * r2;
    let r6 = r4 * r2;
    (1.0 + k[0] * r2 + k[1] * r4 + k[2] * r6) / (1.0 + k[3] * r2 + k[4] * r4 + k[5] * r6)
}

fn fisheye_theta_d(k: &[f64; 4], theta: f64) -> f64 {
    let t2 = theta * theta;
    theta * (1.0 + t2 * (k[0] + t2 * (k[1] + t2 * (k[2] + t2 * k[3]))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::CameraModelName;
    use approx::assert_relative_eq;

    fn intrinsics(model: CameraModelName, k1: f64, k2: f64, p1: f64, p2: f64) -> Intrinsics {
        let mut intr = Intrinsics::pinhole(500.0, 480.0, 320.0, 240.0, 640, 480);
        intr.camera_model = model;
        (intr.k1, intr.k2, intr.p1, intr.p2) = (k1, k2, p1, p2);
        intr
    }

    #[test]
    fn rational_inverse_recovers_point() {
        let lens = Lens::from_intrinsics(&intrinsics(
            CameraModelName::OpenCv,
            -0.2,
            0.05,
            0.001,
            -0.002,
        ));
        for &(x, y) in &[(0.1, 0.2), (-0.5, 0.3), (0.6, -0.45), (0.0, 0.0)] {
            let (xd, yd) = lens.distort(x, y);
            let (ux, uy) = lens.undistort(xd, yd).expect("converges");
            assert_relative_eq!(ux, x, epsilon = 1e-9);
            assert_relative_eq!(uy, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn fisheye_inverse_recovers_point() {
        let lens = Lens::from_intrinsics(&intrinsics(
            CameraModelName::OpenCvFisheye,
            0.05,
            -0.01,
            0.0,
            0.0,
        ));
        for &(x, y) in &[(0.1, 0.2), (-0.8, 0.3), (1.2, -0.9)] {
            let (xd, yd) = lens.distort(x, y);
            let (ux, uy) = lens.undistort(xd, yd).expect("converges");
            assert_relative_eq!(ux, x, epsilon = 1e-9);
            assert_relative_eq!(uy, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn only_plumb_bob_lenses_use_ros_intrinsics() {
        let plain =
            Lens::from_intrinsics(&intrinsics(CameraModelName::OpenCv, -0.2, 0.05, 0.0, 0.0));
        assert!(plain.plumb_bob(&plain.k).unwrap().is_some());

        let mut full = intrinsics(CameraModelName::OpenCv, -0.2, 0.05, 0.0, 0.0);
        full.k5 = 0.01;
        let full = Lens::from_intrinsics(&full);
        assert!(full.plumb_bob(&full.k).unwrap().is_none());

        let fisheye =
            Lens::from_intrinsics(&intrinsics(CameraModelName::OpenCvFisheye, 0.05, 0.0, 0.0, 0.0));
        assert!(fisheye.plumb_bob(&fisheye.k).unwrap().is_none());
    }

    #[test]
    fn no_distortion_keeps_camera_matrix() {
        let lens = Lens::from_intrinsics(&intrinsics(CameraModelName::OpenCv, 0.0, 0.0, 0.0, 0.0));
        let k = lens.padded_camera_matrix();
        assert_relative_eq!(k.fx, 500.0, epsilon = 1e-9);
        assert_relative_eq!(k.fy, 480.0, epsilon = 1e-9);
        assert_relative_eq!(k.cx, 320.0, epsilon = 1e-9);
        assert_relative_eq!(k.cy, 240.0, epsilon = 1e-9);
    }

    #[test]
    fn barrel_distortion_widens_the_view() {
        let lens = Lens::from_intrinsics(&intrinsics(CameraModelName::OpenCv, -0.3, 0.0, 0.0, 0.0));
        let k = lens.padded_camera_matrix();
        assert!(k.fx < 500.0, "fx {}", k.fx);
        // Every source corner lands inside the new image.
        for (u, v) in [(0.0, 0.0), (639.0, 0.0), (0.0, 479.0), (639.0, 479.0)] {
            let (xd, yd) = lens.k.to_normalized(u, v);
            let (x, y) = lens.undistort(xd, yd).unwrap();
            let (nu, nv) = k.to_pixel(x, y);
            assert!((-1e-6..=639.0 + 1e-6).contains(&nu), "u {nu}");
            assert!((-1e-6..=479.0 + 1e-6).contains(&nv), "v {nv}");
        }
    }
}
