use std::path::{Path, PathBuf};

use autotrack::restore::{restore, RestoreDirection, RestoreOptions};
use autotrack::transforms::{write_transforms, CameraModelName, Intrinsics, TransformsFile};
use image::{DynamicImage, Rgb, Rgb32FImage, RgbImage};

const W: u32 = 64;
const H: u32 = 48;

fn write_record(dir: &Path) -> PathBuf {
    let mut intrinsics = Intrinsics::pinhole(60.0, 60.0, 32.0, 24.0, W, H);
    intrinsics.camera_model = CameraModelName::OpenCv;
    intrinsics.k1 = -0.05;
    let record = TransformsFile {
        intrinsics: Some(intrinsics),
        cameras: Vec::new(),
        frames: Vec::new(),
        applied_transform: None,
        applied_scale: None,
        ply_file_path: None,
    };
    let path = dir.join("transforms.json");
    write_transforms(&path, &record).unwrap();
    path
}

fn pass(json_path: &Path, input: PathBuf, out: PathBuf, direction: RestoreDirection) -> PathBuf {
    let summary = restore(&RestoreOptions {
        json_path: json_path.to_path_buf(),
        output_dir: out,
        image_dir: None,
        exr: false,
        inputs: vec![input],
        direction,
        camera_id: None,
    })
    .unwrap();
    assert!(summary.skipped.is_empty());
    summary.written.into_iter().next().unwrap()
}

/// Distort then undistort; returns the original and the round-tripped image.
fn round_trip(dir: &Path, original: DynamicImage, name: &str) -> (DynamicImage, DynamicImage) {
    let json = write_record(dir);
    let src = dir.join(name);
    original.save(&src).unwrap();

    let distorted = pass(&json, src, dir.join("d1"), RestoreDirection::Distort);
    let restored = pass(&json, distorted, dir.join("d2"), RestoreDirection::Undistort);
    (original, image::open(restored).unwrap())
}

fn interior() -> impl Iterator<Item = (u32, u32)> {
    (H / 4..3 * H / 4).flat_map(|y| (W / 4..3 * W / 4).map(move |x| (x, y)))
}

#[test]
fn eight_bit_round_trip_stays_within_two_levels() {
    let dir = tempfile::tempdir().unwrap();
    let img = RgbImage::from_fn(W, H, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
    let (original, restored) = round_trip(dir.path(), DynamicImage::ImageRgb8(img), "plate.png");
    let (a, b) = (original.to_rgb8(), restored.to_rgb8());

    for (x, y) in interior() {
        for c in 0..3 {
            let diff = (i16::from(a.get_pixel(x, y)[c]) - i16::from(b.get_pixel(x, y)[c])).abs();
            assert!(diff <= 2, "pixel ({x}, {y}) channel {c} differs by {diff}");
        }
    }
}

#[test]
fn float_round_trip_stays_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let img = Rgb32FImage::from_fn(W, H, |x, y| {
        Rgb([x as f32 / W as f32, y as f32 / H as f32, 0.25])
    });
    let (original, restored) =
        round_trip(dir.path(), DynamicImage::ImageRgb32F(img), "plate.exr");
    let (a, b) = (original.to_rgb32f(), restored.to_rgb32f());

    for (x, y) in interior() {
        for c in 0..3 {
            let diff = (a.get_pixel(x, y)[c] - b.get_pixel(x, y)[c]).abs();
            assert!(diff < 1e-3, "pixel ({x}, {y}) channel {c} differs by {diff}");
        }
    }
}

#[test]
fn mismatched_resolution_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let json = write_record(dir.path());
    let small = dir.path().join("small.png");
    RgbImage::new(10, 10).save(&small).unwrap();

    let summary = restore(&RestoreOptions {
        json_path: json,
        output_dir: dir.path().join("out"),
        image_dir: None,
        exr: false,
        inputs: vec![small.clone()],
        direction: RestoreDirection::Distort,
        camera_id: None,
    })
    .unwrap();
    assert!(summary.written.is_empty());
    assert_eq!(summary.skipped, vec![small]);
}
