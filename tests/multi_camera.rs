use autotrack::model::{CameraId, CameraModelKind, SparseModel};
use autotrack::transforms::{convert_model, ConvertOptions};
use autotrack::AutotrackError;

mod common;
use common::ModelBuilder;

/// `cameras` sub-folders with `frames` images each; camera `c` is
/// `(30 + c) x 24`.
fn rig(cameras: u32, frames: u32) -> SparseModel {
    let mut builder = ModelBuilder::new();
    for c in 1..=cameras {
        let width = 30 + u64::from(c);
        builder = builder.camera(
            c,
            CameraModelKind::Radial,
            width,
            24,
            &[25.0, width as f64 / 2.0, 12.0, -0.02, 0.001],
        );
    }
    let mut id = 0;
    for c in 1..=cameras {
        for f in 1..=frames {
            id += 1;
            builder = builder.image(
                id,
                c,
                &format!("cam_{c}/frame_{f:06}.jpg"),
                [f as f64, c as f64, 0.0],
            );
        }
    }
    builder.point(1, [0.0, 0.0, 4.0], &[1, id]).build()
}

fn opts(images_dir: Option<std::path::PathBuf>) -> ConvertOptions {
    ConvertOptions {
        multi_camera: true,
        images_dir,
        ..ConvertOptions::default()
    }
}

#[test]
fn each_sub_folder_gets_its_own_block() {
    for (cameras, frames) in [(1, 4), (2, 3), (4, 2)] {
        let dir = tempfile::tempdir().unwrap();
        let model = rig(cameras, frames);
        common::write_frames(dir.path(), &model);

        let conv = convert_model(&model, dir.path(), &opts(Some(dir.path().to_path_buf()))).unwrap();
        let t = &conv.transforms;
        assert_eq!(t.cameras.len(), cameras as usize);
        assert_eq!(t.frames.len(), (cameras * frames) as usize);
        assert!(t.intrinsics.is_none());

        for frame in &t.frames {
            let id = frame.camera_id.unwrap();
            let expected = format!("images/cam_{}/", id.as_u32());
            assert!(frame.file_path.starts_with(&expected), "{}", frame.file_path);
            assert_eq!(
                frame.intrinsics.as_ref(),
                Some(&t.camera(id).unwrap().intrinsics)
            );
        }
        let widths: Vec<u32> = t.cameras.iter().map(|b| b.intrinsics.w).collect();
        let expected: Vec<u32> = (1..=cameras).map(|c| 30 + c).collect();
        assert_eq!(widths, expected);
    }
}

#[test]
fn radial_parameters_map_to_opencv_coefficients() {
    let conv = convert_model(&rig(1, 2), std::path::Path::new("m"), &opts(None)).unwrap();
    let block = &conv.transforms.camera(CameraId::new(1)).unwrap().intrinsics;
    assert_eq!((block.fl_x, block.fl_y), (25.0, 25.0));
    assert_eq!((block.k1, block.k2), (-0.02, 0.001));
    assert_eq!((block.p1, block.p2), (0.0, 0.0));
}

#[test]
fn frame_size_must_match_its_camera() {
    let dir = tempfile::tempdir().unwrap();
    let model = rig(2, 2);
    common::write_frames(dir.path(), &model);
    image::RgbImage::new(64, 64)
        .save(dir.path().join("cam_2/frame_000002.jpg"))
        .unwrap();

    let err = convert_model(&model, dir.path(), &opts(Some(dir.path().to_path_buf())))
        .unwrap_err();
    match err {
        AutotrackError::SchemaMismatch { message } => {
            assert!(message.contains("64x64"), "{message}");
            assert!(message.contains("camera 2"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}
