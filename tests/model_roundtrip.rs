use std::fs;

use autotrack::model::{self, ModelEncoding};
use autotrack::transforms::{convert_model, ConvertOptions};
use autotrack::AutotrackError;

mod common;

#[test]
fn binary_and_text_encodings_parse_identically() {
    let dir = tempfile::tempdir().unwrap();
    let original = common::two_camera_model();
    let bin_dir = dir.path().join("bin");
    let txt_dir = dir.path().join("txt");
    model::write_model_bin(&bin_dir, &original).unwrap();
    model::write_model_text(&txt_dir, &original).unwrap();

    let from_bin = model::read_model_with(&bin_dir, ModelEncoding::Binary).unwrap();
    let from_txt = model::read_model_with(&txt_dir, ModelEncoding::Text).unwrap();
    assert_eq!(from_bin, original);
    assert_eq!(from_txt, original);

    let opts = ConvertOptions {
        multi_camera: true,
        ..ConvertOptions::default()
    };
    let a = convert_model(&from_bin, &bin_dir, &opts).unwrap();
    let b = convert_model(&from_txt, &txt_dir, &opts).unwrap();
    assert_eq!(a.transforms, b.transforms);
    assert_eq!(a.points, b.points);
}

#[test]
fn image_names_with_spaces_survive_both_encodings() {
    let dir = tempfile::tempdir().unwrap();
    let mut original = common::two_camera_model();
    for image in original.images.values_mut() {
        image.name = format!("cam a/{}", image.name);
    }
    let bin_dir = dir.path().join("bin");
    let txt_dir = dir.path().join("txt");
    model::write_model_bin(&bin_dir, &original).unwrap();
    model::write_model_text(&txt_dir, &original).unwrap();

    let from_bin = model::read_model_with(&bin_dir, ModelEncoding::Binary).unwrap();
    let from_txt = model::read_model_with(&txt_dir, ModelEncoding::Text).unwrap();
    assert_eq!(from_bin, original);
    assert_eq!(from_txt, original);
    assert!(from_txt.images.values().all(|i| i.name.starts_with("cam a/")));
}

#[test]
fn text_export_next_to_binary_reads_back_as_binary() {
    let dir = tempfile::tempdir().unwrap();
    let original = common::single_camera_model(4);
    model::write_model_bin(dir.path(), &original).unwrap();
    model::write_model_text(dir.path(), &original).unwrap();

    assert_eq!(
        model::detect_encoding(dir.path()).unwrap(),
        ModelEncoding::Binary
    );
    assert_eq!(model::read_model(dir.path()).unwrap(), original);
}

#[test]
fn truncated_binary_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    model::write_model_bin(dir.path(), &common::two_camera_model()).unwrap();
    let images = dir.path().join("images.bin");
    let bytes = fs::read(&images).unwrap();
    fs::write(&images, &bytes[..bytes.len() - 5]).unwrap();

    let err = model::read_model(dir.path()).unwrap_err();
    match err {
        AutotrackError::MalformedModel { path, .. } => assert_eq!(path, images),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn text_header_count_must_match_records() {
    let dir = tempfile::tempdir().unwrap();
    model::write_model_text(dir.path(), &common::single_camera_model(2)).unwrap();
    let cameras = dir.path().join("cameras.txt");
    let text = fs::read_to_string(&cameras)
        .unwrap()
        .replace("# Number of cameras: 1", "# Number of cameras: 3");
    fs::write(&cameras, text).unwrap();

    assert!(matches!(
        model::read_model(dir.path()),
        Err(AutotrackError::MalformedModel { .. })
    ));
}

#[test]
fn dangling_track_reference_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let mut broken = common::single_camera_model(2);
    let point = broken.points.values_mut().next().unwrap();
    point.track[0].image_id = model::ImageId::new(77);
    model::write_model_bin(dir.path(), &broken).unwrap();

    let err = model::read_model(dir.path()).unwrap_err();
    assert!(err.to_string().contains("77"), "{err}");
}
