use std::fs;
use std::path::Path;

use autotrack::masks::{normalize_mask_dir, ClipMaskQuery, DirectoryMasks, MaskProvider};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"m").unwrap();
}

#[test]
fn second_pass_renames_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let masks = dir.path().join("shot_mask");
    for i in 1..=4 {
        touch(&images.join(format!("frame_{i:06}.jpg")));
        touch(&masks.join(format!("frame_{i:06}.png")));
    }

    let first = normalize_mask_dir(&masks, &images).unwrap();
    assert_eq!(first.renamed, 4);
    assert_eq!(first.records.len(), 4);

    let second = normalize_mask_dir(&masks, &images).unwrap();
    assert_eq!(second.renamed, 0);
    assert_eq!(second.records, first.records);
    assert!(masks.join("frame_000004.jpg.png").is_file());
}

#[test]
fn nearest_candidate_wins_over_root() {
    let dir = tempfile::tempdir().unwrap();
    let footage = dir.path().join("footage");
    let images = dir.path().join("out/shot/images");
    touch(&images.join("frame_000001.jpg"));
    touch(&footage.join("mask/shot_mask/frame_000001.jpg.png"));
    touch(&dir.path().join("masks/shot_mask/frame_000001.jpg.png"));

    let provider = DirectoryMasks::new(Some(dir.path().join("masks")));
    let res = provider
        .resolve(&ClipMaskQuery {
            clip_name: "shot",
            clip_parent: &footage,
            images_dir: &images,
        })
        .unwrap()
        .unwrap();
    assert_eq!(res.dir, Some(footage.join("mask/shot_mask")));
}

#[test]
fn root_is_used_when_nothing_sits_next_to_the_footage() {
    let dir = tempfile::tempdir().unwrap();
    let footage = dir.path().join("footage");
    fs::create_dir_all(&footage).unwrap();
    let images = dir.path().join("out/shot/images");
    touch(&images.join("cam_a/frame_000001.jpg"));
    touch(&dir.path().join("masks/shot_mask/cam_a/frame_000001.jpg"));

    let provider = DirectoryMasks::new(Some(dir.path().join("masks")));
    let res = provider
        .resolve(&ClipMaskQuery {
            clip_name: "shot",
            clip_parent: &footage,
            images_dir: &images,
        })
        .unwrap()
        .unwrap();

    assert_eq!(res.dir, Some(dir.path().join("masks/shot_mask")));
    assert_eq!(res.renamed, 1);
    let map = res.path_map();
    assert!(map["cam_a/frame_000001.jpg"].ends_with("shot_mask/cam_a/frame_000001.jpg.png"));
}
