use std::{fs, path::Path};

use change_data::{
    save_change_map, ChangeDetectionDataset, DatasetConfig, DatasetError, LabelMap, Normalization,
};
use image::{GrayImage, Luma, Rgb, RgbImage};

fn write_split(root: &Path, names: &[&str], size: u32) {
    for dir in ["A", "B", "label"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    for (idx, name) in names.iter().enumerate() {
        let pre = RgbImage::from_pixel(size, size, Rgb([255, 0, 0]));
        pre.save(root.join("A").join(format!("{name}.png"))).unwrap();
        let post = RgbImage::from_pixel(size, size, Rgb([0, 255, 0]));
        post.save(root.join("B").join(format!("{name}.png"))).unwrap();
        let mut label = GrayImage::new(size, size);
        for x in 0..=(idx as u32) {
            label.put_pixel(x, 0, Luma([255]));
        }
        label.save(root.join("label").join(format!("{name}.png"))).unwrap();
    }
}

#[test]
fn lists_samples_in_name_order_and_decodes_them() {
    let tmp = tempfile::tempdir().unwrap();
    write_split(tmp.path(), &["b_tile", "a_tile", "c_tile"], 4);
    fs::write(tmp.path().join("A").join("notes.txt"), "skip me").unwrap();

    let dataset =
        ChangeDetectionDataset::open(DatasetConfig::new(tmp.path()), Normalization::unit(3))
            .unwrap();

    let names: Vec<&str> = dataset.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a_tile", "b_tile", "c_tile"]);

    let sample = dataset.get(2).unwrap();
    assert_eq!(sample.name, "c_tile");
    assert_eq!((sample.pre.channels, sample.pre.height, sample.pre.width), (3, 4, 4));
    // Channel-first layout: the red plane of the pre image is all ones.
    assert!(sample.pre.data[..16].iter().all(|v| (*v - 1.0).abs() < 1e-6));
    assert!(sample.pre.data[16..].iter().all(|v| v.abs() < 1e-6));
    assert_eq!(sample.label.changed_pixels(), 3);
    assert!(sample.label.data.iter().all(|v| *v <= 1));
}

#[test]
fn debug_mode_truncates_and_test_mode_disables_shuffle() {
    let tmp = tempfile::tempdir().unwrap();
    write_split(tmp.path(), &["t0", "t1", "t2", "t3"], 2);

    let mut config = DatasetConfig::new(tmp.path());
    config.debug = true;
    config.debug_samples = 2;
    config.test_mode = true;
    let dataset = ChangeDetectionDataset::open(config, Normalization::imagenet()).unwrap();

    assert_eq!(dataset.len(), 2);
    assert!(!dataset.shuffle_enabled());
}

#[test]
fn missing_label_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    write_split(tmp.path(), &["t0", "t1"], 2);
    fs::remove_file(tmp.path().join("label").join("t1.png")).unwrap();

    let err = ChangeDetectionDataset::open(DatasetConfig::new(tmp.path()), Normalization::unit(3))
        .unwrap_err();
    assert!(matches!(err, DatasetError::MissingCounterpart { kind: "label", .. }));
}

#[test]
fn mismatched_image_sizes_fail_on_access() {
    let tmp = tempfile::tempdir().unwrap();
    write_split(tmp.path(), &["t0"], 4);
    RgbImage::new(2, 2)
        .save(tmp.path().join("B").join("t0.png"))
        .unwrap();

    let dataset =
        ChangeDetectionDataset::open(DatasetConfig::new(tmp.path()), Normalization::unit(3))
            .unwrap();
    assert!(matches!(dataset.get(0), Err(DatasetError::Shape { .. })));
    assert!(matches!(dataset.get(5), Err(DatasetError::OutOfRange { .. })));
}

#[test]
fn change_maps_are_written_as_binary_png() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("res").join("tile.png");
    let map = LabelMap {
        data: vec![0, 1, 1, 0],
        height: 2,
        width: 2,
    };

    save_change_map(&path, &map).unwrap();

    let written = image::open(&path).unwrap().to_luma8();
    assert_eq!(written.into_raw(), vec![0, 255, 255, 0]);
}
