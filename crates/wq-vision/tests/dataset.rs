// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::Path;

use approx::assert_relative_eq;
use image::{Rgb, RgbImage};
use tempfile::tempdir;
use wq_tensor::TensorError;

use wq_vision::datasets::{DatasetOptions, QualityDataset, SamplePolicy};

fn write_image(dir: &Path, name: &str, width: u32, height: u32, shade: u8) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([shade, (x * 10) as u8, (y * 20) as u8])
    });
    img.save(dir.join(name)).unwrap();
}

const LABELS: &str = "I01_01_01.png, 2.0\n\
                      I01_01_02.png, 4.0\n\
                      I02_01_01.png, 3.0\n\
                      \n\
                      I03_01_01.png, 5.0\n";

fn fixture() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("labels.txt"), LABELS).unwrap();
    write_image(dir.path(), "I01_01_01.png", 6, 4, 255);
    write_image(dir.path(), "I01_01_02.png", 6, 4, 0);
    write_image(dir.path(), "I02_01_01.png", 6, 4, 51);
    dir
}

#[test]
fn scores_are_min_max_normalised_over_selected_tags() {
    let dir = fixture();
    let dataset = QualityDataset::from_label_file(
        dir.path(),
        dir.path().join("labels.txt"),
        &["01", "02"],
        DatasetOptions::default(),
    )
    .unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!((dataset.min(), dataset.max()), (2.0, 4.0));
    let scores: Vec<f32> = dataset.records().iter().map(|r| r.score).collect();
    assert_eq!(scores, vec![0.0, 1.0, 0.5]);
    for record in dataset.records() {
        assert_relative_eq!(
            dataset.denormalize(dataset.normalize(record.raw_score)),
            record.raw_score,
            epsilon = 1e-6
        );
    }
}

#[test]
fn samples_are_rgb_grids_in_unit_range() {
    let dir = fixture();
    let dataset = QualityDataset::from_label_file(
        dir.path(),
        dir.path().join("labels.txt"),
        &["01"],
        DatasetOptions::default(),
    )
    .unwrap();
    let (image, score) = dataset.sample(0).unwrap();
    assert_eq!(score, 0.0);
    assert_eq!((image.batch(), image.channels(), image.hw()), (1, 3, (4, 6)));
    let pixels = &image.items()[0];
    assert!(pixels.row(0).iter().all(|&v| v == 1.0));
    // green ramps with x, blue with y
    assert_relative_eq!(pixels.row(1)[5], 50.0 / 255.0, epsilon = 1e-6);
    assert_relative_eq!(pixels.row(2)[6], 20.0 / 255.0, epsilon = 1e-6);
    assert!(dataset.sample(5).is_err());
}

#[test]
fn center_crop_and_batches() {
    let dir = fixture();
    let options = DatasetOptions {
        center_crop: Some(4),
        ..DatasetOptions::default()
    };
    let dataset = QualityDataset::from_label_file(
        dir.path(),
        dir.path().join("labels.txt"),
        &["01", "02"],
        options,
    )
    .unwrap();
    let batches: Vec<_> = dataset
        .batches(2)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].0.batch(), 2);
    assert_eq!(batches[0].0.hw(), (4, 4));
    assert_eq!(batches[0].1, vec![0.0, 1.0]);
    assert_eq!(batches[1].1, vec![0.5]);
    // crop starts one column in, so green begins at 10/255
    assert_relative_eq!(batches[0].0.items()[0].row(1)[0], 10.0 / 255.0, epsilon = 1e-6);
    assert!(dataset.batches(0).is_err());
}

#[test]
fn missing_images_fail_unless_skipped() {
    let dir = fixture();
    let labels = dir.path().join("labels.txt");
    let strict = QualityDataset::from_label_file(
        dir.path(),
        &labels,
        &["01", "03"],
        DatasetOptions::default(),
    )
    .unwrap();
    assert_eq!(strict.len(), 3);
    let err = strict.sample(2).unwrap_err();
    match err {
        TensorError::DataIo { path, .. } => assert!(path.ends_with("I03_01_01.png")),
        other => panic!("unexpected error {other:?}"),
    }

    let lenient = QualityDataset::from_label_file(
        dir.path(),
        &labels,
        &["01", "03"],
        DatasetOptions {
            policy: SamplePolicy::SkipUnreadable,
            ..DatasetOptions::default()
        },
    )
    .unwrap();
    assert_eq!(lenient.len(), 2);
    assert!(lenient.iter().all(|sample| sample.is_ok()));
}

#[test]
fn unreadable_label_file_and_empty_selection() {
    let dir = fixture();
    assert!(matches!(
        QualityDataset::from_label_file(
            dir.path(),
            dir.path().join("absent.txt"),
            &["01"],
            DatasetOptions::default(),
        ),
        Err(TensorError::DataIo { .. })
    ));
    assert!(matches!(
        QualityDataset::from_label_file(
            dir.path(),
            dir.path().join("labels.txt"),
            &["99"],
            DatasetOptions::default(),
        ),
        Err(TensorError::EmptyInput(_))
    ));
}

#[test]
fn corrupt_pixel_data_is_skipped_before_normalisation() {
    let dir = fixture();
    write_image(dir.path(), "I01_02_01.png", 32, 32, 90);
    let intact = fs::read(dir.path().join("I01_02_01.png")).unwrap();
    let mut damaged = intact.clone();
    let end = damaged.len() - 12;
    for byte in &mut damaged[60..end] {
        *byte ^= 0xA5;
    }
    fs::write(dir.path().join("I01_02_01.png"), &damaged).unwrap();
    assert!(image::image_dimensions(dir.path().join("I01_02_01.png")).is_ok());

    let labels = dir.path().join("damaged.txt");
    fs::write(
        &labels,
        "I01_01_01.png, 2.0\nI01_01_02.png, 4.0\nI01_02_01.png, 9.0\n",
    )
    .unwrap();

    let strict =
        QualityDataset::from_label_file(dir.path(), &labels, &["01"], DatasetOptions::default())
            .unwrap();
    assert_eq!(strict.len(), 3);
    assert!(matches!(strict.sample(2), Err(TensorError::DataIo { .. })));

    let lenient = QualityDataset::from_label_file(
        dir.path(),
        &labels,
        &["01"],
        DatasetOptions {
            policy: SamplePolicy::SkipUnreadable,
            ..DatasetOptions::default()
        },
    )
    .unwrap();
    assert_eq!(lenient.len(), 2);
    assert_eq!((lenient.min(), lenient.max()), (2.0, 4.0));
    assert!(lenient.iter().all(|sample| sample.is_ok()));
}
