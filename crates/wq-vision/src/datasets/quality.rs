// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Human-annotated quality datasets.
//!
//! A label file holds one `"<name>, <score>"` line per distorted image. The
//! characters `[1, 3)` of the name identify the reference scene, which lets a
//! caller split train and test sets by scene. Scores are min-max normalised
//! over the selected lines.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use wq_tensor::{FeatureGrid, PureResult, Tensor, TensorError};

/// What to do with images that cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplePolicy {
    /// Fail with [`TensorError::DataIo`] when the sample is read.
    #[default]
    FailFast,
    /// Decode every image while loading and drop the ones that fail,
    /// before the score range is computed.
    SkipUnreadable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetOptions {
    /// Character range of the image name holding the scene tag.
    pub tag_range: (usize, usize),
    /// Square side cut from the image centre, if any.
    pub center_crop: Option<usize>,
    pub policy: SamplePolicy,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            tag_range: (1, 3),
            center_crop: None,
            policy: SamplePolicy::FailFast,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityRecord {
    pub name: String,
    pub raw_score: f32,
    pub score: f32,
}

#[derive(Clone, Debug)]
pub struct QualityDataset {
    image_dir: PathBuf,
    records: Vec<QualityRecord>,
    min: f32,
    max: f32,
    center_crop: Option<usize>,
}

fn data_io(path: &Path, message: impl Into<String>) -> TensorError {
    TensorError::DataIo {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn scene_tag(name: &str, (start, end): (usize, usize)) -> Option<String> {
    if end <= start || name.chars().count() < end {
        return None;
    }
    Some(name.chars().skip(start).take(end - start).collect())
}

/// Parses one label line into `(name, score)`; blank lines yield `None`.
fn parse_line(path: &Path, number: usize, line: &str) -> PureResult<Option<(String, f32)>> {
    let mut fields = line.split_whitespace();
    let Some(name) = fields.next() else {
        return Ok(None);
    };
    let (Some(score), None) = (fields.next(), fields.next()) else {
        return Err(data_io(
            path,
            format!("line {number}: expected `<name>, <score>`"),
        ));
    };
    let name = name.strip_suffix(',').unwrap_or(name);
    let score: f32 = score
        .parse()
        .map_err(|err| data_io(path, format!("line {number}: bad score {score:?}: {err}")))?;
    if !score.is_finite() {
        return Err(TensorError::NonFiniteValue {
            label: "dataset.score",
            value: score,
        });
    }
    Ok(Some((name.to_string(), score)))
}

/// Decodes an image into a one-item grid of `(3, height * width)` RGB values
/// in `[0, 1]`.
pub fn load_rgb_image(path: &Path, center_crop: Option<usize>) -> PureResult<FeatureGrid> {
    let decoded = image::open(path).map_err(|err| data_io(path, err.to_string()))?;
    let mut rgb = decoded.to_rgb8();
    if let Some(side) = center_crop {
        let (w, h) = rgb.dimensions();
        let side_px = side as u32;
        if side == 0 || side_px > w || side_px > h {
            return Err(TensorError::configuration(
                "dataset.center_crop",
                format!("cannot crop {side}x{side} from a {w}x{h} image"),
            ));
        }
        rgb = imageops::crop_imm(&rgb, (w - side_px) / 2, (h - side_px) / 2, side_px, side_px)
            .to_image();
    }
    let (w, h) = rgb.dimensions();
    let (w, h) = (w as usize, h as usize);
    let plane = w * h;
    let mut data = vec![0.0f32; 3 * plane];
    for (idx, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + idx] = f32::from(pixel[c]) / 255.0;
        }
    }
    FeatureGrid::from_items(vec![Tensor::from_vec(3, plane, data)?], (h, w))
}

impl QualityDataset {
    /// Reads `label_file` and keeps the lines whose scene tag is in `tags`.
    pub fn from_label_file<S: AsRef<str>>(
        image_dir: impl AsRef<Path>,
        label_file: impl AsRef<Path>,
        tags: &[S],
        options: DatasetOptions,
    ) -> PureResult<Self> {
        let image_dir = image_dir.as_ref().to_path_buf();
        let label_file = label_file.as_ref();
        let raw = fs::read_to_string(label_file)
            .map_err(|err| data_io(label_file, err.to_string()))?;

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let Some((name, raw_score)) = parse_line(label_file, idx + 1, line)? else {
                continue;
            };
            let selected = scene_tag(&name, options.tag_range)
                .is_some_and(|tag| tags.iter().any(|t| t.as_ref() == tag));
            if selected {
                records.push(QualityRecord {
                    name,
                    raw_score,
                    score: 0.0,
                });
            }
        }

        if options.policy == SamplePolicy::SkipUnreadable {
            // Headers can be intact over corrupt pixel data, so decode fully.
            let readable: Vec<bool> = records
                .par_iter()
                .map(|record| {
                    let path = image_dir.join(&record.name);
                    match image::open(&path) {
                        Ok(_) => true,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "skipping unreadable image");
                            false
                        }
                    }
                })
                .collect();
            let mut keep = readable.into_iter();
            records.retain(|_| keep.next().unwrap_or(false));
        }
        if records.is_empty() {
            return Err(TensorError::EmptyInput("quality dataset"));
        }

        let min = records.iter().map(|r| r.raw_score).fold(f32::INFINITY, f32::min);
        let max = records
            .iter()
            .map(|r| r.raw_score)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut dataset = Self {
            image_dir,
            records,
            min,
            max,
            center_crop: options.center_crop,
        };
        let normalized: Vec<f32> = dataset
            .records
            .iter()
            .map(|record| dataset.normalize(record.raw_score))
            .collect();
        for (record, score) in dataset.records.iter_mut().zip(normalized) {
            record.score = score;
        }
        info!(
            label_file = %label_file.display(),
            samples = dataset.len(),
            min,
            max,
            "quality dataset loaded"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn records(&self) -> &[QualityRecord] {
        &self.records
    }

    /// Maps a raw score into `[0, 1]`; a dataset with a single distinct
    /// score maps everything to 0.
    pub fn normalize(&self, raw: f32) -> f32 {
        let range = self.max - self.min;
        if range > 0.0 {
            (raw - self.min) / range
        } else {
            0.0
        }
    }

    pub fn denormalize(&self, score: f32) -> f32 {
        score * (self.max - self.min) + self.min
    }

    /// Decodes sample `index` as a one-image grid with its normalised score.
    pub fn sample(&self, index: usize) -> PureResult<(FeatureGrid, f32)> {
        let record = self.records.get(index).ok_or(TensorError::InvalidValue {
            label: "dataset.index",
        })?;
        let path = self.image_dir.join(&record.name);
        debug!(path = %path.display(), "decoding sample");
        let image = load_rgb_image(&path, self.center_crop)?;
        Ok((image, record.score))
    }

    pub fn iter(&self) -> impl Iterator<Item = PureResult<(FeatureGrid, f32)>> + '_ {
        (0..self.len()).map(move |idx| self.sample(idx))
    }

    /// Consecutive batches of up to `size` samples, decoded in parallel.
    /// Images inside a batch must share a geometry, which `center_crop`
    /// guarantees.
    pub fn batches(
        &self,
        size: usize,
    ) -> PureResult<impl Iterator<Item = PureResult<(FeatureGrid, Vec<f32>)>> + '_> {
        if size == 0 {
            return Err(TensorError::InvalidValue {
                label: "dataset.batch_size",
            });
        }
        Ok((0..self.len()).step_by(size).map(move |start| {
            let end = (start + size).min(self.len());
            let samples = (start..end)
                .into_par_iter()
                .map(|idx| self.sample(idx))
                .collect::<PureResult<Vec<_>>>()?;
            let hw = samples[0].0.hw();
            let mut items = Vec::with_capacity(samples.len());
            let mut scores = Vec::with_capacity(samples.len());
            for (grid, score) in samples {
                items.extend(grid.into_features().into_items());
                scores.push(score);
            }
            Ok((FeatureGrid::from_items(items, hw)?, scores))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_with_trailing_commas() {
        let path = Path::new("labels.txt");
        assert_eq!(
            parse_line(path, 1, "I01_01_01.png, 4.57").unwrap(),
            Some(("I01_01_01.png".to_string(), 4.57))
        );
        assert_eq!(parse_line(path, 2, "   ").unwrap(), None);
        assert!(matches!(
            parse_line(path, 3, "I01.png, 4.5 extra"),
            Err(TensorError::DataIo { .. })
        ));
        assert!(matches!(
            parse_line(path, 4, "I01.png, high"),
            Err(TensorError::DataIo { .. })
        ));
    }

    #[test]
    fn scene_tags_are_character_ranges() {
        assert_eq!(scene_tag("I07_02_03.png", (1, 3)).as_deref(), Some("07"));
        assert_eq!(scene_tag("I", (1, 3)), None);
        assert_eq!(scene_tag("abc", (2, 2)), None);
    }
}
