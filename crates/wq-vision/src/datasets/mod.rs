// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod quality;

pub use self::quality::{
    load_rgb_image, DatasetOptions, QualityDataset, QualityRecord, SamplePolicy,
};
