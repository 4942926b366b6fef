// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Weight checkpoints for any [`Module`], stored as JSON or bincode.

use crate::module::Module;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use wq_tensor::{PureResult, Tensor, TensorError};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

/// On-disk checkpoint. Keys are sorted so JSON checkpoints diff cleanly.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Checkpoint {
    format: u32,
    parameters: BTreeMap<String, StoredTensor>,
}

const CHECKPOINT_FORMAT: u32 = 1;

impl Checkpoint {
    fn from_state(state: &HashMap<String, Tensor>) -> Self {
        let parameters = state
            .iter()
            .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
            .collect();
        Self {
            format: CHECKPOINT_FORMAT,
            parameters,
        }
    }

    fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        if self.format != CHECKPOINT_FORMAT {
            return Err(TensorError::SerializationError {
                message: format!("unsupported checkpoint format {}", self.format),
            });
        }
        self.parameters
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.into_tensor()?)))
            .collect()
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

fn create(path: &Path) -> PureResult<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path).map_err(io_error)?))
}

fn open(path: &Path) -> PureResult<BufReader<File>> {
    Ok(BufReader::new(File::open(path).map_err(io_error)?))
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let mut writer = create(path.as_ref())?;
    serde_json::to_writer_pretty(&mut writer, &Checkpoint::from_state(state))
        .map_err(serde_error)?;
    writer.flush().map_err(io_error)
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let checkpoint: Checkpoint =
        serde_json::from_reader(open(path.as_ref())?).map_err(serde_error)?;
    checkpoint.into_state()
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let mut writer = create(path.as_ref())?;
    bincode::serialize_into(&mut writer, &Checkpoint::from_state(state)).map_err(serde_error)?;
    writer.flush().map_err(io_error)
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let checkpoint: Checkpoint =
        bincode::deserialize_from(open(path.as_ref())?).map_err(serde_error)?;
    checkpoint.into_state()
}

/// Writes every parameter of `module` as pretty-printed JSON.
pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

/// Restores `module` from a JSON checkpoint. Every parameter must be present.
pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}
