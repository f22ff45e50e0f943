use crate::{
    error::{ModelError, ModelResult},
    optimizer::{Optimizable, Slot},
};
use nrl_utils::{read_rows, write_rows};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub type NamedParams<'a> = Vec<(&'static str, &'a dyn Optimizable)>;
pub type NamedParamsMut<'a> = Vec<(&'static str, &'a mut dyn Optimizable)>;

/// File contents read from disk and checked against the target shapes, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    prefix: String,
    tensors: Vec<(&'static str, [Vec<f32>; 3])>,
}

pub fn tensor_path(dir: &Path, prefix: &str, name: &str, slot: Slot) -> PathBuf {
    dir.join(format!("{}_{}_{}.d", prefix, name, slot.suffix()))
}

pub fn ensure_dir(dir: &Path) -> ModelResult<()> {
    fs::create_dir_all(dir).map_err(|e| ModelError::Io {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn save(dir: &Path, prefix: &str, params: &NamedParams) -> ModelResult<()> {
    ensure_dir(dir)?;
    for (name, param) in params {
        for slot in Slot::ALL {
            let path = tensor_path(dir, prefix, name, slot);
            write_rows(&path, &param.export(slot), param.row_len()).map_err(|e| {
                ModelError::Io {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
    }
    Ok(())
}

pub fn stage(dir: &Path, prefix: &str, params: &NamedParams) -> ModelResult<Staged> {
    let mut tensors = Vec::with_capacity(params.len());
    for (name, param) in params {
        let mut slots: [Vec<f32>; 3] = Default::default();
        for (i, slot) in Slot::ALL.into_iter().enumerate() {
            let path = tensor_path(dir, prefix, name, slot);
            slots[i] = read_tensor(&path, param.len(), param.row_len())?;
        }
        tensors.push((*name, slots));
    }
    Ok(Staged {
        prefix: prefix.to_string(),
        tensors,
    })
}

/// Applies a [`Staged`] set produced from the same parameter list.
pub fn commit(staged: Staged, params: NamedParamsMut) -> ModelResult<()> {
    if staged.tensors.len() != params.len() {
        return Err(ModelError::DimensionMismatch {
            what: format!("staged tensors for '{}'", staged.prefix),
            expected: params.len(),
            actual: staged.tensors.len(),
        });
    }
    for ((_, slots), (_, param)) in staged.tensors.iter().zip(params) {
        for (slot, data) in Slot::ALL.into_iter().zip(slots.iter()) {
            param.import(slot, data);
        }
    }
    Ok(())
}

fn read_tensor(path: &Path, len: usize, row_len: usize) -> ModelResult<Vec<f32>> {
    if !path.exists() {
        return Err(ModelError::MissingParameterFile {
            path: path.to_path_buf(),
        });
    }
    let rows = read_rows(path).map_err(|e| ModelError::InvalidParameterFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if let Some(row) = rows.iter().find(|row| row.len() != row_len) {
        return Err(ModelError::InvalidParameterFile {
            path: path.to_path_buf(),
            reason: format!("expected rows of {} values, found {}", row_len, row.len()),
        });
    }
    let data: Vec<f32> = rows.into_iter().flatten().collect();
    if data.len() != len {
        return Err(ModelError::InvalidParameterFile {
            path: path.to_path_buf(),
            reason: format!("expected {} values, found {}", len, data.len()),
        });
    }
    Ok(data)
}
