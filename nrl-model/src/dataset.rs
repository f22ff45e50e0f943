use crate::{
    error::{ModelError, ModelResult},
    network::{DataShape, Frame, Sequence},
    robot::JointLimits,
    utils::NON_ZERO,
};
use ndarray::Array1;
use nrl_utils::read_rows;
use std::path::Path;

pub const DEFAULT_PREFIX: &str = "primitive";

/// Soft categorical code of one joint.
#[derive(Debug, Clone, PartialEq)]
pub struct JointEncoding {
    pub min: f32,
    pub range: f32,
    /// Reference points evenly spread over `[0, 1]`.
    pub references: Array1<f32>,
}

/// Raw trajectories grouped by primitive, with the encoding of the active joints.
///
/// `primitives[p][s][t][j]` is joint `j` at step `t` of sample `s` of primitive `p`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    dof: usize,
    active: Vec<usize>,
    joints: Vec<JointEncoding>,
    sigma: f32,
    primitives: Vec<Vec<Vec<Vec<f32>>>>,
}

impl Dataset {
    /// `active` lists joint indices; empty selects every joint.
    pub fn new(limits: &JointLimits, active: &[usize], dsoft: f32, sigma: f32) -> ModelResult<Self> {
        if !(dsoft > 0.0) || !(sigma > 0.0) {
            return Err(ModelError::InvalidConfig {
                key: "dsoft/sigma".to_string(),
                reason: format!("must be positive, got {} / {}", dsoft, sigma),
            });
        }
        let active: Vec<usize> = if active.is_empty() {
            (0..limits.dof()).collect()
        } else {
            active.to_vec()
        };
        if let Some(&joint) = active.iter().find(|&&j| j >= limits.dof()) {
            return Err(ModelError::InvalidConfig {
                key: "activejoints".to_string(),
                reason: format!("joint {} does not exist on '{}'", joint, limits.name),
            });
        }
        let joints = active
            .iter()
            .map(|&j| {
                let range = limits.range(j);
                let units = ((range / dsoft).ceil() as usize).max(1);
                JointEncoding {
                    min: limits.min[j],
                    range,
                    references: Array1::linspace(0.0, 1.0, units),
                }
            })
            .collect();
        Ok(Self {
            dof: limits.dof(),
            active,
            joints,
            sigma,
            primitives: Vec::new(),
        })
    }

    pub fn active_joints(&self) -> &[usize] {
        &self.active
    }

    pub fn n_prim(&self) -> usize {
        self.primitives.len()
    }

    pub fn prim_length(&self) -> usize {
        self.primitives
            .first()
            .and_then(|samples| samples.first())
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn n_units_per_dim(&self) -> Vec<usize> {
        self.joints.iter().map(|j| j.references.len()).collect()
    }

    pub fn shape(&self) -> DataShape {
        DataShape {
            prim_num: self.n_prim(),
            prim_len: self.prim_length(),
            units_per_dim: self.n_units_per_dim(),
        }
    }

    /// Keeps the active columns of a row holding either every joint or only the active ones.
    fn select(&self, row: &[f32]) -> ModelResult<Vec<f32>> {
        if row.len() == self.dof {
            Ok(self.active.iter().map(|&j| row[j]).collect())
        } else if row.len() == self.active.len() {
            Ok(row.to_vec())
        } else {
            Err(ModelError::InvalidDataset {
                reason: format!(
                    "frame has {} values, expected {} or {}",
                    row.len(),
                    self.dof,
                    self.active.len()
                ),
            })
        }
    }

    /// Adds one primitive made of equally long samples.
    pub fn push_primitive(&mut self, samples: Vec<Vec<Vec<f32>>>) -> ModelResult<()> {
        let len = match samples.first() {
            Some(sample) if !sample.is_empty() => sample.len(),
            _ => {
                return Err(ModelError::InvalidDataset {
                    reason: format!("primitive {} has no frames", self.primitives.len()),
                })
            }
        };
        if self.n_prim() > 0 && len != self.prim_length() {
            return Err(ModelError::InvalidDataset {
                reason: format!(
                    "primitive {} has {} steps, expected {}",
                    self.primitives.len(),
                    len,
                    self.prim_length()
                ),
            });
        }
        let mut selected = Vec::with_capacity(samples.len());
        for sample in samples {
            if sample.len() != len {
                return Err(ModelError::InvalidDataset {
                    reason: format!("samples of primitive {} differ in length", self.primitives.len()),
                });
            }
            selected.push(
                sample
                    .iter()
                    .map(|row| self.select(row))
                    .collect::<ModelResult<Vec<_>>>()?,
            );
        }
        self.primitives.push(selected);
        Ok(())
    }

    /// Reads `{prefix}_{p}_{s}.csv` for `p = 0, 1, ...` until a primitive is missing.
    pub fn load_dir(&mut self, dir: &Path, prefix: &str, n_samples: usize) -> ModelResult<()> {
        let n_samples = n_samples.max(1);
        let mut p = self.primitives.len();
        loop {
            let first = dir.join(format!("{}_{}_0.csv", prefix, p));
            if !first.exists() {
                break;
            }
            let mut samples = Vec::with_capacity(n_samples);
            for s in 0..n_samples {
                let path = dir.join(format!("{}_{}_{}.csv", prefix, p, s));
                let rows = read_rows(&path).map_err(|e| ModelError::InvalidDataset {
                    reason: e.to_string(),
                })?;
                samples.push(rows);
            }
            self.push_primitive(samples)?;
            p += 1;
        }
        if self.primitives.is_empty() {
            return Err(ModelError::InvalidDataset {
                reason: format!("no '{}_0_0.csv' in {}", prefix, dir.display()),
            });
        }
        log::info!(
            "loaded {} primitives of {} steps from {}",
            self.n_prim(),
            self.prim_length(),
            dir.display()
        );
        Ok(())
    }

    /// Encodes one frame of active-joint values.
    pub fn encode_frame(&self, values: &[f32]) -> Frame {
        self.joints
            .iter()
            .zip(values)
            .map(|(joint, &x)| {
                let v = (x - joint.min) / joint.range;
                let sigma2 = self.sigma * self.sigma;
                let e = joint.references.mapv(|r| (-(r - v) * (r - v) / sigma2).exp());
                let sum = e.sum() + NON_ZERO;
                e / sum
            })
            .collect()
    }

    /// Encodes frames holding either every joint or only the active ones.
    pub fn encode_softmax(&self, frames: &[Vec<f32>]) -> ModelResult<Sequence> {
        frames
            .iter()
            .map(|row| Ok(self.encode_frame(&self.select(row)?)))
            .collect()
    }

    pub fn decode_softmax(&self, p: &Array1<f32>, dim: usize) -> f32 {
        let joint = &self.joints[dim];
        joint.references.dot(p) * joint.range + joint.min
    }

    pub fn decode_frame(&self, frame: &Frame) -> Vec<f32> {
        frame
            .iter()
            .enumerate()
            .map(|(dim, p)| self.decode_softmax(p, dim))
            .collect()
    }

    /// Every sample of every primitive, encoded.
    pub fn encoded(&self) -> Vec<Vec<Sequence>> {
        self.primitives
            .iter()
            .map(|samples| {
                samples
                    .iter()
                    .map(|frames| frames.iter().map(|f| self.encode_frame(f)).collect())
                    .collect()
            })
            .collect()
    }

    pub fn raw(&self, prim: usize) -> Option<&Vec<Vec<Vec<f32>>>> {
        self.primitives.get(prim)
    }
}
