use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};

const TOROBO_MIN: [f32; 16] = [
    -65.0, -40.0, -155.0, -45.0, -155.0, -100.0, -65.0, -40.0, -155.0, -45.0, -155.0, -100.0,
    -75.0, -20.0, -85.0, -40.0,
];
const TOROBO_MAX: [f32; 16] = [
    245.0, 100.0, 155.0, 110.0, 155.0, 100.0, 245.0, 100.0, 155.0, 110.0, 155.0, 100.0, 75.0,
    50.0, 85.0, 40.0,
];

/// Per-joint value range of a robot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointLimits {
    pub name: String,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl JointLimits {
    pub fn cartesian() -> Self {
        Self {
            name: "cartesian".to_string(),
            min: vec![-50.0; 3],
            max: vec![50.0; 3],
        }
    }

    pub fn torobo() -> Self {
        Self {
            name: "torobo".to_string(),
            min: TOROBO_MIN.to_vec(),
            max: TOROBO_MAX.to_vec(),
        }
    }

    pub fn generic(min: Vec<f32>, max: Vec<f32>) -> ModelResult<Self> {
        let limits = Self {
            name: "generic".to_string(),
            min,
            max,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// `generic` takes its limits from `min`/`max`; the named robots ignore them.
    pub fn by_name(name: &str, min: &[f32], max: &[f32]) -> ModelResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cartesian" => Ok(Self::cartesian()),
            "torobo" => Ok(Self::torobo()),
            "generic" => Self::generic(min.to_vec(), max.to_vec()),
            other => Err(ModelError::InvalidConfig {
                key: "robot".to_string(),
                reason: format!("unknown robot '{}'", other),
            }),
        }
    }

    pub fn dof(&self) -> usize {
        self.min.len()
    }

    pub fn range(&self, joint: usize) -> f32 {
        self.max[joint] - self.min[joint]
    }

    fn validate(&self) -> ModelResult<()> {
        if self.min.is_empty() || self.min.len() != self.max.len() {
            return Err(ModelError::InvalidConfig {
                key: "jmin/jmax".to_string(),
                reason: format!(
                    "need one min and one max per joint, got {} and {}",
                    self.min.len(),
                    self.max.len()
                ),
            });
        }
        if let Some(joint) = (0..self.dof()).find(|&j| !(self.range(j) > 0.0)) {
            return Err(ModelError::InvalidConfig {
                key: "jmin/jmax".to_string(),
                reason: format!("joint {} has an empty range", joint),
            });
        }
        Ok(())
    }
}
