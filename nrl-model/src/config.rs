use crate::{
    dataset::Dataset,
    error::{ModelError, ModelResult},
    network::NetworkConfig,
    optimizer::Adam,
    robot::JointLimits,
    trainer::TrainingConfig,
};
use nrl_utils::{load_json, Properties};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, str::FromStr};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub modelpath: PathBuf,
    pub datapath: PathBuf,
    pub network: String,
    pub robot: String,
    pub shuffle: bool,
    pub retrain: bool,
    pub greedy: bool,
    pub epochs: usize,
    pub log_interval: usize,
    pub dsoft: f32,
    pub sigma: f32,
    pub alpha: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub activejoints: Vec<usize>,
    pub nsamples: usize,
    pub d: Vec<usize>,
    pub z: Vec<usize>,
    pub t: Vec<f32>,
    pub w: Vec<f32>,
    pub w1: Vec<f32>,
    pub gen_time_thres: usize,
    pub seed: u64,
    pub noise: bool,
    pub jmin: Vec<f32>,
    pub jmax: Vec<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            modelpath: PathBuf::from("model"),
            datapath: PathBuf::from("data"),
            network: "pvrnn".to_string(),
            robot: "generic".to_string(),
            shuffle: false,
            retrain: false,
            greedy: true,
            epochs: 1000,
            log_interval: 1,
            dsoft: 10.0,
            sigma: 0.2,
            alpha: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            activejoints: Vec::new(),
            nsamples: 1,
            d: Vec::new(),
            z: Vec::new(),
            t: Vec::new(),
            w: Vec::new(),
            w1: Vec::new(),
            gen_time_thres: 3,
            seed: 0,
            noise: true,
            jmin: Vec::new(),
            jmax: Vec::new(),
        }
    }
}

fn invalid<E: Display>(key: &str) -> impl Fn(E) -> ModelError + '_ {
    move |e| ModelError::InvalidConfig {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn scalar<T>(props: &Properties, key: &str, target: &mut T) -> ModelResult<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = props.get::<T>(key).map_err(invalid(key))? {
        *target = value;
    }
    Ok(())
}

fn list<T>(props: &Properties, key: &str, target: &mut Vec<T>) -> ModelResult<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(values) = props.get_list::<T>(key).map_err(invalid(key))? {
        *target = values;
    }
    Ok(())
}

fn flag(props: &Properties, key: &str, target: &mut bool) -> ModelResult<()> {
    if let Some(value) = props.get_bool(key).map_err(invalid(key))? {
        *target = value;
    }
    Ok(())
}

impl ModelConfig {
    pub fn from_properties(props: &Properties) -> ModelResult<Self> {
        let mut c = Self::default();
        if let Some(path) = props.get_str("modelpath") {
            c.modelpath = PathBuf::from(path);
        }
        if let Some(path) = props.get_str("datapath") {
            c.datapath = PathBuf::from(path);
        }
        if let Some(network) = props.get_str("network") {
            c.network = network.to_string();
        }
        if let Some(robot) = props.get_str("robot") {
            c.robot = robot.to_string();
        }
        flag(props, "shuffle", &mut c.shuffle)?;
        flag(props, "retrain", &mut c.retrain)?;
        flag(props, "greedy", &mut c.greedy)?;
        flag(props, "noise", &mut c.noise)?;
        scalar(props, "epochs", &mut c.epochs)?;
        scalar(props, "log_interval", &mut c.log_interval)?;
        scalar(props, "dsoft", &mut c.dsoft)?;
        scalar(props, "sigma", &mut c.sigma)?;
        scalar(props, "alpha", &mut c.alpha)?;
        scalar(props, "beta1", &mut c.beta1)?;
        scalar(props, "beta2", &mut c.beta2)?;
        scalar(props, "nsamples", &mut c.nsamples)?;
        scalar(props, "gen_time_thres", &mut c.gen_time_thres)?;
        scalar(props, "seed", &mut c.seed)?;
        list(props, "activejoints", &mut c.activejoints)?;
        list(props, "d", &mut c.d)?;
        list(props, "z", &mut c.z)?;
        list(props, "t", &mut c.t)?;
        list(props, "w", &mut c.w)?;
        list(props, "w1", &mut c.w1)?;
        list(props, "jmin", &mut c.jmin)?;
        list(props, "jmax", &mut c.jmax)?;
        Ok(c)
    }

    /// `*.json` is read as json, anything else as a properties file.
    pub fn load(path: &str) -> ModelResult<Self> {
        if path.ends_with(".json") {
            load_json::<Self>(path).map_err(invalid(path))
        } else {
            let props = Properties::from_file(path).map_err(invalid(path))?;
            Self::from_properties(&props)
        }
    }

    pub fn network_config(&self) -> ModelResult<NetworkConfig> {
        if self.network.to_ascii_lowercase() != "pvrnn" {
            return Err(ModelError::InvalidConfig {
                key: "network".to_string(),
                reason: format!("unsupported network '{}'", self.network),
            });
        }
        Ok(NetworkConfig {
            d: self.d.clone(),
            z: self.z.clone(),
            tau: self.t.clone(),
            w: self.w.clone(),
            w1: self.w1.clone(),
            gen_time_thres: self.gen_time_thres,
            seed: self.seed,
            noise: self.noise,
        })
    }

    pub fn adam(&self) -> Adam {
        Adam::new(self.alpha, self.beta1, self.beta2)
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            shuffle: self.shuffle,
            greedy: self.greedy,
            retrain: self.retrain,
            log_interval: self.log_interval.max(1),
            adam: self.adam(),
        }
    }

    pub fn joint_limits(&self) -> ModelResult<JointLimits> {
        JointLimits::by_name(&self.robot, &self.jmin, &self.jmax)
    }

    pub fn dataset(&self) -> ModelResult<Dataset> {
        Dataset::new(&self.joint_limits()?, &self.activejoints, self.dsoft, self.sigma)
    }
}
