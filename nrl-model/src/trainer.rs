use crate::{
    error::{ModelError, ModelResult},
    network::{Losses, Network, Sequence},
    optimizer::Adam,
};
use logging_timer::time;
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

pub const EPOCH_FILE: &str = "epoch.d";
pub const TRAINING_LOG: &str = "training.txt";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub shuffle: bool,
    /// Save only when the loss improves.
    pub greedy: bool,
    pub retrain: bool,
    pub log_interval: usize,
    pub adam: Adam,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1000,
            shuffle: false,
            greedy: true,
            retrain: false,
            log_interval: 1,
            adam: Adam::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub elapsed_ms: u128,
    pub rec: f32,
    pub rec_gen: f32,
    pub reg: f32,
    pub loss: f32,
    pub saved: bool,
}

impl EpochReport {
    pub fn to_row(&self) -> String {
        format!(
            "{}, {}, {}, {}, {}, {}",
            self.epoch, self.elapsed_ms, self.rec, self.rec_gen, self.reg, self.loss
        )
    }
}

/// Full-batch trainer. `data[p]` holds the encoded samples of primitive `p`.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
    model_dir: Option<PathBuf>,
    step: usize,
    best_loss: f32,
    rng: SmallRng,
}

fn io_error(path: &Path, e: impl ToString) -> ModelError {
    ModelError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Parses the `step,loss` record written next to saved parameters.
pub fn read_epoch_file(dir: &Path) -> ModelResult<(usize, f32)> {
    let path = dir.join(EPOCH_FILE);
    let text = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
    let bad = |reason: &str| ModelError::InvalidParameterFile {
        path: path.clone(),
        reason: reason.to_string(),
    };
    let (step, loss) = text
        .trim()
        .split_once(',')
        .ok_or_else(|| bad("expected 'step,loss'"))?;
    let step = step.trim().parse::<usize>().map_err(|_| bad("invalid step"))?;
    let loss = loss.trim().parse::<f32>().map_err(|_| bad("invalid loss"))?;
    Ok((step, loss))
}

impl Trainer {
    /// Without a model directory nothing is written to disk.
    pub fn new(config: TrainingConfig, model_dir: Option<PathBuf>, seed: u64) -> Self {
        Self {
            config,
            model_dir,
            step: 0,
            best_loss: f32::INFINITY,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    /// Restores parameters and the step counter from the model directory.
    pub fn resume(&mut self, net: &mut Network) -> ModelResult<()> {
        let dir = match &self.model_dir {
            Some(dir) => dir.clone(),
            None => {
                return Err(ModelError::InvalidConfig {
                    key: "modelpath".to_string(),
                    reason: "retraining needs a model directory".to_string(),
                })
            }
        };
        let (step, loss) = read_epoch_file(&dir)?;
        net.load(&dir)?;
        self.step = step;
        self.best_loss = loss;
        log::info!("resuming from epoch {} with loss {}", step, loss);
        Ok(())
    }

    /// Forward every primitive, backward every primitive, then one Adam step.
    #[time]
    pub fn run_epoch(&mut self, net: &mut Network, data: &[Vec<Sequence>]) -> ModelResult<Losses> {
        let mut order: Vec<usize> = (0..data.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        let mut outputs = Vec::with_capacity(order.len());
        for &p in &order {
            outputs.push(net.t_forward(p)?);
        }
        let mut losses = Losses::default();
        for (&p, x) in order.iter().zip(&outputs) {
            losses += net.t_backward(p, x, &data[p])?;
        }
        self.step += 1;
        net.t_opt_adam(self.step, &self.config.adam);
        Ok(losses)
    }

    /// Runs the configured number of epochs and reports every `log_interval`.
    pub fn train(&mut self, net: &mut Network, data: &[Vec<Sequence>]) -> ModelResult<Vec<EpochReport>> {
        if self.config.retrain {
            self.resume(net)?;
        }
        let start = Instant::now();
        let interval = self.config.log_interval.max(1);
        let mut reports = Vec::new();
        for _ in 0..self.config.epochs {
            let losses = self.run_epoch(net, data)?;
            if self.step % interval != 0 {
                continue;
            }
            let mut rec_gen = 0.0;
            for (p, samples) in data.iter().enumerate() {
                let generated = net.t_generate(p)?;
                rec_gen += net.rec_error(&generated, samples);
            }
            let saved = self.maybe_save(net, losses.loss)?;
            let report = EpochReport {
                epoch: self.step,
                elapsed_ms: start.elapsed().as_millis(),
                rec: losses.rec,
                rec_gen,
                reg: losses.reg,
                loss: losses.loss,
                saved,
            };
            log::info!("{}", report.to_row());
            self.append_log(&report)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn maybe_save(&mut self, net: &Network, loss: f32) -> ModelResult<bool> {
        let improved = loss < self.best_loss;
        if improved {
            self.best_loss = loss;
        }
        if self.config.greedy && !improved {
            return Ok(false);
        }
        let dir = match &self.model_dir {
            Some(dir) => dir,
            None => return Ok(false),
        };
        net.save(dir)?;
        let path = dir.join(EPOCH_FILE);
        fs::write(&path, format!("{},{}\n", self.step, loss)).map_err(|e| io_error(&path, e))?;
        Ok(true)
    }

    fn append_log(&self, report: &EpochReport) -> ModelResult<()> {
        let dir = match &self.model_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        let path = dir.join(TRAINING_LOG);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        writeln!(file, "{}", report.to_row()).map_err(|e| io_error(&path, e))
    }
}
