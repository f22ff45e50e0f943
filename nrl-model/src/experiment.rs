use crate::{
    error::{ModelError, ModelResult},
    network::{Frame, Losses, Network, Sequence},
    optimizer::Adam,
};
use logging_timer::time;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ErrorRegressionConfig {
    /// Training sequence whose adaptive offsets seed generation burn-in.
    pub primitive: usize,
    pub window: usize,
    /// Optimisation iterations per observed frame.
    pub epochs: usize,
    /// Per-layer KL weights used inside the window.
    pub w: Vec<f32>,
    pub adam: Adam,
    /// Maximum number of states kept by the stores.
    pub num_times: usize,
    pub store_gen: bool,
    pub store_inference: bool,
}

impl Default for ErrorRegressionConfig {
    fn default() -> Self {
        Self {
            primitive: 0,
            window: 10,
            epochs: 50,
            w: Vec::new(),
            adam: Adam::new(0.1, 0.9, 0.999),
            num_times: 0,
            store_gen: false,
            store_inference: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PostdictionReport {
    pub best: Losses,
    /// Best loss after each iteration.
    pub trace: Vec<f32>,
    /// Adam step counter after this postdiction.
    pub step: usize,
}

/// Sliding-window postdiction over a model with experiment mode enabled.
#[derive(Debug, Clone)]
pub struct ErrorRegression {
    config: ErrorRegressionConfig,
    step: usize,
}

impl ErrorRegression {
    pub fn new(config: ErrorRegressionConfig) -> Self {
        Self { config, step: 1 }
    }

    pub fn config(&self) -> &ErrorRegressionConfig {
        &self.config
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Enables experiment mode. On failure the network is left disabled.
    pub fn enable(&mut self, net: &mut Network) -> ModelResult<()> {
        let w = if self.config.w.is_empty() {
            net.config().w.clone()
        } else {
            self.config.w.clone()
        };
        let c = &self.config;
        if let Err(e) = net.e_enable(c.primitive, c.window, &w, c.num_times, c.store_gen, c.store_inference) {
            log::warn!("error regression not enabled: {}", e);
            return Err(e);
        }
        self.step = 1;
        log::info!(
            "error regression enabled: primitive {}, window {}, {} epochs per frame",
            c.primitive,
            c.window,
            c.epochs
        );
        Ok(())
    }

    /// Fits the window offsets to `targets`, then commits the best iteration.
    ///
    /// Returns `None` while fewer frames than the window have been generated.
    #[time]
    pub fn postdict(&mut self, net: &mut Network, targets: &Sequence) -> ModelResult<Option<PostdictionReport>> {
        if !net.e_init_forward()? {
            return Ok(None);
        }
        let window = net.e_window()?;
        if targets.len() != window {
            return Err(ModelError::DimensionMismatch {
                what: "postdiction window".to_string(),
                expected: window,
                actual: targets.len(),
            });
        }
        let mut best = Losses {
            loss: f32::INFINITY,
            ..Default::default()
        };
        let mut trace = Vec::with_capacity(self.config.epochs);
        for _ in 0..self.config.epochs {
            let x = net.e_forward()?;
            let losses = net.e_backward(&x, targets)?;
            if losses.loss < best.loss {
                best = losses;
                // copied before the update so the offsets match the states that scored `best`
                net.e_copy_param()?;
            }
            net.e_opt_adam(self.step, &self.config.adam)?;
            self.step += 1;
            trace.push(best.loss);
        }
        if trace.is_empty() {
            // no iteration ran, keep the current window as the optimum
            net.e_forward()?;
            net.e_copy_param()?;
        }
        net.e_overwrite_param()?;
        log::debug!("postdiction at step {}: loss {}", self.step, best.loss);
        Ok(Some(PostdictionReport {
            best,
            trace,
            step: self.step,
        }))
    }
}

/// Online loop: predict the next frame, observe it, and postdict over the
/// most recent `window` observations.
#[derive(Debug, Clone)]
pub struct OnlineSession {
    regression: ErrorRegression,
    observed: VecDeque<Frame>,
}

impl OnlineSession {
    pub fn start(net: &mut Network, config: ErrorRegressionConfig) -> ModelResult<Self> {
        let mut regression = ErrorRegression::new(config);
        regression.enable(net)?;
        let window = regression.config().window;
        Ok(Self {
            regression,
            observed: VecDeque::with_capacity(window),
        })
    }

    pub fn regression(&self) -> &ErrorRegression {
        &self.regression
    }

    pub fn predict(&mut self, net: &mut Network) -> ModelResult<Frame> {
        net.e_generate()
    }

    pub fn observe(&mut self, net: &mut Network, frame: Frame) -> ModelResult<Option<PostdictionReport>> {
        let window = self.regression.config().window;
        if self.observed.len() == window {
            self.observed.pop_front();
        }
        self.observed.push_back(frame);
        if self.observed.len() < window {
            return Ok(None);
        }
        let targets: Sequence = self.observed.iter().cloned().collect();
        self.regression.postdict(net, &targets)
    }
}
