use crate::{
    context::Context,
    error::{ModelError, ModelResult},
    layer::{Layer, LayerConfig},
    optimizer::{optimize, Adam, Optimizable, Param},
    store::{self, NamedParams, NamedParamsMut, Staged},
    utils::{add_outer, kaiming_uniform, softmax, uniform_bias, Noise, NON_ZERO},
};
use logging_timer::time;
use ndarray::{Array1, Ix1, Ix2};
use serde::{Deserialize, Serialize};
use std::{ops::AddAssign, path::Path};

/// One decoded time step: a categorical distribution per output dimension.
pub type Frame = Vec<Array1<f32>>;
pub type Sequence = Vec<Frame>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub d: Vec<usize>,
    pub z: Vec<usize>,
    pub tau: Vec<f32>,
    pub w: Vec<f32>,
    /// First-step KL weights. Empty means `w`.
    #[serde(default)]
    pub w1: Vec<f32>,
    pub gen_time_thres: usize,
    pub seed: u64,
    pub noise: bool,
}

impl NetworkConfig {
    pub fn layer_num(&self) -> usize {
        self.d.len()
    }

    fn checksum(&self) -> ModelResult<()> {
        let layer_num = self.layer_num();
        if layer_num == 0 {
            return Err(ModelError::InvalidConfig {
                key: "d".to_string(),
                reason: "at least one layer is required".to_string(),
            });
        }
        let mut lists = vec![
            ("z", self.z.len()),
            ("t", self.tau.len()),
            ("w", self.w.len()),
        ];
        if !self.w1.is_empty() {
            lists.push(("w1", self.w1.len()));
        }
        for (key, actual) in lists {
            if actual != layer_num {
                return Err(ModelError::ChecksumMismatch {
                    key: key.to_string(),
                    expected: layer_num,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn w1(&self) -> &[f32] {
        if self.w1.is_empty() {
            &self.w
        } else {
            &self.w1
        }
    }
}

/// Sizes the network takes from the dataset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataShape {
    pub prim_num: usize,
    pub prim_len: usize,
    pub units_per_dim: Vec<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct Losses {
    pub rec: f32,
    pub reg: f32,
    pub loss: f32,
}

impl AddAssign for Losses {
    fn add_assign(&mut self, other: Self) {
        self.rec += other.rec;
        self.reg += other.reg;
        self.loss += other.loss;
    }
}

impl Losses {
    pub fn is_finite(&self) -> bool {
        self.rec.is_finite() && self.reg.is_finite() && self.loss.is_finite()
    }
}

/// Linear + softmax decoder for one output dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputHead {
    pub w: Param<Ix2>,
    pub b: Param<Ix1>,
}

impl OutputHead {
    pub fn decode(&self, d: &Array1<f32>) -> Array1<f32> {
        softmax(&(self.w.value.dot(d) + &self.b.value))
    }

    fn named(&self) -> NamedParams {
        vec![
            ("w", &self.w as &dyn Optimizable),
            ("b", &self.b as &dyn Optimizable),
        ]
    }

    fn named_mut(&mut self) -> NamedParamsMut {
        vec![
            ("w", &mut self.w as &mut dyn Optimizable),
            ("b", &mut self.b as &mut dyn Optimizable),
        ]
    }
}

/// Σ y·ln(y/x) over one categorical distribution.
pub fn cross_entropy(x: &Array1<f32>, y: &Array1<f32>) -> f32 {
    x.iter()
        .zip(y.iter())
        .map(|(&x, &y)| y * (y / (x + NON_ZERO) + NON_ZERO).ln())
        .sum()
}

#[derive(Debug, Clone, PartialEq)]
struct Window {
    seq: usize,
    size: usize,
    cur_time: usize,
}

/// Stack of layers, index 0 at the bottom, with one decoding head per output dimension.
#[derive(Debug, Clone)]
pub struct Network {
    config: NetworkConfig,
    shape: DataShape,
    layers: Vec<Layer>,
    contexts: Vec<Context>,
    heads: Vec<OutputHead>,
    rec_coef: f32,
    reg_coef: f32,
    noise: Noise,
    window: Option<Window>,
}

impl Network {
    pub fn new(config: NetworkConfig, shape: DataShape) -> ModelResult<Self> {
        config.checksum()?;
        if shape.units_per_dim.is_empty() || shape.units_per_dim.iter().any(|&u| u == 0) {
            return Err(ModelError::InvalidConfig {
                key: "units_per_dim".to_string(),
                reason: format!("{:?} needs at least one unit per dimension", shape.units_per_dim),
            });
        }
        let mut noise = Noise::new(config.seed);
        noise.set_enabled(config.noise);
        let z_sum: usize = config.z.iter().sum();
        let layer_num = config.layer_num();
        let w1 = config.w1().to_vec();

        let mut layers = Vec::with_capacity(layer_num);
        let mut contexts = Vec::with_capacity(layer_num);
        for l in 0..layer_num {
            let d_num_top = if l + 1 < layer_num { config.d[l + 1] } else { 0 };
            let layer = Layer::new(
                LayerConfig {
                    id: l,
                    d_num: config.d[l],
                    d_num_top,
                    z_num: config.z[l],
                    z_sum,
                    tau: config.tau[l],
                    prim_num: shape.prim_num,
                    prim_len: shape.prim_len,
                    w: config.w[l],
                    w1: w1[l],
                    gen_time_thres: config.gen_time_thres,
                },
                noise.rng(),
            )?;
            contexts.push(Context::new(config.d[l], d_num_top));
            layers.push(layer);
        }

        let d0 = config.d[0];
        let heads = shape
            .units_per_dim
            .iter()
            .map(|&units| OutputHead {
                w: Param::new(kaiming_uniform(noise.rng(), units, d0, 1.0)),
                b: Param::new(uniform_bias(noise.rng(), units)),
            })
            .collect::<Vec<_>>();

        Ok(Self {
            rec_coef: 1.0 / heads.len() as f32,
            reg_coef: 1.0 / z_sum as f32,
            config,
            shape,
            layers,
            contexts,
            heads,
            noise,
            window: None,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn shape(&self) -> &DataShape {
        &self.shape
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn heads(&self) -> &[OutputHead] {
        &self.heads
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn set_noise(&mut self, enabled: bool) {
        self.noise.set_enabled(enabled);
    }

    pub fn state_dim(&self) -> usize {
        self.layers.iter().map(Layer::state_dim).sum()
    }

    fn check_seq(&self, seq: usize) -> ModelResult<()> {
        if seq < self.shape.prim_num {
            Ok(())
        } else {
            Err(ModelError::InvalidSequence {
                index: seq,
                num_sequences: self.shape.prim_num,
            })
        }
    }

    fn check_frames(&self, what: &str, frames: &[Frame], len: usize) -> ModelResult<()> {
        if frames.len() < len {
            return Err(ModelError::DimensionMismatch {
                what: format!("{} length", what),
                expected: len,
                actual: frames.len(),
            });
        }
        for frame in &frames[..len] {
            if frame.len() != self.heads.len() {
                return Err(ModelError::DimensionMismatch {
                    what: format!("{} output dimensions", what),
                    expected: self.heads.len(),
                    actual: frame.len(),
                });
            }
            for (dist, &units) in frame.iter().zip(&self.shape.units_per_dim) {
                if dist.len() != units {
                    return Err(ModelError::DimensionMismatch {
                        what: format!("{} units", what),
                        expected: units,
                        actual: dist.len(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn decode(&self, d0: &Array1<f32>) -> Frame {
        self.heads.iter().map(|head| head.decode(d0)).collect()
    }

    /// Copies each layer's previous deterministic state into the context of the layer below.
    fn refresh_top_context<F>(&mut self, previous: F)
    where
        F: Fn(&Layer) -> (Array1<f32>, Array1<f32>),
    {
        for l in (0..self.layers.len().saturating_sub(1)).rev() {
            let (dp, dq) = previous(&self.layers[l + 1]);
            self.contexts[l].dp_top = dp;
            self.contexts[l].dq_top = dq;
        }
    }

    /// Copies each layer's recurrent gradient from step `t+1` into the layer above.
    fn refresh_context_gradient(&mut self) {
        for l in 1..self.layers.len() {
            if let Some((g_dp, g_dq)) = self.layers[l - 1].top_feedback() {
                self.contexts[l].g_dp_context = g_dp;
                self.contexts[l].g_dq_context = g_dq;
            }
        }
    }

    /// Reconstruction term and the bottom-layer gradient of one frame.
    fn output_gradient(&mut self, x: &Frame, y: &Frame, d0: &Array1<f32>, accumulate: bool) -> f32 {
        let mut rec = 0.0;
        let mut g_dqloss = Array1::zeros(d0.len());
        for ((head, x), y) in self.heads.iter_mut().zip(x).zip(y) {
            rec += cross_entropy(x, y);
            let gx = (x - y) * self.rec_coef;
            g_dqloss += &head.w.value.t().dot(&gx);
            if accumulate {
                add_outer(&mut head.w.grad, 1.0, &gx, d0);
                head.b.grad += &gx;
            }
        }
        self.contexts[0].g_dqloss = g_dqloss;
        rec
    }

    fn totals(&self, rec: f32, reg: f32) -> Losses {
        Losses {
            rec,
            reg,
            loss: self.rec_coef * rec + self.reg_coef * reg,
        }
    }

    // ---- training mode ----

    /// Posterior pass over training sequence `seq`, decoded at every step.
    #[time]
    pub fn t_forward(&mut self, seq: usize) -> ModelResult<Sequence> {
        self.check_seq(seq)?;
        for layer in self.layers.iter_mut() {
            layer.init_context(seq)?;
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear();
        }
        let mut out = Vec::with_capacity(self.shape.prim_len);
        for t in 0..self.shape.prim_len {
            self.refresh_top_context(|layer| match layer.trajectory(seq) {
                Some(traj) => (traj.p.last_d().clone(), traj.q.last_d().clone()),
                None => (Array1::zeros(layer.d_num()), Array1::zeros(layer.d_num())),
            });
            for l in (0..self.layers.len()).rev() {
                self.layers[l].t_forward(t, seq, &self.contexts[l], &mut self.noise)?;
            }
            out.push(self.bottom_frame(seq, true));
        }
        Ok(out)
    }

    /// Closed-loop prior generation over the length of sequence `seq`.
    pub fn t_generate(&mut self, seq: usize) -> ModelResult<Sequence> {
        self.check_seq(seq)?;
        for layer in self.layers.iter_mut() {
            layer.init_context(seq)?;
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear();
        }
        let mut out = Vec::with_capacity(self.shape.prim_len);
        for t in 0..self.shape.prim_len {
            self.refresh_top_context(|layer| match layer.trajectory(seq) {
                Some(traj) => (traj.p.last_d().clone(), traj.q.last_d().clone()),
                None => (Array1::zeros(layer.d_num()), Array1::zeros(layer.d_num())),
            });
            for l in (0..self.layers.len()).rev() {
                self.layers[l].t_generate(t, seq, &self.contexts[l], &mut self.noise)?;
            }
            out.push(self.bottom_frame(seq, false));
        }
        Ok(out)
    }

    fn bottom_frame(&self, seq: usize, posterior: bool) -> Frame {
        match self.layers[0].trajectory(seq) {
            Some(traj) if posterior => self.decode(traj.q.last_d()),
            Some(traj) => self.decode(traj.p.last_d()),
            None => Vec::new(),
        }
    }

    /// Reverse sweep of sequence `seq` against each of its target samples.
    ///
    /// Gradients accumulate until [`Network::t_opt_adam`].
    #[time]
    pub fn t_backward(&mut self, seq: usize, x: &Sequence, targets: &[Sequence]) -> ModelResult<Losses> {
        self.check_seq(seq)?;
        let len = self.shape.prim_len;
        self.check_frames("prediction", x, len)?;
        for y in targets {
            self.check_frames("target", y, len)?;
        }
        let trained = self.layers[0]
            .trajectory(seq)
            .map(|traj| traj.steps())
            .unwrap_or(0);
        if trained < len {
            return Err(ModelError::DimensionMismatch {
                what: format!("forward steps of sequence {}", seq),
                expected: len,
                actual: trained,
            });
        }

        let (mut rec, mut reg) = (0.0, 0.0);
        for y in targets {
            for layer in self.layers.iter_mut() {
                layer.t_init_backward();
            }
            for ctx in self.contexts.iter_mut() {
                ctx.clear_gradients();
            }
            for k in (1..=len).rev() {
                self.refresh_context_gradient();
                let d0 = self.layers[0]
                    .trajectory(seq)
                    .map(|traj| traj.q.d[k].clone())
                    .ok_or(ModelError::InvalidSequence {
                        index: seq,
                        num_sequences: self.shape.prim_num,
                    })?;
                rec += self.output_gradient(&x[k - 1], &y[k - 1], &d0, true);
                for l in 0..self.layers.len() {
                    self.layers[l].t_backward(k, seq, &self.contexts[l])?;
                    reg += self.layers[l].weighted_kld(seq, k);
                }
            }
        }
        Ok(self.totals(rec, reg))
    }

    /// Adam on every head and layer tensor. Call once all sequences of the batch are accumulated.
    pub fn t_opt_adam(&mut self, step: usize, adam: &Adam) {
        for head in self.heads.iter_mut() {
            optimize(head.named_mut().into_iter().map(|(_, p)| p), adam, step);
        }
        for layer in self.layers.iter_mut() {
            layer.t_opt_adam(step, adam);
        }
    }

    pub fn zero_grad(&mut self) {
        for head in self.heads.iter_mut() {
            for (_, param) in head.named_mut() {
                param.zero_grad();
            }
        }
        for layer in self.layers.iter_mut() {
            layer.zero_grad();
        }
    }

    /// Mean reconstruction error of `x` against each sample, scaled like the training loss.
    pub fn rec_error(&self, x: &Sequence, targets: &[Sequence]) -> f32 {
        if targets.is_empty() {
            return 0.0;
        }
        let total: f32 = targets
            .iter()
            .map(|y| {
                x.iter()
                    .zip(y)
                    .flat_map(|(fx, fy)| fx.iter().zip(fy).map(|(px, py)| cross_entropy(px, py)))
                    .sum::<f32>()
            })
            .sum();
        self.rec_coef * total / targets.len() as f32
    }

    /// Every learnable tensor, heads first, named after its parameter file prefix.
    pub fn params(&self) -> Vec<(String, &dyn Optimizable)> {
        let mut params = Vec::new();
        for (o, head) in self.heads.iter().enumerate() {
            for (name, param) in head.named() {
                params.push((format!("o{}_{}", o, name), param));
            }
        }
        for layer in &self.layers {
            let prefix = layer.prefix();
            for (name, param) in layer.named_params() {
                params.push((format!("{}_{}", prefix, name), param));
            }
        }
        params
    }

    pub fn params_mut(&mut self) -> Vec<(String, &mut dyn Optimizable)> {
        let mut params = Vec::new();
        for (o, head) in self.heads.iter_mut().enumerate() {
            for (name, param) in head.named_mut() {
                params.push((format!("o{}_{}", o, name), param));
            }
        }
        for layer in self.layers.iter_mut() {
            let prefix = layer.prefix();
            for (name, param) in layer.named_params_mut() {
                params.push((format!("{}_{}", prefix, name), param));
            }
        }
        params
    }

    // ---- persistence ----

    pub fn save(&self, dir: &Path) -> ModelResult<()> {
        for (o, head) in self.heads.iter().enumerate() {
            store::save(dir, &format!("o{}", o), &head.named())?;
        }
        for layer in &self.layers {
            layer.save(dir)?;
        }
        Ok(())
    }

    /// Stages every file before committing, so a failed load leaves the model untouched.
    pub fn load(&mut self, dir: &Path) -> ModelResult<()> {
        let heads: Vec<Staged> = self
            .heads
            .iter()
            .enumerate()
            .map(|(o, head)| store::stage(dir, &format!("o{}", o), &head.named()))
            .collect::<ModelResult<_>>()?;
        let layers: Vec<Staged> = self
            .layers
            .iter()
            .map(|layer| layer.stage(dir))
            .collect::<ModelResult<_>>()?;
        for (head, staged) in self.heads.iter_mut().zip(heads) {
            store::commit(staged, head.named_mut())?;
        }
        for (layer, staged) in self.layers.iter_mut().zip(layers) {
            layer.commit(staged)?;
        }
        log::info!("loaded parameters from {}", dir.display());
        Ok(())
    }

    // ---- experiment mode ----

    /// Allocates the error-regression window on every layer. On failure no layer stays enabled.
    pub fn e_enable(
        &mut self,
        seq: usize,
        window: usize,
        w: &[f32],
        num_times: usize,
        store_gen: bool,
        store_inference: bool,
    ) -> ModelResult<()> {
        self.e_disable();
        self.check_seq(seq)?;
        if w.len() != self.layers.len() {
            return Err(ModelError::ChecksumMismatch {
                key: "w".to_string(),
                expected: self.layers.len(),
                actual: w.len(),
            });
        }
        for (layer, &w) in self.layers.iter_mut().zip(w) {
            if let Err(e) = layer.e_enable(seq, window, w, num_times, store_gen, store_inference) {
                self.e_disable();
                return Err(e);
            }
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear();
        }
        self.window = Some(Window {
            seq,
            size: window,
            cur_time: 0,
        });
        Ok(())
    }

    pub fn e_disable(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.e_disable();
        }
        self.window = None;
    }

    pub fn e_enabled(&self) -> bool {
        self.window.is_some()
    }

    fn window(&self) -> ModelResult<&Window> {
        self.window.as_ref().ok_or(ModelError::ExperimentDisabled)
    }

    pub fn e_window(&self) -> ModelResult<usize> {
        Ok(self.window()?.size)
    }

    pub fn e_cur_time(&self) -> ModelResult<usize> {
        Ok(self.window()?.cur_time)
    }

    /// One free-running prediction step.
    pub fn e_generate(&mut self) -> ModelResult<Frame> {
        self.window()?;
        self.refresh_top_context(|layer| (layer.gen_d().clone(), layer.gen_d().clone()));
        for l in (0..self.layers.len()).rev() {
            self.layers[l].e_generate(&self.contexts[l], &mut self.noise)?;
        }
        if let Some(window) = self.window.as_mut() {
            window.cur_time += 1;
        }
        Ok(self.decode(self.layers[0].gen_d()))
    }

    /// True once enough frames have been generated to fill the window.
    pub fn e_init_forward(&self) -> ModelResult<bool> {
        let window = self.window()?;
        Ok(window.cur_time >= window.size)
    }

    /// Posterior pass over the window from the committed starting state.
    pub fn e_forward(&mut self) -> ModelResult<Sequence> {
        let size = self.window()?.size;
        for layer in self.layers.iter_mut() {
            layer.e_init_forward()?;
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear();
        }
        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            let mut tops = Vec::with_capacity(self.layers.len());
            for layer in self.layers.iter().skip(1) {
                tops.push((layer.e_last_dp()?.clone(), layer.e_last_dq()?.clone()));
            }
            for (ctx, (dp, dq)) in self.contexts.iter_mut().zip(tops) {
                ctx.dp_top = dp;
                ctx.dq_top = dq;
            }
            for l in (0..self.layers.len()).rev() {
                self.layers[l].e_forward(i, &self.contexts[l], &mut self.noise)?;
            }
            out.push(self.decode(self.layers[0].e_last_dq()?));
        }
        Ok(out)
    }

    /// Reverse sweep over the window. Only the window offsets receive gradients.
    pub fn e_backward(&mut self, x: &Sequence, y: &Sequence) -> ModelResult<Losses> {
        let size = self.window()?.size;
        self.check_frames("prediction", x, size)?;
        self.check_frames("target", y, size)?;
        for layer in self.layers.iter_mut() {
            layer.t_init_backward();
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear_gradients();
        }
        let (mut rec, mut reg) = (0.0, 0.0);
        for k in (1..=size).rev() {
            self.refresh_context_gradient();
            let d0 = self.layers[0].e_dq(k)?.clone();
            rec += self.output_gradient(&x[k - 1], &y[k - 1], &d0, false);
            for l in 0..self.layers.len() {
                self.layers[l].e_backward(k, &self.contexts[l])?;
                reg += self.layers[l].e_weighted_kld(k)?;
            }
        }
        Ok(self.totals(rec, reg))
    }

    pub fn e_opt_adam(&mut self, step: usize, adam: &Adam) -> ModelResult<()> {
        for layer in self.layers.iter_mut() {
            layer.e_opt_adam(step, adam)?;
        }
        Ok(())
    }

    pub fn e_copy_param(&mut self) -> ModelResult<()> {
        for layer in self.layers.iter_mut() {
            layer.e_copy_param()?;
        }
        Ok(())
    }

    pub fn e_overwrite_param(&mut self) -> ModelResult<()> {
        for layer in self.layers.iter_mut() {
            layer.e_overwrite_param()?;
        }
        Ok(())
    }

    /// Concatenated layer states, bottom first.
    pub fn e_state(&self) -> ModelResult<Vec<f32>> {
        let mut state = Vec::with_capacity(self.state_dim());
        for layer in &self.layers {
            state.extend(layer.e_state()?);
        }
        Ok(state)
    }

    pub fn e_save(&self, dir: &Path) -> ModelResult<()> {
        for layer in &self.layers {
            layer.e_save(dir)?;
        }
        Ok(())
    }

    pub fn e_sequence(&self) -> ModelResult<usize> {
        Ok(self.window()?.seq)
    }

    // ---- analysis mode ----

    /// Seeds every layer's generative state from a buffer laid out like [`Network::e_state`].
    pub fn a_init(&mut self, state: &[f32]) -> ModelResult<()> {
        if state.len() != self.state_dim() {
            return Err(ModelError::DimensionMismatch {
                what: "network state".to_string(),
                expected: self.state_dim(),
                actual: state.len(),
            });
        }
        let mut offset = 0;
        for layer in self.layers.iter_mut() {
            let dim = layer.state_dim();
            layer.a_init(&state[offset..offset + dim])?;
            offset += dim;
        }
        for ctx in self.contexts.iter_mut() {
            ctx.clear();
        }
        Ok(())
    }

    /// Prior-only rollout of `steps` frames from the seeded state.
    pub fn a_predict(&mut self, steps: usize) -> Sequence {
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            self.refresh_top_context(|layer| (layer.gen_d().clone(), layer.gen_d().clone()));
            for l in (0..self.layers.len()).rev() {
                self.layers[l].a_generate(&self.contexts[l], &mut self.noise);
            }
            out.push(self.decode(self.layers[0].gen_d()));
        }
        out
    }
}
