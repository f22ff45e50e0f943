use crate::{
    context::Context,
    error::{ModelError, ModelResult},
    optimizer::{optimize, Adam, Optimizable, Param},
    store::{self, NamedParams, NamedParamsMut, Staged},
    trajectory::{Branch, BranchStep, Trajectory},
    utils::{
        add_outer, kaiming_uniform, kl_divergence, try_zeros, try_zeros_2d, uniform_bias,
        uniform_table, Noise, NON_ZERO, TANH_GAIN,
    },
};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Ix1, Ix2, Ix3};
use nrl_utils::write_table;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LayerConfig {
    /// Position in the stack, 0 is the output-facing layer.
    pub id: usize,
    pub d_num: usize,
    /// Size of the layer above, 0 for the top layer.
    pub d_num_top: usize,
    pub z_num: usize,
    /// Total latent units over the whole network.
    pub z_sum: usize,
    pub tau: f32,
    pub prim_num: usize,
    pub prim_len: usize,
    /// KL weight for every step but the first.
    pub w: f32,
    /// KL weight for the first step.
    pub w1: f32,
    /// Number of leading generation steps whose prior is taken from the posterior and `A`.
    pub gen_time_thres: usize,
}

impl LayerConfig {
    fn validate(&self) -> ModelResult<()> {
        let invalid = |key: &str, reason: String| {
            Err(ModelError::InvalidConfig {
                key: format!("layer {} {}", self.id, key),
                reason,
            })
        };
        if self.d_num == 0 {
            return invalid("d", "must be positive".to_string());
        }
        if self.z_num == 0 {
            return invalid("z", "must be positive".to_string());
        }
        if self.z_sum < self.z_num {
            return invalid("z_sum", format!("{} is below z = {}", self.z_sum, self.z_num));
        }
        if self.tau.is_nan() || self.tau <= 0.0 {
            return invalid("t", format!("must be positive, got {}", self.tau));
        }
        if self.prim_num == 0 || self.prim_len == 0 {
            return invalid("data", "needs at least one sequence of one step".to_string());
        }
        if !(self.w >= 0.0) || !(self.w1 >= 0.0) {
            return invalid("w", format!("must be non-negative, got {} / {}", self.w, self.w1));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct LayerParams {
    wdh: Param<Ix2>,
    wzh: Param<Ix2>,
    wdh_top: Option<Param<Ix2>>,
    wdup: Param<Ix2>,
    wdlp: Param<Ix2>,
    wduq: Param<Ix2>,
    wdlq: Param<Ix2>,
    bh: Param<Ix1>,
    bup: Param<Ix1>,
    blp: Param<Ix1>,
    buq: Param<Ix1>,
    blq: Param<Ix1>,
    /// Adaptive posterior offsets per (sequence, step).
    au: Param<Ix3>,
    al: Param<Ix3>,
}

impl LayerParams {
    fn init<R: Rng>(cfg: &LayerConfig, rng: &mut R) -> Self {
        let (d, z) = (cfg.d_num, cfg.z_num);
        Self {
            wdh: Param::new(kaiming_uniform(rng, d, d, 1.0)),
            wzh: Param::new(kaiming_uniform(rng, d, z, 1.0)),
            wdh_top: (cfg.d_num_top > 0)
                .then(|| Param::new(kaiming_uniform(rng, d, cfg.d_num_top, 1.0))),
            wdup: Param::new(kaiming_uniform(rng, z, d, TANH_GAIN)),
            wdlp: Param::new(kaiming_uniform(rng, z, d, 1.0)),
            wduq: Param::new(kaiming_uniform(rng, z, d, TANH_GAIN)),
            wdlq: Param::new(kaiming_uniform(rng, z, d, 1.0)),
            bh: Param::new(uniform_bias(rng, d)),
            bup: Param::new(uniform_bias(rng, z)),
            blp: Param::new(uniform_bias(rng, z)),
            buq: Param::new(uniform_bias(rng, z)),
            blq: Param::new(uniform_bias(rng, z)),
            au: Param::new(uniform_table(rng, cfg.prim_num, cfg.prim_len, z)),
            al: Param::new(uniform_table(rng, cfg.prim_num, cfg.prim_len, z)),
        }
    }

    fn named(&self) -> NamedParams {
        let mut params: NamedParams = vec![
            ("wdh", &self.wdh as &dyn Optimizable),
            ("wzh", &self.wzh as &dyn Optimizable),
        ];
        if let Some(wdh_top) = &self.wdh_top {
            params.push(("wdh_top", wdh_top as &dyn Optimizable));
        }
        params.push(("wdup", &self.wdup as &dyn Optimizable));
        params.push(("wdlp", &self.wdlp as &dyn Optimizable));
        params.push(("wduq", &self.wduq as &dyn Optimizable));
        params.push(("wdlq", &self.wdlq as &dyn Optimizable));
        params.push(("bh", &self.bh as &dyn Optimizable));
        params.push(("bup", &self.bup as &dyn Optimizable));
        params.push(("blp", &self.blp as &dyn Optimizable));
        params.push(("buq", &self.buq as &dyn Optimizable));
        params.push(("blq", &self.blq as &dyn Optimizable));
        params.push(("au", &self.au as &dyn Optimizable));
        params.push(("al", &self.al as &dyn Optimizable));
        params
    }

    fn named_mut(&mut self) -> NamedParamsMut {
        let mut params: NamedParamsMut = vec![
            ("wdh", &mut self.wdh as &mut dyn Optimizable),
            ("wzh", &mut self.wzh as &mut dyn Optimizable),
        ];
        if let Some(wdh_top) = &mut self.wdh_top {
            params.push(("wdh_top", wdh_top as &mut dyn Optimizable));
        }
        params.push(("wdup", &mut self.wdup as &mut dyn Optimizable));
        params.push(("wdlp", &mut self.wdlp as &mut dyn Optimizable));
        params.push(("wduq", &mut self.wduq as &mut dyn Optimizable));
        params.push(("wdlq", &mut self.wdlq as &mut dyn Optimizable));
        params.push(("bh", &mut self.bh as &mut dyn Optimizable));
        params.push(("bup", &mut self.bup as &mut dyn Optimizable));
        params.push(("blp", &mut self.blp as &mut dyn Optimizable));
        params.push(("buq", &mut self.buq as &mut dyn Optimizable));
        params.push(("blq", &mut self.blq as &mut dyn Optimizable));
        params.push(("au", &mut self.au as &mut dyn Optimizable));
        params.push(("al", &mut self.al as &mut dyn Optimizable));
        params
    }

    fn posterior(
        &self,
        d_prev: &Array1<f32>,
        au: ArrayView1<f32>,
        al: ArrayView1<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let u = (self.wduq.value.dot(d_prev) + &self.buq.value + &au).mapv(f32::tanh);
        let l = self.wdlq.value.dot(d_prev) + &self.blq.value + &al;
        (u, l)
    }

    fn prior(&self, d_prev: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        let u = (self.wdup.value.dot(d_prev) + &self.bup.value).mapv(f32::tanh);
        let l = self.wdlp.value.dot(d_prev) + &self.blp.value;
        (u, l)
    }

    fn drive(&self, d_prev: &Array1<f32>, z: &Array1<f32>, top: Option<&Array1<f32>>) -> Array1<f32> {
        let mut drive = self.wdh.value.dot(d_prev) + self.wzh.value.dot(z) + &self.bh.value;
        if let (Some(wdh_top), Some(top)) = (&self.wdh_top, top) {
            drive += &wdh_top.value.dot(top);
        }
        drive
    }

    /// Adds the weight gradients of step `k`. Each branch is taken against
    /// its own previous state and top context.
    fn accumulate(&mut self, traj: &Trajectory, k: usize, eps: f32, q: &BranchGradient, p: &BranchGradient) {
        for (branch, top, g) in [(&traj.q, &traj.dq_top, q), (&traj.p, &traj.dp_top, p)] {
            add_outer(&mut self.wdh.grad, eps, &g.h, &branch.d[k - 1]);
            add_outer(&mut self.wzh.grad, eps, &g.h, &branch.z[k]);
            self.bh.grad.scaled_add(eps, &g.h);
            if let Some(wdh_top) = &mut self.wdh_top {
                add_outer(&mut wdh_top.grad, eps, &g.h, &top[k]);
            }
        }
        add_outer(&mut self.wduq.grad, 1.0, &q.u, &traj.q.d[k - 1]);
        self.buq.grad += &q.u;
        add_outer(&mut self.wdlq.grad, 1.0, &q.l, &traj.q.d[k - 1]);
        self.blq.grad += &q.l;
        add_outer(&mut self.wdup.grad, 1.0, &p.u, &traj.p.d[k - 1]);
        self.bup.grad += &p.u;
        add_outer(&mut self.wdlp.grad, 1.0, &p.l, &traj.p.d[k - 1]);
        self.blp.grad += &p.l;
    }
}

/// Gradients of one branch at one step. `u` is taken before the mean's tanh.
#[derive(Debug, Clone, PartialEq)]
struct BranchGradient {
    h: Array1<f32>,
    u: Array1<f32>,
    l: Array1<f32>,
}

impl BranchGradient {
    fn zeros(d_num: usize, z_num: usize) -> Self {
        Self {
            h: Array1::zeros(d_num),
            u: Array1::zeros(z_num),
            l: Array1::zeros(z_num),
        }
    }

    fn reset(&mut self) {
        self.h.fill(0.0);
        self.u.fill(0.0);
        self.l.fill(0.0);
    }
}

/// Gradients carried from step `t+1` into step `t`.
#[derive(Debug, Clone, PartialEq)]
struct BackwardState {
    p: BranchGradient,
    q: BranchGradient,
}

impl BackwardState {
    fn new(d_num: usize, z_num: usize) -> Self {
        Self {
            p: BranchGradient::zeros(d_num, z_num),
            q: BranchGradient::zeros(d_num, z_num),
        }
    }

    fn reset(&mut self) {
        self.p.reset();
        self.q.reset();
    }
}

/// Reverse step through one branch's recurrence.
///
/// `external` is the gradient on `d[k]` from outside the branch. `kl_u` and
/// `kl_l` are the KL partials on the branch's mean and log-scale.
fn branch_backprop(
    params: &LayerParams,
    eps: f32,
    next: &BranchGradient,
    branch: &Branch,
    k: usize,
    external: Array1<f32>,
    (wdu, wdl): (&Param<Ix2>, &Param<Ix2>),
    (kl_u, kl_l): (Array1<f32>, Array1<f32>),
    fixed: bool,
) -> BranchGradient {
    let mut g_d = params.wdh.value.t().dot(&next.h) * eps + external;
    g_d += &wdu.value.t().dot(&next.u);
    g_d += &wdl.value.t().dot(&next.l);
    let h = g_d * &branch.d[k].mapv(|d| 1.0 - d * d) + &next.h * (1.0 - eps);
    let z_num = kl_u.len();
    if fixed {
        return BranchGradient {
            h,
            u: Array1::zeros(z_num),
            l: Array1::zeros(z_num),
        };
    }
    let g_z = params.wzh.value.t().dot(&h) * eps;
    let u = (&g_z + &kl_u) * &branch.u[k].mapv(|u| 1.0 - u * u);
    let l = g_z * &branch.s[k] * &branch.n[k] + kl_l;
    BranchGradient { h, u, l }
}

/// One reverse step through both branches. Returns `(q, p)` gradients.
///
/// `wf` is the KL weight divided by the total number of latent units. A fixed
/// prior is constant, so its branch gets no mean or log-scale gradient.
fn backprop(
    params: &LayerParams,
    eps: f32,
    ctx: &Context,
    traj: &Trajectory,
    state: &mut BackwardState,
    k: usize,
    wf: f32,
    fixed_prior: bool,
) -> (BranchGradient, BranchGradient) {
    let (up, sp) = (&traj.p.u[k], &traj.p.s[k]);
    let (uq, sq) = (&traj.q.u[k], &traj.q.s[k]);
    let z_num = uq.len();
    let mut kl_uq = Array1::zeros(z_num);
    let mut kl_lq = Array1::zeros(z_num);
    let mut kl_up = Array1::zeros(z_num);
    let mut kl_lp = Array1::zeros(z_num);
    for i in 0..z_num {
        let sp2 = sp[i] * sp[i] + NON_ZERO;
        let sq2 = sq[i] * sq[i];
        let diff = uq[i] - up[i];
        kl_uq[i] = wf * diff / sp2;
        kl_lq[i] = wf * (sq2 / sp2 - 1.0);
        kl_up[i] = -wf * diff / sp2;
        kl_lp[i] = wf * (1.0 - (diff * diff + sq2) / sp2);
    }

    let q = branch_backprop(
        params,
        eps,
        &state.q,
        &traj.q,
        k,
        &ctx.g_dq_context + &ctx.g_dqloss,
        (&params.wduq, &params.wdlq),
        (kl_uq, kl_lq),
        false,
    );
    let p = branch_backprop(
        params,
        eps,
        &state.p,
        &traj.p,
        k,
        ctx.g_dp_context.clone(),
        (&params.wdup, &params.wdlp),
        (kl_up, kl_lp),
        fixed_prior,
    );
    state.q.clone_from(&q);
    state.p.clone_from(&p);
    (q, p)
}

/// Window-local state of error regression.
#[derive(Debug, Clone, PartialEq)]
struct Experiment {
    seq: usize,
    window: usize,
    w: f32,
    num_times: usize,
    au: Param<Ix2>,
    al: Param<Ix2>,
    au_best: Array2<f32>,
    al_best: Array2<f32>,
    hq_tzero: Array1<f32>,
    dq_tzero: Array1<f32>,
    hq_opt: Array1<f32>,
    dq_opt: Array1<f32>,
    traj: Trajectory,
    store_gen: Option<Vec<Vec<f32>>>,
    store_inference: Option<Vec<Vec<f32>>>,
}

/// Free-running generation state, shared by experiment and analysis modes.
#[derive(Debug, Clone, PartialEq)]
struct Generation {
    step: BranchStep,
    time: usize,
}

/// One level of the hierarchy.
#[derive(Debug, Clone)]
pub struct Layer {
    cfg: LayerConfig,
    eps: f32,
    params: LayerParams,
    train: Vec<Trajectory>,
    backward: BackwardState,
    gen: Generation,
    experiment: Option<Experiment>,
}

impl Layer {
    pub fn new<R: Rng>(cfg: LayerConfig, rng: &mut R) -> ModelResult<Self> {
        cfg.validate()?;
        let params = LayerParams::init(&cfg, rng);
        let train = (0..cfg.prim_num)
            .map(|_| Trajectory::new(cfg.d_num, cfg.z_num, cfg.d_num_top, cfg.prim_len))
            .collect();
        Ok(Self {
            eps: 1.0 / cfg.tau,
            params,
            train,
            backward: BackwardState::new(cfg.d_num, cfg.z_num),
            gen: Generation {
                step: BranchStep::zeros(cfg.d_num, cfg.z_num),
                time: 0,
            },
            experiment: None,
            cfg,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.cfg
    }

    pub fn id(&self) -> usize {
        self.cfg.id
    }

    pub fn d_num(&self) -> usize {
        self.cfg.d_num
    }

    pub fn d_num_top(&self) -> usize {
        self.cfg.d_num_top
    }

    pub fn z_num(&self) -> usize {
        self.cfg.z_num
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn is_top(&self) -> bool {
        self.cfg.d_num_top == 0
    }

    pub fn is_bottom(&self) -> bool {
        self.cfg.id == 0
    }

    /// `(2·d + 5·z)` values for each of the two branches.
    pub fn state_dim(&self) -> usize {
        (2 * self.cfg.d_num + 5 * self.cfg.z_num) * 2
    }

    pub fn set_w(&mut self, w: f32, w1: f32) {
        self.cfg.w = w;
        self.cfg.w1 = w1;
    }

    /// `(1-eps)·h_prev + eps·drive` and its tanh.
    pub fn integrate(&self, h_prev: &Array1<f32>, drive: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        let h = h_prev * (1.0 - self.eps) + drive * self.eps;
        let d = h.mapv(f32::tanh);
        (h, d)
    }

    /// Input to the leaky integrator: `W_dh·d + W_zh·z + b_h [+ W_dh_top·top]`.
    pub fn drive(&self, d_prev: &Array1<f32>, z: &Array1<f32>, top: Option<&Array1<f32>>) -> Array1<f32> {
        self.params.drive(d_prev, z, top)
    }

    /// Mean (after tanh) and log-scale of the posterior at `(seq, time)` of the training table.
    pub fn posterior_params(&self, seq: usize, time: usize, d_prev: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        self.params.posterior(
            d_prev,
            self.params.au.value.slice(s![seq, time, ..]),
            self.params.al.value.slice(s![seq, time, ..]),
        )
    }

    /// Mean (after tanh) and log-scale of the generative prior. During burn-in
    /// these come from the posterior weights plus the step's adaptive offsets.
    pub fn prior_params(&self, seq: usize, time: usize, d_prev: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        if self.in_burn_in(time) {
            self.posterior_params(seq, time, d_prev)
        } else {
            self.params.prior(d_prev)
        }
    }

    fn in_burn_in(&self, time: usize) -> bool {
        time < self.cfg.gen_time_thres && time < self.cfg.prim_len
    }

    fn sample_step(
        &self,
        h_prev: &Array1<f32>,
        d_prev: &Array1<f32>,
        u: Array1<f32>,
        l: Array1<f32>,
        top: Option<&Array1<f32>>,
        noise: &mut Noise,
    ) -> BranchStep {
        let s = l.mapv(f32::exp);
        let n = noise.sample(self.cfg.z_num);
        let z = &u + &(&s * &n);
        let (h, d) = self.integrate(h_prev, &self.params.drive(d_prev, &z, top));
        BranchStep { h, d, u, l, s, n, z }
    }

    /// Next prior and posterior, each from its own branch of `traj`, plus
    /// their KL and the top contexts they read.
    fn infer_step(
        &self,
        traj: &Trajectory,
        ctx: &Context,
        au: ArrayView1<f32>,
        al: ArrayView1<f32>,
        fixed_prior: bool,
        noise: &mut Noise,
    ) -> (BranchStep, BranchStep, (Array1<f32>, Array1<f32>), f32) {
        let (hp_prev, dp_prev) = (traj.p.last_h(), traj.p.last_d());
        let (up, lp) = if fixed_prior {
            (Array1::zeros(self.cfg.z_num), Array1::zeros(self.cfg.z_num))
        } else {
            self.params.prior(dp_prev)
        };
        let p = self.sample_step(hp_prev, dp_prev, up, lp, ctx.top(false), noise);
        let (hq_prev, dq_prev) = (traj.q.last_h(), traj.q.last_d());
        let (uq, lq) = self.params.posterior(dq_prev, au, al);
        let q = self.sample_step(hq_prev, dq_prev, uq, lq, ctx.top(true), noise);
        let kld = kl_divergence(p.u.view(), p.s.view(), q.u.view(), q.s.view());
        let seen = |posterior: bool| {
            ctx.top(posterior)
                .cloned()
                .unwrap_or_else(|| Array1::zeros(0))
        };
        (p, q, (seen(false), seen(true)), kld)
    }

    fn check_seq(&self, seq: usize) -> ModelResult<()> {
        if seq < self.cfg.prim_num {
            Ok(())
        } else {
            Err(ModelError::InvalidSequence {
                index: seq,
                num_sequences: self.cfg.prim_num,
            })
        }
    }

    // ---- training mode ----

    /// Clears the trajectory of `seq` back to the zero initial state.
    pub fn init_context(&mut self, seq: usize) -> ModelResult<()> {
        self.check_seq(seq)?;
        self.train[seq] = Trajectory::new(
            self.cfg.d_num,
            self.cfg.z_num,
            self.cfg.d_num_top,
            self.cfg.prim_len,
        );
        Ok(())
    }

    pub fn trajectory(&self, seq: usize) -> Option<&Trajectory> {
        self.train.get(seq)
    }

    fn check_time(&self, time: usize, length: usize) -> ModelResult<()> {
        if time < length {
            Ok(())
        } else {
            Err(ModelError::InvalidTimeStep { time, length })
        }
    }

    /// Closed-loop prior step appended to the prior branch of `seq`.
    pub fn t_generate(&mut self, time: usize, seq: usize, ctx: &Context, noise: &mut Noise) -> ModelResult<()> {
        self.check_seq(seq)?;
        let traj = &self.train[seq];
        let (h_prev, d_prev) = (traj.p.last_h(), traj.p.last_d());
        let (u, l) = self.prior_params(seq, time, d_prev);
        let step = self.sample_step(h_prev, d_prev, u, l, ctx.top(false), noise);
        self.train[seq].p.push(step);
        Ok(())
    }

    /// Prior and posterior step with their KL, appended to the trajectory of `seq`.
    pub fn t_forward(&mut self, time: usize, seq: usize, ctx: &Context, noise: &mut Noise) -> ModelResult<()> {
        self.check_seq(seq)?;
        self.check_time(time, self.cfg.prim_len)?;
        let (p, q, tops, kld) = self.infer_step(
            &self.train[seq],
            ctx,
            self.params.au.value.slice(s![seq, time, ..]),
            self.params.al.value.slice(s![seq, time, ..]),
            time == 0,
            noise,
        );
        self.train[seq].push(p, q, tops, kld);
        Ok(())
    }

    pub fn t_init_backward(&mut self) {
        self.backward.reset();
    }

    fn kl_weight(&self, k: usize) -> f32 {
        if k == 1 {
            self.cfg.w1
        } else {
            self.cfg.w
        }
    }

    /// Reverse step `k` (from `T` down to 1) of sequence `seq`.
    pub fn t_backward(&mut self, k: usize, seq: usize, ctx: &Context) -> ModelResult<()> {
        self.check_seq(seq)?;
        if k == 0 {
            return Err(ModelError::InvalidTimeStep { time: k, length: 1 });
        }
        self.check_time(k - 1, self.train[seq].steps())?;
        let wf = self.kl_weight(k) / self.cfg.z_sum as f32;
        let (q, p) = backprop(
            &self.params,
            self.eps,
            ctx,
            &self.train[seq],
            &mut self.backward,
            k,
            wf,
            k == 1,
        );
        self.params.accumulate(&self.train[seq], k, self.eps, &q, &p);
        let mut g_au = self.params.au.grad.slice_mut(s![seq, k - 1, ..]);
        g_au += &q.u;
        let mut g_al = self.params.al.grad.slice_mut(s![seq, k - 1, ..]);
        g_al += &q.l;
        Ok(())
    }

    /// Gradients `(d_p, d_q)` this layer's last backward step sends to the layer above.
    pub fn top_feedback(&self) -> Option<(Array1<f32>, Array1<f32>)> {
        self.params.wdh_top.as_ref().map(|w| {
            (
                w.value.t().dot(&self.backward.p.h) * self.eps,
                w.value.t().dot(&self.backward.q.h) * self.eps,
            )
        })
    }

    /// KL of step `k` times the weight applied to it.
    pub fn weighted_kld(&self, seq: usize, k: usize) -> f32 {
        self.kl_weight(k) * self.train[seq].kld[k]
    }

    pub fn t_opt_adam(&mut self, step: usize, adam: &Adam) {
        optimize(self.params.named_mut().into_iter().map(|(_, p)| p), adam, step);
    }

    pub fn zero_grad(&mut self) {
        for (_, param) in self.params.named_mut() {
            param.zero_grad();
        }
    }

    pub fn named_params(&self) -> NamedParams {
        self.params.named()
    }

    pub fn named_params_mut(&mut self) -> NamedParamsMut {
        self.params.named_mut()
    }

    /// Adaptive offsets `(a_u, a_l)` of the training table.
    pub fn adaptive(&self) -> (&Array3<f32>, &Array3<f32>) {
        (&self.params.au.value, &self.params.al.value)
    }

    pub fn prefix(&self) -> String {
        format!("L{}", self.cfg.id)
    }

    pub fn save(&self, dir: &Path) -> ModelResult<()> {
        store::save(dir, &self.prefix(), &self.params.named())
    }

    pub fn stage(&self, dir: &Path) -> ModelResult<Staged> {
        store::stage(dir, &self.prefix(), &self.params.named())
    }

    pub fn commit(&mut self, staged: Staged) -> ModelResult<()> {
        store::commit(staged, self.params.named_mut())
    }

    /// Reads every tensor before touching any of them.
    pub fn load(&mut self, dir: &Path) -> ModelResult<()> {
        let staged = self.stage(dir)?;
        self.commit(staged)
    }

    // ---- experiment mode ----

    pub fn e_enable(
        &mut self,
        seq: usize,
        window: usize,
        w: f32,
        num_times: usize,
        store_gen: bool,
        store_inference: bool,
    ) -> ModelResult<()> {
        self.check_seq(seq)?;
        if window == 0 {
            return Err(ModelError::InvalidConfig {
                key: "window".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        self.experiment = None;
        let (d, z) = (self.cfg.d_num, self.cfg.z_num);
        let what = format!("layer {} window of {} steps", self.cfg.id, window);
        let au = Param::new(try_zeros_2d(&what, window, z)?);
        let al = Param::new(try_zeros_2d(&what, window, z)?);
        let store = |enabled: bool| -> ModelResult<Option<Vec<Vec<f32>>>> {
            if !enabled {
                return Ok(None);
            }
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(num_times)
                .map_err(|_| ModelError::AllocationFailed {
                    what: format!("layer {} state store", self.cfg.id),
                    requested: num_times.saturating_mul(self.state_dim() * 4),
                })?;
            Ok(Some(buffer))
        };
        let store_gen = store(store_gen)?;
        let store_inference = store(store_inference)?;
        let zero_state = Array1::from(try_zeros(&what, d)?);
        self.experiment = Some(Experiment {
            seq,
            window,
            w,
            num_times,
            au_best: au.value.clone(),
            al_best: al.value.clone(),
            au,
            al,
            hq_tzero: zero_state.clone(),
            dq_tzero: zero_state.clone(),
            hq_opt: zero_state.clone(),
            dq_opt: zero_state,
            traj: Trajectory::new(d, z, self.cfg.d_num_top, window),
            store_gen,
            store_inference,
        });
        self.gen = Generation {
            step: BranchStep::zeros(d, z),
            time: 0,
        };
        Ok(())
    }

    pub fn e_disable(&mut self) {
        self.experiment = None;
    }

    pub fn e_enabled(&self) -> bool {
        self.experiment.is_some()
    }

    fn experiment(&self) -> ModelResult<&Experiment> {
        self.experiment.as_ref().ok_or(ModelError::ExperimentDisabled)
    }

    fn experiment_mut(&mut self) -> ModelResult<&mut Experiment> {
        self.experiment.as_mut().ok_or(ModelError::ExperimentDisabled)
    }

    /// Current window offsets `(a_u, a_l)`.
    pub fn e_adaptive(&self) -> ModelResult<(&Array2<f32>, &Array2<f32>)> {
        let e = self.experiment()?;
        Ok((&e.au.value, &e.al.value))
    }

    /// Window offsets of the best iteration so far.
    pub fn e_best_adaptive(&self) -> ModelResult<(&Array2<f32>, &Array2<f32>)> {
        let e = self.experiment()?;
        Ok((&e.au_best, &e.al_best))
    }

    pub fn gen_d(&self) -> &Array1<f32> {
        &self.gen.step.d
    }

    /// Free-running generation, burning in on the training offsets of the enabled sequence.
    pub fn e_generate(&mut self, ctx: &Context, noise: &mut Noise) -> ModelResult<()> {
        let seq = self.experiment()?.seq;
        let time = self.gen.time;
        let (u, l) = self.prior_params(seq, time, &self.gen.step.d);
        let step = self.sample_step(&self.gen.step.h, &self.gen.step.d, u, l, ctx.top(false), noise);
        self.gen = Generation {
            step,
            time: time + 1,
        };
        let mut state = Vec::with_capacity(self.state_dim());
        self.gen.step.flatten_into(&mut state);
        state.resize(self.state_dim(), 0.0);
        let e = self.experiment_mut()?;
        if let Some(store) = e.store_gen.as_mut() {
            if store.len() < e.num_times {
                store.push(state);
            }
        }
        Ok(())
    }

    /// Restarts the window trajectory from the committed starting state.
    pub fn e_init_forward(&mut self) -> ModelResult<()> {
        let (d_top, z) = (self.cfg.d_num_top, self.cfg.z_num);
        let e = self.experiment_mut()?;
        e.traj = Trajectory::from_state(e.hq_tzero.clone(), e.dq_tzero.clone(), z, d_top, e.window);
        Ok(())
    }

    pub fn e_forward(&mut self, step: usize, ctx: &Context, noise: &mut Noise) -> ModelResult<()> {
        let e = self.experiment()?;
        self.check_time(step, e.window)?;
        let (p, q, tops, kld) = self.infer_step(
            &e.traj,
            ctx,
            e.au.value.row(step),
            e.al.value.row(step),
            false,
            noise,
        );
        self.experiment_mut()?.traj.push(p, q, tops, kld);
        Ok(())
    }

    pub fn e_last_dp(&self) -> ModelResult<&Array1<f32>> {
        Ok(self.experiment()?.traj.p.last_d())
    }

    pub fn e_last_dq(&self) -> ModelResult<&Array1<f32>> {
        Ok(self.experiment()?.traj.q.last_d())
    }

    pub fn e_dq(&self, k: usize) -> ModelResult<&Array1<f32>> {
        Ok(&self.experiment()?.traj.q.d[k])
    }

    pub fn e_weighted_kld(&self, k: usize) -> ModelResult<f32> {
        let e = self.experiment()?;
        Ok(e.w * e.traj.kld[k])
    }

    /// Reverse step `k` over the window. Only the window offsets get gradients.
    pub fn e_backward(&mut self, k: usize, ctx: &Context) -> ModelResult<()> {
        let z_sum = self.cfg.z_sum as f32;
        let e = self.experiment.as_mut().ok_or(ModelError::ExperimentDisabled)?;
        let (q, _) = backprop(
            &self.params,
            self.eps,
            ctx,
            &e.traj,
            &mut self.backward,
            k,
            e.w / z_sum,
            false,
        );
        let mut g_au = e.au.grad.row_mut(k - 1);
        g_au += &q.u;
        let mut g_al = e.al.grad.row_mut(k - 1);
        g_al += &q.l;
        Ok(())
    }

    pub fn e_opt_adam(&mut self, step: usize, adam: &Adam) -> ModelResult<()> {
        let e = self.experiment_mut()?;
        optimize(
            [
                &mut e.au as &mut dyn Optimizable,
                &mut e.al as &mut dyn Optimizable,
            ],
            adam,
            step,
        );
        Ok(())
    }

    /// Remembers the current window as the best one and moves the
    /// generative state to the end of the window.
    pub fn e_copy_param(&mut self) -> ModelResult<()> {
        let e = self.experiment.as_mut().ok_or(ModelError::ExperimentDisabled)?;
        e.au_best.assign(&e.au.value);
        e.al_best.assign(&e.al.value);
        let last = e.traj.steps();
        self.gen.step = e.traj.q.step(last);
        let first = last.min(1);
        e.hq_opt = e.traj.q.h[first].clone();
        e.dq_opt = e.traj.q.d[first].clone();
        Ok(())
    }

    /// Commits the best window: the starting state advances one step and the
    /// offsets shift left, zero-filling the newest slot.
    pub fn e_overwrite_param(&mut self) -> ModelResult<()> {
        let e = self.experiment.as_mut().ok_or(ModelError::ExperimentDisabled)?;
        e.hq_tzero = e.hq_opt.clone();
        e.dq_tzero = e.dq_opt.clone();
        let window = e.window;
        if window > 1 {
            e.au.value
                .slice_mut(s![..window - 1, ..])
                .assign(&e.au_best.slice(s![1.., ..]));
            e.al.value
                .slice_mut(s![..window - 1, ..])
                .assign(&e.al_best.slice(s![1.., ..]));
        }
        e.au.value.row_mut(window - 1).fill(0.0);
        e.al.value.row_mut(window - 1).fill(0.0);
        if e.store_inference.is_some() && e.traj.steps() > 0 {
            let mut state = Vec::new();
            e.traj.p.step(1).flatten_into(&mut state);
            e.traj.q.step(1).flatten_into(&mut state);
            let num_times = e.num_times;
            if let Some(store) = e.store_inference.as_mut() {
                if store.len() < num_times {
                    store.push(state);
                }
            }
        }
        Ok(())
    }

    /// Flat `[h,d,u,l,s,n,z]_p ++ [h,d,u,l,s,n,z]_q` of the latest window
    /// step, or the generative state followed by zeros when no window has run.
    pub fn e_state(&self) -> ModelResult<Vec<f32>> {
        let e = self.experiment()?;
        let mut state = Vec::with_capacity(self.state_dim());
        if e.traj.steps() == 0 {
            self.gen.step.flatten_into(&mut state);
        } else {
            let last = e.traj.steps();
            e.traj.p.step(last).flatten_into(&mut state);
            e.traj.q.step(last).flatten_into(&mut state);
        }
        state.resize(self.state_dim(), 0.0);
        Ok(state)
    }

    pub fn e_save(&self, dir: &Path) -> ModelResult<()> {
        let e = self.experiment()?;
        store::ensure_dir(dir)?;
        for (name, rows) in [("gen", &e.store_gen), ("inf", &e.store_inference)] {
            if let Some(rows) = rows {
                let path = dir.join(format!("{}_e_{}.d", self.prefix(), name));
                write_table(&path, rows).map_err(|err| ModelError::Io {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;
            }
        }
        Ok(())
    }

    // ---- analysis mode ----

    /// Seeds the generative state from the prior half of a layer state buffer.
    pub fn a_init(&mut self, state: &[f32]) -> ModelResult<()> {
        if state.len() != self.state_dim() {
            return Err(ModelError::DimensionMismatch {
                what: format!("layer {} state", self.cfg.id),
                expected: self.state_dim(),
                actual: state.len(),
            });
        }
        let d = self.cfg.d_num;
        let mut step = BranchStep::zeros(d, self.cfg.z_num);
        step.h = Array1::from(state[..d].to_vec());
        step.d = Array1::from(state[d..2 * d].to_vec());
        // burn-in is skipped: the state already reflects the data
        self.gen = Generation {
            step,
            time: self.cfg.gen_time_thres,
        };
        Ok(())
    }

    /// Prior-only closed-loop step from the generative state.
    pub fn a_generate(&mut self, ctx: &Context, noise: &mut Noise) {
        let (u, l) = self.params.prior(&self.gen.step.d);
        let step = self.sample_step(&self.gen.step.h, &self.gen.step.d, u, l, ctx.top(false), noise);
        self.gen = Generation {
            step,
            time: self.gen.time + 1,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    fn layer(tau: f32, d_num_top: usize) -> Layer {
        let mut rng = SmallRng::seed_from_u64(7);
        Layer::new(
            LayerConfig {
                id: 0,
                d_num: 3,
                d_num_top,
                z_num: 2,
                z_sum: 2,
                tau,
                prim_num: 2,
                prim_len: 6,
                w: 0.01,
                w1: 0.001,
                gen_time_thres: 3,
            },
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn test_unit_eps_has_no_memory() {
        let mut layer = layer(1.0, 0);
        let ctx = Context::new(3, 0);
        let mut noise = Noise::new(1);
        layer.init_context(0).unwrap();
        for t in 0..4 {
            layer.t_forward(t, 0, &ctx, &mut noise).unwrap();
        }
        let traj = layer.trajectory(0).unwrap();
        for k in 1..=4 {
            let drive = layer.drive(&traj.q.d[k - 1], &traj.q.z[k], None);
            assert_eq!(traj.q.h[k], drive);
            assert_eq!(traj.q.d[k], drive.mapv(f32::tanh));
        }
    }

    #[test]
    fn test_zero_eps_keeps_hidden_state() {
        let mut layer = layer(f32::INFINITY, 0);
        assert_eq!(layer.eps(), 0.0);
        let h_prev = Array1::from(vec![0.3, -0.2, 0.9]);
        let drive = Array1::from(vec![5.0, 1.0, -4.0]);
        let (h, d) = layer.integrate(&h_prev, &drive);
        assert_eq!(h, h_prev);
        assert_eq!(d, h_prev.mapv(f32::tanh));

        let ctx = Context::new(3, 0);
        let mut noise = Noise::new(2);
        layer.init_context(1).unwrap();
        for t in 0..3 {
            layer.t_forward(t, 1, &ctx, &mut noise).unwrap();
        }
        let traj = layer.trajectory(1).unwrap();
        assert!(traj.q.h.iter().all(|h| h.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn test_first_step_prior_is_standard_normal() {
        let mut layer = layer(2.0, 0);
        let ctx = Context::new(3, 0);
        let mut noise = Noise::new(3);
        layer.init_context(0).unwrap();
        layer.t_forward(0, 0, &ctx, &mut noise).unwrap();
        let traj = layer.trajectory(0).unwrap();
        assert!(traj.p.u[1].iter().all(|&u| u == 0.0));
        assert!(traj.p.s[1].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_generation_burn_in_uses_posterior_and_offsets() {
        let mut layer = layer(2.0, 0);
        let ctx = Context::new(3, 0);
        let mut noise = Noise::new(4);
        layer.init_context(1).unwrap();
        for t in 0..5 {
            layer.t_generate(t, 1, &ctx, &mut noise).unwrap();
        }
        let traj = layer.trajectory(1).unwrap();
        for t in 0..5 {
            let d_prev = &traj.p.d[t];
            let (u_post, l_post) = layer.posterior_params(1, t, d_prev);
            let (u_prior, l_prior) = layer.params.prior(d_prev);
            let expected = if t < 3 { (u_post, l_post) } else { (u_prior, l_prior) };
            assert_eq!(traj.p.u[t + 1], expected.0);
            assert_eq!(traj.p.l[t + 1], expected.1);
        }
    }

    #[test]
    fn test_top_context_reaches_drive() {
        let mut layer = layer(2.0, 4);
        let mut ctx = Context::new(3, 4);
        ctx.dq_top = Array1::from(vec![0.5, -0.5, 0.25, 1.0]);
        let mut noise = Noise::disabled(5);
        layer.init_context(0).unwrap();
        layer.t_forward(0, 0, &ctx, &mut noise).unwrap();
        let traj = layer.trajectory(0).unwrap();
        assert_eq!(traj.dq_top[1], ctx.dq_top);
        let with_top = layer.drive(&traj.q.d[0], &traj.q.z[1], Some(&ctx.dq_top));
        let (h, _) = layer.integrate(&traj.q.h[0], &with_top);
        assert_eq!(traj.q.h[1], h);
        assert!(layer.top_feedback().is_some());
    }

    #[test]
    fn test_prior_branch_follows_its_own_recurrence() {
        let mut layer = layer(2.0, 4);
        let mut ctx = Context::new(3, 4);
        ctx.dp_top = Array1::from(vec![-0.4, 0.1, 0.8, 0.0]);
        ctx.dq_top = Array1::from(vec![0.5, -0.5, 0.25, 1.0]);
        let mut noise = Noise::disabled(6);
        layer.init_context(0).unwrap();
        for t in 0..4 {
            layer.t_forward(t, 0, &ctx, &mut noise).unwrap();
        }
        let traj = layer.trajectory(0).unwrap();
        for k in 1..=4 {
            if k > 1 {
                let (u, l) = layer.params.prior(&traj.p.d[k - 1]);
                assert_eq!(traj.p.u[k], u);
                assert_eq!(traj.p.l[k], l);
            }
            let drive = layer.drive(&traj.p.d[k - 1], &traj.p.z[k], Some(&ctx.dp_top));
            let (h, d) = layer.integrate(&traj.p.h[k - 1], &drive);
            assert_eq!(traj.p.h[k], h);
            assert_eq!(traj.p.d[k], d);
            assert_eq!(traj.dp_top[k], ctx.dp_top);
        }
        assert_ne!(traj.p.h[2], traj.q.h[2]);
    }

    #[test]
    fn test_out_of_range_steps_are_rejected() {
        let mut layer = layer(2.0, 0);
        let ctx = Context::new(3, 0);
        let mut noise = Noise::new(8);
        assert_eq!(
            layer.t_forward(0, 2, &ctx, &mut noise),
            Err(ModelError::InvalidSequence {
                index: 2,
                num_sequences: 2
            })
        );
        assert!(layer.t_generate(0, 7, &ctx, &mut noise).is_err());
        assert_eq!(
            layer.t_forward(6, 0, &ctx, &mut noise),
            Err(ModelError::InvalidTimeStep { time: 6, length: 6 })
        );
        layer.init_context(0).unwrap();
        assert_eq!(
            layer.t_backward(1, 0, &ctx),
            Err(ModelError::InvalidTimeStep { time: 0, length: 0 })
        );
        layer.t_forward(0, 0, &ctx, &mut noise).unwrap();
        assert!(layer.t_backward(0, 0, &ctx).is_err());
        assert!(layer.t_backward(1, 3, &ctx).is_err());
        assert_eq!(layer.t_backward(1, 0, &ctx), Ok(()));
    }

    #[test]
    fn test_state_dim_layout() {
        let mut layer = layer(2.0, 0);
        assert_eq!(layer.state_dim(), (2 * 3 + 5 * 2) * 2);
        layer.e_enable(0, 4, 0.01, 2, true, true).unwrap();
        let state = layer.e_state().unwrap();
        assert_eq!(state.len(), layer.state_dim());
        assert!(state.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_experiment_requires_enable() {
        let mut layer = layer(2.0, 0);
        assert_eq!(layer.e_init_forward(), Err(ModelError::ExperimentDisabled));
        assert!(layer.e_enable(5, 4, 0.01, 1, false, false).is_err());
        assert!(!layer.e_enabled());
        assert!(layer.e_enable(0, 0, 0.01, 1, false, false).is_err());
    }
}
