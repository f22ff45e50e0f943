use crate::error::{ModelError, ModelResult};
use ndarray::{Array1, Array2, Array3, ArrayView1, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Additive guard for divisions and logarithms.
pub const NON_ZERO: f32 = 1e-20;

/// Kaiming gain for weights feeding a tanh.
pub const TANH_GAIN: f32 = 5.0 / 3.0;

/// Caller-owned Gaussian source for the reparameterization trick.
///
/// When disabled every sample is zero, which makes forward passes deterministic.
#[derive(Debug, Clone)]
pub struct Noise {
    rng: StdRng,
    enabled: bool,
}

impl Noise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            enabled: true,
        }
    }

    pub fn disabled(seed: u64) -> Self {
        Self {
            enabled: false,
            ..Self::new(seed)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn sample(&mut self, n: usize) -> Array1<f32> {
        if !self.enabled {
            return Array1::zeros(n);
        }
        let rng = &mut self.rng;
        Array1::from_shape_fn(n, |_| rng.sample::<f32, _>(StandardNormal))
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

pub fn kaiming_uniform<R: Rng>(rng: &mut R, rows: usize, cols: usize, gain: f32) -> Array2<f32> {
    let bound = 3f32.sqrt() * gain / (cols.max(1) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound))
}

pub fn uniform_bias<R: Rng>(rng: &mut R, dim: usize) -> Array1<f32> {
    let bound = 1.0 / (dim.max(1) as f32).sqrt();
    Array1::from_shape_fn(dim, |_| rng.gen_range(-bound..=bound))
}

/// One bias-style vector per (sequence, step) cell.
pub fn uniform_table<R: Rng>(rng: &mut R, sequences: usize, steps: usize, dim: usize) -> Array3<f32> {
    let bound = 1.0 / (dim.max(1) as f32).sqrt();
    Array3::from_shape_fn((sequences, steps, dim), |_| rng.gen_range(-bound..=bound))
}

pub fn softmax(x: &Array1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let e = x.mapv(|v| (v - max).exp());
    let sum = e.sum() + NON_ZERO;
    e / sum
}

/// Closed-form KL(q || p) of diagonal Gaussians, per unit.
pub fn kl_divergence_units(
    up: ArrayView1<f32>,
    sp: ArrayView1<f32>,
    uq: ArrayView1<f32>,
    sq: ArrayView1<f32>,
) -> Array1<f32> {
    Zip::from(up)
        .and(sp)
        .and(uq)
        .and(sq)
        .map_collect(|&up, &sp, &uq, &sq| {
            let ratio = (sq + NON_ZERO) / (sp + NON_ZERO);
            let diff = uq - up;
            -ratio.ln() + 0.5 * ratio * ratio + diff * diff / (2.0 * (sp * sp + NON_ZERO)) - 0.5
        })
}

pub fn kl_divergence(
    up: ArrayView1<f32>,
    sp: ArrayView1<f32>,
    uq: ArrayView1<f32>,
    sq: ArrayView1<f32>,
) -> f32 {
    kl_divergence_units(up, sp, uq, sq).sum()
}

/// `acc += scale * col * row^T`
pub fn add_outer(acc: &mut Array2<f32>, scale: f32, col: &Array1<f32>, row: &Array1<f32>) {
    Zip::indexed(acc).for_each(|(i, j), v| *v += scale * col[i] * row[j]);
}

/// Zero-filled buffer whose allocation failure is reported rather than aborting.
pub fn try_zeros(what: &str, len: usize) -> ModelResult<Vec<f32>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| ModelError::AllocationFailed {
            what: what.to_string(),
            requested: len.saturating_mul(std::mem::size_of::<f32>()),
        })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

pub fn try_zeros_2d(what: &str, rows: usize, cols: usize) -> ModelResult<Array2<f32>> {
    let len = rows
        .checked_mul(cols)
        .ok_or_else(|| ModelError::AllocationFailed {
            what: what.to_string(),
            requested: usize::MAX,
        })?;
    Array2::from_shape_vec((rows, cols), try_zeros(what, len)?).map_err(|_| {
        ModelError::DimensionMismatch {
            what: what.to_string(),
            expected: len,
            actual: rows * cols,
        }
    })
}
