use crate::utils::NON_ZERO;
use ndarray::{Array, Dimension, ShapeBuilder, Zip};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    pub alpha: f32,
    pub beta1: f32,
    pub beta2: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            alpha: 0.001,
            beta1: 0.9,
            beta2: 0.999,
        }
    }
}

impl Adam {
    pub fn new(alpha: f32, beta1: f32, beta2: f32) -> Self {
        Self {
            alpha,
            beta1,
            beta2,
        }
    }

    /// Bias-corrected update. `step` counts from 1.
    pub fn update<D: Dimension>(
        &self,
        value: &mut Array<f32, D>,
        grad: &Array<f32, D>,
        m: &mut Array<f32, D>,
        v: &mut Array<f32, D>,
        step: usize,
    ) {
        let step = step.clamp(1, i32::MAX as usize) as i32;
        let (alpha, beta1, beta2) = (self.alpha, self.beta1, self.beta2);
        let correction1 = 1.0 - beta1.powi(step);
        let correction2 = 1.0 - beta2.powi(step);
        Zip::from(value)
            .and(grad)
            .and(m)
            .and(v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *p -= alpha * m_hat / (v_hat.sqrt() + NON_ZERO);
            });
    }
}

/// Buffer selector for persistence: value, first moment, second moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Value,
    FirstMoment,
    SecondMoment,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Value, Slot::FirstMoment, Slot::SecondMoment];

    pub fn suffix(&self) -> &'static str {
        match self {
            Slot::Value => "p",
            Slot::FirstMoment => "m",
            Slot::SecondMoment => "v",
        }
    }
}

/// A learnable tensor with its gradient accumulator and Adam moments.
#[derive(Debug, Clone, PartialEq)]
pub struct Param<D: Dimension> {
    pub value: Array<f32, D>,
    pub grad: Array<f32, D>,
    pub m: Array<f32, D>,
    pub v: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(value: Array<f32, D>) -> Self {
        let zeros = Array::<f32, D>::zeros(value.raw_dim());
        Self {
            grad: zeros.clone(),
            m: zeros.clone(),
            v: zeros,
            value,
        }
    }

    pub fn zeros<Sh: ShapeBuilder<Dim = D>>(shape: Sh) -> Self {
        Self::new(Array::zeros(shape))
    }

    fn slot(&self, slot: Slot) -> &Array<f32, D> {
        match slot {
            Slot::Value => &self.value,
            Slot::FirstMoment => &self.m,
            Slot::SecondMoment => &self.v,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Array<f32, D> {
        match slot {
            Slot::Value => &mut self.value,
            Slot::FirstMoment => &mut self.m,
            Slot::SecondMoment => &mut self.v,
        }
    }
}

/// Shape-erased view of a [`Param`] so layers can hand out heterogeneous lists.
pub trait Optimizable {
    fn shape(&self) -> &[usize];
    fn adam_step(&mut self, adam: &Adam, step: usize);
    fn zero_grad(&mut self);
    fn export(&self, slot: Slot) -> Vec<f32>;
    fn import(&mut self, slot: Slot, data: &[f32]);
    fn gradient(&self) -> Vec<f32>;

    fn len(&self) -> usize {
        self.shape().iter().product()
    }

    fn row_len(&self) -> usize {
        self.shape().last().copied().unwrap_or(1)
    }
}

impl<D: Dimension> Optimizable for Param<D> {
    fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    fn adam_step(&mut self, adam: &Adam, step: usize) {
        adam.update(&mut self.value, &self.grad, &mut self.m, &mut self.v, step);
    }

    fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    fn export(&self, slot: Slot) -> Vec<f32> {
        self.slot(slot).iter().copied().collect()
    }

    fn import(&mut self, slot: Slot, data: &[f32]) {
        for (dst, src) in self.slot_mut(slot).iter_mut().zip(data) {
            *dst = *src;
        }
    }

    fn gradient(&self) -> Vec<f32> {
        self.grad.iter().copied().collect()
    }
}

/// Applies Adam to every tensor, then clears the gradients.
pub fn optimize<'a, I>(params: I, adam: &Adam, step: usize)
where
    I: IntoIterator<Item = &'a mut dyn Optimizable>,
{
    for param in params {
        param.adam_step(adam, step);
        param.zero_grad();
    }
}
