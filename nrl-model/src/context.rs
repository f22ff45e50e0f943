use ndarray::Array1;

/// Per-layer exchange record.
///
/// The network rewrites every field once per time step, before any layer
/// steps, so layers only ever read neighbour state from the previous step.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    /// Prior deterministic state of the layer above at `t-1`. Empty for the top layer.
    pub dp_top: Array1<f32>,
    /// Posterior deterministic state of the layer above at `t-1`. Empty for the top layer.
    pub dq_top: Array1<f32>,
    /// Gradient on this layer's `d_p` from the layer below, which reads it as top context.
    pub g_dp_context: Array1<f32>,
    /// Same for `d_q`.
    pub g_dq_context: Array1<f32>,
    /// Reconstruction gradient on `d_q`. Nonzero only at the bottom layer.
    pub g_dqloss: Array1<f32>,
}

impl Context {
    pub fn new(d_num: usize, d_num_top: usize) -> Self {
        Self {
            dp_top: Array1::zeros(d_num_top),
            dq_top: Array1::zeros(d_num_top),
            g_dp_context: Array1::zeros(d_num),
            g_dq_context: Array1::zeros(d_num),
            g_dqloss: Array1::zeros(d_num),
        }
    }

    pub fn clear(&mut self) {
        self.dp_top.fill(0.0);
        self.dq_top.fill(0.0);
        self.clear_gradients();
    }

    pub fn clear_gradients(&mut self) {
        self.g_dp_context.fill(0.0);
        self.g_dq_context.fill(0.0);
        self.g_dqloss.fill(0.0);
    }

    pub fn top(&self, posterior: bool) -> Option<&Array1<f32>> {
        let top = if posterior { &self.dq_top } else { &self.dp_top };
        if top.is_empty() {
            None
        } else {
            Some(top)
        }
    }
}
