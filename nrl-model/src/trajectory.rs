use ndarray::Array1;

/// Everything one branch produces in one time step.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStep {
    pub h: Array1<f32>,
    pub d: Array1<f32>,
    pub u: Array1<f32>,
    pub l: Array1<f32>,
    pub s: Array1<f32>,
    pub n: Array1<f32>,
    pub z: Array1<f32>,
}

impl BranchStep {
    pub fn zeros(d_num: usize, z_num: usize) -> Self {
        Self::initial(Array1::zeros(d_num), Array1::zeros(d_num), z_num)
    }

    pub fn initial(h: Array1<f32>, d: Array1<f32>, z_num: usize) -> Self {
        Self {
            h,
            d,
            u: Array1::zeros(z_num),
            l: Array1::zeros(z_num),
            s: Array1::zeros(z_num),
            n: Array1::zeros(z_num),
            z: Array1::zeros(z_num),
        }
    }

    /// Appends `h, d, u, l, s, n, z`.
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        for part in [&self.h, &self.d, &self.u, &self.l, &self.s, &self.n, &self.z] {
            out.extend(part.iter().copied());
        }
    }
}

/// Per-step buffers of one branch. Index 0 is the initial state, index `t+1`
/// holds step `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub h: Vec<Array1<f32>>,
    pub d: Vec<Array1<f32>>,
    pub u: Vec<Array1<f32>>,
    pub l: Vec<Array1<f32>>,
    pub s: Vec<Array1<f32>>,
    pub n: Vec<Array1<f32>>,
    pub z: Vec<Array1<f32>>,
}

impl Branch {
    pub fn new(initial: BranchStep, capacity: usize) -> Self {
        let mut branch = Self {
            h: Vec::with_capacity(capacity),
            d: Vec::with_capacity(capacity),
            u: Vec::with_capacity(capacity),
            l: Vec::with_capacity(capacity),
            s: Vec::with_capacity(capacity),
            n: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
        };
        branch.push(initial);
        branch
    }

    pub fn push(&mut self, step: BranchStep) {
        self.h.push(step.h);
        self.d.push(step.d);
        self.u.push(step.u);
        self.l.push(step.l);
        self.s.push(step.s);
        self.n.push(step.n);
        self.z.push(step.z);
    }

    pub fn len(&self) -> usize {
        self.h.len()
    }

    pub fn is_empty(&self) -> bool {
        self.h.is_empty()
    }

    pub fn last_h(&self) -> &Array1<f32> {
        &self.h[self.h.len() - 1]
    }

    pub fn last_d(&self) -> &Array1<f32> {
        &self.d[self.d.len() - 1]
    }

    pub fn step(&self, k: usize) -> BranchStep {
        BranchStep {
            h: self.h[k].clone(),
            d: self.d[k].clone(),
            u: self.u[k].clone(),
            l: self.l[k].clone(),
            s: self.s[k].clone(),
            n: self.n[k].clone(),
            z: self.z[k].clone(),
        }
    }
}

/// Prior and posterior trajectories of one sequence, with the top context
/// each branch saw and the KL divergence at every step.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub p: Branch,
    pub q: Branch,
    pub dp_top: Vec<Array1<f32>>,
    pub dq_top: Vec<Array1<f32>>,
    pub kld: Vec<f32>,
}

impl Trajectory {
    pub fn new(d_num: usize, z_num: usize, d_num_top: usize, steps: usize) -> Self {
        Self::from_state(Array1::zeros(d_num), Array1::zeros(d_num), z_num, d_num_top, steps)
    }

    /// Both branches start from the same `(h, d)`.
    pub fn from_state(
        h: Array1<f32>,
        d: Array1<f32>,
        z_num: usize,
        d_num_top: usize,
        steps: usize,
    ) -> Self {
        let capacity = steps + 1;
        let initial = BranchStep::initial(h, d, z_num);
        let mut dq_top = Vec::with_capacity(capacity);
        dq_top.push(Array1::zeros(d_num_top));
        let mut kld = Vec::with_capacity(capacity);
        kld.push(0.0);
        Self {
            p: Branch::new(initial.clone(), capacity),
            q: Branch::new(initial, capacity),
            dp_top: dq_top.clone(),
            dq_top,
            kld,
        }
    }

    /// Number of posterior steps recorded so far.
    pub fn steps(&self) -> usize {
        self.q.len() - 1
    }

    pub fn push(&mut self, p: BranchStep, q: BranchStep, tops: (Array1<f32>, Array1<f32>), kld: f32) {
        self.p.push(p);
        self.q.push(q);
        self.dp_top.push(tops.0);
        self.dq_top.push(tops.1);
        self.kld.push(kld);
    }
}
