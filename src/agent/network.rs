//! Dueling Q-network with attention over the state vector
//!
//! The state vector is laid out as feature-group tokens, embedded, passed
//! through one multi-head self-attention block with a residual connection,
//! mean-pooled, and fed to a shared trunk that splits into value and
//! advantage heads: Q(s,a) = V(s) + (A(s,a) - mean_a A(s,a)).
//!
//! Everything is plain `ndarray` math with hand-derived gradients, which
//! keeps the optimizer in full control of gradient clipping and soft target
//! blending. Single-sample tensors are 1xN matrices so every parameter is a
//! uniform `Array2`.

use ndarray::{s, Array2, Axis, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Network shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetConfig {
    /// Input state dimension
    pub state_dim: usize,
    /// Number of discrete actions
    pub actions: usize,
    /// Features per attention token
    pub token_dim: usize,
    /// Embedding width
    pub embed_dim: usize,
    /// Attention heads; must divide `embed_dim`
    pub heads: usize,
    /// Trunk width
    pub hidden: usize,
}

impl NetConfig {
    /// Default shape for a given state/action dimensionality.
    pub fn new(state_dim: usize, actions: usize) -> Self {
        Self {
            state_dim,
            actions,
            token_dim: 8,
            embed_dim: 32,
            heads: 4,
            hidden: 64,
        }
    }

    /// Number of tokens the state is split into.
    pub fn tokens(&self) -> usize {
        self.state_dim.div_ceil(self.token_dim)
    }
}

/// All learnable parameters. Biases are 1xN rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetParams {
    w_embed: Array2<f64>,
    b_embed: Array2<f64>,
    w_q: Array2<f64>,
    w_k: Array2<f64>,
    w_v: Array2<f64>,
    w_o: Array2<f64>,
    w_fc: Array2<f64>,
    b_fc: Array2<f64>,
    w_value: Array2<f64>,
    b_value: Array2<f64>,
    w_adv: Array2<f64>,
    b_adv: Array2<f64>,
}

impl NetParams {
    fn init<R: Rng>(config: &NetConfig, rng: &mut R) -> Self {
        let mut glorot = |rows: usize, cols: usize| {
            let bound = (6.0 / (rows + cols) as f64).sqrt();
            Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
        };
        let e = config.embed_dim;
        Self {
            w_embed: glorot(config.token_dim, e),
            b_embed: Array2::zeros((1, e)),
            w_q: glorot(e, e),
            w_k: glorot(e, e),
            w_v: glorot(e, e),
            w_o: glorot(e, e),
            w_fc: glorot(e, config.hidden),
            b_fc: Array2::zeros((1, config.hidden)),
            w_value: glorot(config.hidden, 1),
            b_value: Array2::zeros((1, 1)),
            w_adv: glorot(config.hidden, config.actions),
            b_adv: Array2::zeros((1, config.actions)),
        }
    }

    fn zeros_like(&self) -> Self {
        let mut out = self.clone();
        for array in out.arrays_mut() {
            array.fill(0.0);
        }
        out
    }

    fn arrays(&self) -> [&Array2<f64>; 12] {
        [
            &self.w_embed,
            &self.b_embed,
            &self.w_q,
            &self.w_k,
            &self.w_v,
            &self.w_o,
            &self.w_fc,
            &self.b_fc,
            &self.w_value,
            &self.b_value,
            &self.w_adv,
            &self.b_adv,
        ]
    }

    fn arrays_mut(&mut self) -> [&mut Array2<f64>; 12] {
        [
            &mut self.w_embed,
            &mut self.b_embed,
            &mut self.w_q,
            &mut self.w_k,
            &mut self.w_v,
            &mut self.w_o,
            &mut self.w_fc,
            &mut self.b_fc,
            &mut self.w_value,
            &mut self.b_value,
            &mut self.w_adv,
            &mut self.b_adv,
        ]
    }

    /// self += other * factor.
    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        for (mine, theirs) in self.arrays_mut().into_iter().zip(other.arrays()) {
            Zip::from(mine.view_mut())
                .and(theirs.view())
                .for_each(|m, t| *m += t * factor);
        }
    }

    /// L2 norm over every entry.
    pub fn global_norm(&self) -> f64 {
        self.arrays()
            .into_iter()
            .map(|array| array.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    /// Scale every entry in place.
    pub fn scale(&mut self, factor: f64) {
        for array in self.arrays_mut() {
            array.mapv_inplace(|v| v * factor);
        }
    }

    /// Polyak blend: self = tau * other + (1 - tau) * self.
    pub fn blend_from(&mut self, other: &Self, tau: f64) {
        for (mine, theirs) in self.arrays_mut().into_iter().zip(other.arrays()) {
            Zip::from(mine.view_mut())
                .and(theirs.view())
                .for_each(|m, t| *m = tau * t + (1.0 - tau) * *m);
        }
    }
}

fn softmax_rows(m: &Array2<f64>) -> Array2<f64> {
    let mut out = m.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

/// Forward-pass intermediates needed for the backward pass.
pub struct Cache {
    tokens: Array2<f64>,
    x: Array2<f64>,
    qm: Array2<f64>,
    km: Array2<f64>,
    vm: Array2<f64>,
    attn: Vec<Array2<f64>>,
    o: Array2<f64>,
    pooled: Array2<f64>,
    pre_fc: Array2<f64>,
    f: Array2<f64>,
}

/// The Q-network: parameters plus shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QNetwork {
    /// Shape
    pub config: NetConfig,
    /// Learnable parameters
    pub params: NetParams,
}

impl QNetwork {
    /// Fresh network with Glorot-uniform weights.
    pub fn new<R: Rng>(config: NetConfig, rng: &mut R) -> Self {
        let params = NetParams::init(&config, rng);
        Self { config, params }
    }

    fn tokenize(&self, state: &[f64]) -> Array2<f64> {
        let g = self.config.tokens();
        let d = self.config.token_dim;
        Array2::from_shape_fn((g, d), |(row, col)| {
            state.get(row * d + col).copied().unwrap_or(0.0)
        })
    }

    /// Q-values for one state, 1xA.
    pub fn forward(&self, state: &[f64]) -> Array2<f64> {
        self.forward_cached(state).0
    }

    /// Q-values plus the cache for a later backward pass.
    pub fn forward_cached(&self, state: &[f64]) -> (Array2<f64>, Cache) {
        let p = &self.params;
        let g = self.config.tokens();
        let e = self.config.embed_dim;
        let heads = self.config.heads;
        let dh = e / heads;
        let scale = 1.0 / (dh as f64).sqrt();

        let tokens = self.tokenize(state);
        let x = tokens.dot(&p.w_embed) + &p.b_embed;
        let qm = x.dot(&p.w_q);
        let km = x.dot(&p.w_k);
        let vm = x.dot(&p.w_v);

        let mut o = Array2::zeros((g, e));
        let mut attn = Vec::with_capacity(heads);
        for h in 0..heads {
            let cols = h * dh..(h + 1) * dh;
            let qh = qm.slice(s![.., cols.clone()]).to_owned();
            let kh = km.slice(s![.., cols.clone()]).to_owned();
            let vh = vm.slice(s![.., cols.clone()]).to_owned();
            let scores = qh.dot(&kh.t()) * scale;
            let a_h = softmax_rows(&scores);
            let o_h = a_h.dot(&vh);
            o.slice_mut(s![.., cols]).assign(&o_h);
            attn.push(a_h);
        }
        let attn_out = o.dot(&p.w_o);
        let hres = &x + &attn_out;
        let pooled = (hres.sum_axis(Axis(0)) / g as f64).insert_axis(Axis(0));

        let pre_fc = pooled.dot(&p.w_fc) + &p.b_fc;
        let f = pre_fc.mapv(|v| v.max(0.0));
        let value = f.dot(&p.w_value) + &p.b_value;
        let adv = f.dot(&p.w_adv) + &p.b_adv;
        let adv_mean = adv.sum() / self.config.actions as f64;
        let q = adv.mapv(|a| value[(0, 0)] + a - adv_mean);

        (
            q,
            Cache {
                tokens,
                x,
                qm,
                km,
                vm,
                attn,
                o,
                pooled,
                pre_fc,
                f,
            },
        )
    }

    /// Gradients of a loss with gradient `dq` (1xA) w.r.t. the Q output.
    pub fn backward(&self, cache: &Cache, dq: &Array2<f64>) -> NetParams {
        let p = &self.params;
        let g = self.config.tokens();
        let e = self.config.embed_dim;
        let heads = self.config.heads;
        let dh = e / heads;
        let scale = 1.0 / (dh as f64).sqrt();
        let actions = self.config.actions as f64;
        let mut grads = p.zeros_like();

        // Dueling combine: q_i = v + a_i - mean(a).
        let dq_sum = dq.sum();
        let d_adv = dq.mapv(|v| v) - dq_sum / actions;
        let d_value = Array2::from_elem((1, 1), dq_sum);

        grads.w_value = cache.f.t().dot(&d_value);
        grads.b_value = d_value.clone();
        grads.w_adv = cache.f.t().dot(&d_adv);
        grads.b_adv = d_adv.clone();

        let d_f = d_value.dot(&p.w_value.t()) + d_adv.dot(&p.w_adv.t());
        let relu_mask = cache.pre_fc.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let d_pre = &d_f * &relu_mask;
        grads.w_fc = cache.pooled.t().dot(&d_pre);
        grads.b_fc = d_pre.clone();
        let d_pooled = d_pre.dot(&p.w_fc.t());

        // Mean-pool spreads the gradient evenly over rows.
        let d_hres = Array2::from_shape_fn((g, e), |(_, col)| d_pooled[(0, col)] / g as f64);

        // Residual: Hres = X + O w_o.
        let mut d_x = d_hres.clone();
        grads.w_o = cache.o.t().dot(&d_hres);
        let d_o = d_hres.dot(&p.w_o.t());

        let mut d_qm = Array2::zeros((g, e));
        let mut d_km = Array2::zeros((g, e));
        let mut d_vm = Array2::zeros((g, e));
        for h in 0..heads {
            let cols = h * dh..(h + 1) * dh;
            let qh = cache.qm.slice(s![.., cols.clone()]).to_owned();
            let kh = cache.km.slice(s![.., cols.clone()]).to_owned();
            let vh = cache.vm.slice(s![.., cols.clone()]).to_owned();
            let a_h = &cache.attn[h];
            let d_oh = d_o.slice(s![.., cols.clone()]).to_owned();

            let d_a = d_oh.dot(&vh.t());
            let d_vh = a_h.t().dot(&d_oh);
            let row_dot = (&d_a * a_h).sum_axis(Axis(1)).insert_axis(Axis(1));
            let d_scores = a_h * &(&d_a - &row_dot) * scale;
            let d_qh = d_scores.dot(&kh);
            let d_kh = d_scores.t().dot(&qh);

            d_qm.slice_mut(s![.., cols.clone()]).assign(&d_qh);
            d_km.slice_mut(s![.., cols.clone()]).assign(&d_kh);
            d_vm.slice_mut(s![.., cols]).assign(&d_vh);
        }

        grads.w_q = cache.x.t().dot(&d_qm);
        grads.w_k = cache.x.t().dot(&d_km);
        grads.w_v = cache.x.t().dot(&d_vm);
        d_x = d_x + d_qm.dot(&p.w_q.t()) + d_km.dot(&p.w_k.t()) + d_vm.dot(&p.w_v.t());

        grads.w_embed = cache.tokens.t().dot(&d_x);
        grads.b_embed = d_x.sum_axis(Axis(0)).insert_axis(Axis(0));

        grads
    }
}

/// Adam optimizer with global-norm gradient clipping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    /// Learning rate
    pub lr: f64,
    /// First-moment decay
    pub beta1: f64,
    /// Second-moment decay
    pub beta2: f64,
    /// Numerical floor
    pub eps: f64,
    /// Gradient clip threshold (global L2 norm)
    pub clip_norm: f64,
    /// Update count
    pub step_count: u64,
    m: NetParams,
    v: NetParams,
}

impl Adam {
    /// Optimizer state shaped like `like`.
    pub fn new(lr: f64, clip_norm: f64, like: &NetParams) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            clip_norm,
            step_count: 0,
            m: like.zeros_like(),
            v: like.zeros_like(),
        }
    }

    /// Apply one clipped update.
    pub fn step(&mut self, params: &mut NetParams, grads: &mut NetParams) {
        let norm = grads.global_norm();
        if norm > self.clip_norm && norm > 0.0 {
            grads.scale(self.clip_norm / norm);
        }
        self.step_count += 1;
        let t = self.step_count as f64;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        let (lr, beta1, beta2, eps) = (self.lr, self.beta1, self.beta2, self.eps);
        for (((param, grad), m), v) in params
            .arrays_mut()
            .into_iter()
            .zip(grads.arrays())
            .zip(self.m.arrays_mut())
            .zip(self.v.arrays_mut())
        {
            Zip::from(param.view_mut())
                .and(grad.view())
                .and(m.view_mut())
                .and(v.view_mut())
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> (NetConfig, QNetwork) {
        let config = NetConfig {
            state_dim: 6,
            actions: 3,
            token_dim: 3,
            embed_dim: 8,
            heads: 2,
            hidden: 5,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let net = QNetwork::new(config, &mut rng);
        (config, net)
    }

    #[test]
    fn forward_is_deterministic() {
        let (_, net) = tiny();
        let state = [0.2, 0.4, 0.6, 0.1, 0.9, 0.5];
        let a = net.forward(&state);
        let b = net.forward(&state);
        assert_eq!(a, b);
    }

    #[test]
    fn dueling_combine_centers_advantage() {
        let (_, net) = tiny();
        let state = [0.3; 6];
        let (q, cache) = net.forward_cached(&state);
        // Q - V must be mean-centered.
        let value = cache.f.dot(&net.params.w_value) + &net.params.b_value;
        let centered: f64 = q.iter().map(|qa| qa - value[(0, 0)]).sum();
        assert!(centered.abs() < 1e-9);
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let (_, mut net) = tiny();
        let state = [0.2, -0.4, 0.6, 0.1, 0.9, -0.5];
        let target = Array2::from_shape_vec((1, 3), vec![0.5, -0.2, 0.1]).unwrap();

        let loss_of = |net: &QNetwork| -> f64 {
            let q = net.forward(&state);
            q.iter()
                .zip(target.iter())
                .map(|(qa, ya)| (qa - ya) * (qa - ya))
                .sum()
        };

        let (q, cache) = net.forward_cached(&state);
        let dq = (&q - &target) * 2.0;
        let grads = net.backward(&cache, &dq);

        let epsilon = 1e-6;
        let analytic = grads.arrays().map(|a| a.clone());
        for (index, _) in analytic.iter().enumerate() {
            // Probe a handful of entries per parameter tensor.
            let shape = analytic[index].dim();
            let probes = [(0, 0), (shape.0 / 2, shape.1 / 2)];
            for &(r, c) in &probes {
                let original = net.params.arrays()[index][(r, c)];
                net.params.arrays_mut()[index][(r, c)] = original + epsilon;
                let plus = loss_of(&net);
                net.params.arrays_mut()[index][(r, c)] = original - epsilon;
                let minus = loss_of(&net);
                net.params.arrays_mut()[index][(r, c)] = original;
                let numeric = (plus - minus) / (2.0 * epsilon);
                let exact = analytic[index][(r, c)];
                assert!(
                    (numeric - exact).abs() < 1e-4 * (1.0 + exact.abs()),
                    "param {index} entry ({r},{c}): numeric {numeric} vs analytic {exact}"
                );
            }
        }
    }

    #[test]
    fn clipping_caps_update_magnitude() {
        let (_, net) = tiny();
        let mut grads = net.params.clone();
        grads.scale(100.0);
        let norm = grads.global_norm();
        assert!(norm > 1.0);
        let mut clipped = grads.clone();
        let limit = 1.0;
        clipped.scale(limit / norm);
        assert!((clipped.global_norm() - limit).abs() < 1e-9);
    }

    #[test]
    fn polyak_blend_moves_target_toward_online() {
        let (config, net) = tiny();
        let mut rng = StdRng::seed_from_u64(99);
        let mut target = QNetwork::new(config, &mut rng);
        let before = (&target.params.w_fc - &net.params.w_fc).mapv(f64::abs).sum();
        target.params.blend_from(&net.params, 0.5);
        let after = (&target.params.w_fc - &net.params.w_fc).mapv(f64::abs).sum();
        assert!(after < before);
        target.params.blend_from(&net.params, 1.0);
        assert_eq!(target.params.w_fc, net.params.w_fc);
    }
}
