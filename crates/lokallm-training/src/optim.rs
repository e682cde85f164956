use crate::job::SchedulerType;
use crate::lora::{LoraGrads, LoraLayer};

/// Learning-rate schedule with linear warmup.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
    kind: SchedulerType,
}

impl LrSchedule {
    #[must_use]
    pub fn new(kind: SchedulerType, base_lr: f64, total_steps: u64, warmup_ratio: f64) -> Self {
        let warmup_steps = (total_steps as f64 * warmup_ratio).ceil() as u64;
        Self { base_lr, warmup_steps, total_steps: total_steps.max(1), kind }
    }

    #[must_use]
    pub fn warmup_steps(&self) -> u64 {
        self.warmup_steps
    }

    /// Learning rate for the zero-based optimizer step.
    #[must_use]
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        match self.kind {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Linear => self.base_lr * (1.0 - progress),
            SchedulerType::Cosine => self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        }
    }
}

/// Scales gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [LoraGrads], max_norm: f64) -> f64 {
    let norm = grads.iter().map(LoraGrads::norm_sq).sum::<f64>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let factor = (max_norm / norm) as f32;
        grads.iter_mut().for_each(|g| g.scale(factor));
    }
    norm
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// AdamW with decoupled weight decay, one moment pair per adapter matrix.
#[derive(Debug, Clone)]
pub struct AdamW {
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: i32,
    state: Vec<(Moments, Moments)>,
}

impl AdamW {
    #[must_use]
    pub fn new(layers: &[LoraLayer], weight_decay: f64) -> Self {
        let state = layers
            .iter()
            .map(|l| {
                (
                    Moments { m: vec![0.0; l.a.len()], v: vec![0.0; l.a.len()] },
                    Moments { m: vec![0.0; l.b.len()], v: vec![0.0; l.b.len()] },
                )
            })
            .collect();
        Self { beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay: weight_decay as f32, step: 0, state }
    }

    pub fn step(&mut self, layers: &mut [LoraLayer], grads: &[LoraGrads], lr: f64) {
        self.step += 1;
        let lr = lr as f32;
        let bc1 = 1.0 - self.beta1.powi(self.step);
        let bc2 = 1.0 - self.beta2.powi(self.step);

        for ((layer, grad), (ma, mb)) in layers.iter_mut().zip(grads).zip(self.state.iter_mut()) {
            for (params, g, moments) in [(&mut layer.a, &grad.a, ma), (&mut layer.b, &grad.b, mb)] {
                for i in 0..params.len() {
                    moments.m[i] = self.beta1 * moments.m[i] + (1.0 - self.beta1) * g[i];
                    moments.v[i] = self.beta2 * moments.v[i] + (1.0 - self.beta2) * g[i] * g[i];
                    let m_hat = moments.m[i] / bc1;
                    let v_hat = moments.v[i] / bc2;
                    params[i] -= lr * (m_hat / (v_hat.sqrt() + self.eps) + self.weight_decay * params[i]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_constant_schedule_with_warmup() {
        let s = LrSchedule::new(SchedulerType::Constant, 1e-3, 100, 0.03);
        assert_eq!(s.warmup_steps(), 3);
        assert!((s.lr_at(0) - 1e-3 / 3.0).abs() < 1e-12);
        assert!((s.lr_at(2) - 1e-3).abs() < 1e-12);
        assert!((s.lr_at(99) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_decaying_schedules_end_low() {
        let linear = LrSchedule::new(SchedulerType::Linear, 1.0, 10, 0.0);
        assert!((linear.lr_at(0) - 1.0).abs() < 1e-12);
        assert!(linear.lr_at(9) < 0.2);

        let cosine = LrSchedule::new(SchedulerType::Cosine, 1.0, 10, 0.0);
        assert!(cosine.lr_at(5) < cosine.lr_at(1));
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = LoraLayer::initialized("m", 4, 4, 1, 1.0, &mut rng);
        let mut grads = vec![LoraGrads::zeros_like(&layer)];
        grads[0].a.fill(3.0);
        grads[0].b.fill(4.0);
        let before = clip_grad_norm(&mut grads, 0.3);
        assert!(before > 0.3);
        let after = grads.iter().map(LoraGrads::norm_sq).sum::<f64>().sqrt();
        assert!((after - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_adamw_moves_against_gradient() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layers = vec![LoraLayer::initialized("m", 2, 2, 1, 1.0, &mut rng)];
        let mut grads = vec![LoraGrads::zeros_like(&layers[0])];
        grads[0].b.fill(1.0);
        let mut opt = AdamW::new(&layers, 0.0);
        opt.step(&mut layers, &grads, 0.1);
        assert!(layers[0].b.iter().all(|b| (*b + 0.1).abs() < 1e-4));
    }
}
