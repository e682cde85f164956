//! Low-rank adapters on top of 4-bit frozen projections.
//!
//! A target module computes `y = W x + (alpha / r) * B (A x)` where `W` is the
//! frozen quantized weight, `A` is `[r, in]` and `B` is `[out, r]`. Only `A`
//! and `B` are trained. `B` starts at zero so an untrained adapter is a no-op.

use crate::error::{TrainingError, TrainingResult};
use crate::job::{ComputeDType, LoraConfig, QuantizationConfig};
use crate::model::BaseModel;
use crate::quantization::{quantize_4bit, QuantizedTensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct LoraLayer {
    /// Base weight name without the `.weight` suffix.
    pub module: String,
    pub in_features: usize,
    pub out_features: usize,
    pub rank: usize,
    pub scaling: f32,
    /// Row-major `[rank, in_features]`.
    pub a: Vec<f32>,
    /// Row-major `[out_features, rank]`.
    pub b: Vec<f32>,
}

impl LoraLayer {
    /// Kaiming-uniform `A`, zero `B`.
    pub fn initialized(
        module: impl Into<String>,
        in_features: usize,
        out_features: usize,
        rank: usize,
        scaling: f32,
        rng: &mut StdRng,
    ) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let a = (0..rank * in_features).map(|_| rng.gen_range(-bound..bound)).collect();
        Self {
            module: module.into(),
            in_features,
            out_features,
            rank,
            scaling,
            a,
            b: vec![0.0; out_features * rank],
        }
    }

    pub fn from_parts(
        module: impl Into<String>,
        a: (Vec<usize>, Vec<f32>),
        b: (Vec<usize>, Vec<f32>),
        scaling: f32,
    ) -> TrainingResult<Self> {
        let module = module.into();
        let (a_shape, a) = a;
        let (b_shape, b) = b;
        if a_shape.len() != 2 || b_shape.len() != 2 || a_shape[0] != b_shape[1] {
            return Err(TrainingError::Artifact(format!(
                "adapter for {module} has incompatible shapes A{a_shape:?} B{b_shape:?}"
            )));
        }
        let (rank, in_features, out_features) = (a_shape[0], a_shape[1], b_shape[0]);
        if a.len() != rank * in_features || b.len() != out_features * rank {
            return Err(TrainingError::Artifact(format!("adapter for {module} has truncated data")));
        }
        Ok(Self { module, in_features, out_features, rank, scaling, a, b })
    }

    #[must_use]
    pub fn trainable_parameters(&self) -> usize {
        self.rank * (self.in_features + self.out_features)
    }

    #[must_use]
    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.module)
    }

    #[must_use]
    pub fn lora_a_name(&self) -> String {
        format!("{}.lora_A.weight", self.module)
    }

    #[must_use]
    pub fn lora_b_name(&self) -> String {
        format!("{}.lora_B.weight", self.module)
    }

    /// `h = A x`
    pub fn project_down(&self, x: &[f32], h: &mut [f32]) {
        for (k, hk) in h.iter_mut().enumerate() {
            let row = &self.a[k * self.in_features..(k + 1) * self.in_features];
            *hk = row.iter().zip(x).map(|(a, x)| a * x).sum();
        }
    }

    /// `out += scaling * B h`
    pub fn project_up_into(&self, h: &[f32], out: &mut [f32]) {
        for (o, y) in out.iter_mut().enumerate() {
            let row = &self.b[o * self.rank..(o + 1) * self.rank];
            *y += self.scaling * row.iter().zip(h).map(|(b, h)| b * h).sum::<f32>();
        }
    }

    /// Folds `scaling * B A` into a dense row-major `[out, in]` weight.
    pub fn merge_into(&self, weight: &mut [f32]) -> TrainingResult<()> {
        if weight.len() != self.out_features * self.in_features {
            return Err(TrainingError::Artifact(format!(
                "cannot merge adapter {} ([{}, {}]) into weight of {} values",
                self.module,
                self.out_features,
                self.in_features,
                weight.len()
            )));
        }
        for o in 0..self.out_features {
            let b_row = &self.b[o * self.rank..(o + 1) * self.rank];
            let w_row = &mut weight[o * self.in_features..(o + 1) * self.in_features];
            for (k, bk) in b_row.iter().enumerate() {
                if *bk == 0.0 {
                    continue;
                }
                let coeff = self.scaling * bk;
                let a_row = &self.a[k * self.in_features..(k + 1) * self.in_features];
                for (w, a) in w_row.iter_mut().zip(a_row) {
                    *w += coeff * a;
                }
            }
        }
        Ok(())
    }
}

/// Gradient buffers shaped like one [`LoraLayer`].
#[derive(Debug, Clone)]
pub struct LoraGrads {
    pub a: Vec<f32>,
    pub b: Vec<f32>,
}

impl LoraGrads {
    #[must_use]
    pub fn zeros_like(layer: &LoraLayer) -> Self {
        Self { a: vec![0.0; layer.a.len()], b: vec![0.0; layer.b.len()] }
    }

    pub fn scale(&mut self, factor: f32) {
        self.a.iter_mut().chain(self.b.iter_mut()).for_each(|g| *g *= factor);
    }

    #[must_use]
    pub fn norm_sq(&self) -> f64 {
        self.a.iter().chain(&self.b).map(|g| f64::from(*g) * f64::from(*g)).sum()
    }

    pub fn clear(&mut self) {
        self.a.fill(0.0);
        self.b.fill(0.0);
    }
}

/// Target-module weights in 4-bit storage; everything else stays frozen.
#[derive(Debug, Clone)]
pub struct QuantizedBase {
    pub modules: Vec<(String, QuantizedTensor)>,
    pub compute_dtype: ComputeDType,
    /// Parameters of the base model, target modules included.
    pub base_parameters: u64,
    frozen_dense_parameters: u64,
}

impl QuantizedBase {
    pub fn quantize(base: &BaseModel, config: &QuantizationConfig, target_modules: &[String]) -> TrainingResult<Self> {
        let mut modules = Vec::new();
        let mut frozen_dense = 0u64;
        for tensor in &base.tensors {
            if BaseModel::is_target(tensor, target_modules) {
                let q = quantize_4bit(&tensor.data, tensor.rows(), tensor.cols(), config)?;
                modules.push((tensor.name.clone(), q));
            } else {
                frozen_dense += tensor.numel() as u64;
            }
        }
        if modules.is_empty() {
            return Err(TrainingError::Quantization(format!(
                "none of the target modules {target_modules:?} exist in {}",
                base.model_id
            )));
        }
        Ok(Self {
            modules,
            compute_dtype: config.compute_dtype,
            base_parameters: base.total_parameters(),
            frozen_dense_parameters: frozen_dense,
        })
    }

    #[must_use]
    pub fn storage_bytes(&self) -> u64 {
        let quantized: u64 = self.modules.iter().map(|(_, q)| q.storage_bytes() as u64).sum();
        // Non-target tensors are held in half precision.
        quantized + self.frozen_dense_parameters * 2
    }
}

/// One training example projected into every module's input/output space.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    /// Prompt features keyed by input width.
    inputs: BTreeMap<usize, Vec<f32>>,
    /// Per module: `W x - t`, the error of the frozen model.
    residuals: Vec<Vec<f32>>,
    pub tokens: usize,
}

impl EncodedExample {
    fn cached_floats(&self) -> usize {
        self.inputs.values().map(Vec::len).sum::<usize>() + self.residuals.iter().map(Vec::len).sum::<usize>()
    }
}

fn fnv1a(parts: &[u32]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// Signed feature hashing of unigrams and bigrams, L2-normalised.
#[must_use]
pub fn hashed_features(tokens: &[u32], dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    if dim == 0 {
        return v;
    }
    let mut prev = u32::MAX;
    for &t in tokens {
        for h in [fnv1a(&[t]), fnv1a(&[prev, t])] {
            let idx = (h % dim as u64) as usize;
            v[idx] += if h >> 63 == 1 { -1.0 } else { 1.0 };
        }
        prev = t;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Quantized base with adapters attached to every target module.
#[derive(Debug, Clone)]
pub struct AdaptedModel {
    base: QuantizedBase,
    layers: Vec<LoraLayer>,
}

impl AdaptedModel {
    pub fn attach(base: QuantizedBase, config: &LoraConfig, seed: u64) -> TrainingResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let scaling = config.scaling() as f32;
        let layers: Vec<LoraLayer> = base
            .modules
            .iter()
            .map(|(name, q)| {
                let module = name.strip_suffix(".weight").unwrap_or(name);
                LoraLayer::initialized(module, q.cols(), q.rows(), config.r, scaling, &mut rng)
            })
            .collect();
        debug!(layers = layers.len(), rank = config.r, scaling, "adapters attached");
        Ok(Self { base, layers })
    }

    #[must_use]
    pub fn layers(&self) -> &[LoraLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LoraLayer] {
        &mut self.layers
    }

    #[must_use]
    pub fn into_layers(self) -> Vec<LoraLayer> {
        self.layers
    }

    #[must_use]
    pub fn trainable_parameters(&self) -> u64 {
        self.layers.iter().map(|l| l.trainable_parameters() as u64).sum()
    }

    /// Parameters of the frozen base model, adapters excluded.
    #[must_use]
    pub fn base_parameters(&self) -> u64 {
        self.base.base_parameters
    }

    /// Projects prompt and completion tokens into every module's space and
    /// caches the frozen model's error against the completion.
    #[must_use]
    pub fn encode(&self, prompt_ids: &[u32], completion_ids: &[u32]) -> EncodedExample {
        let dtype = self.base.compute_dtype;
        let mut inputs: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        let mut targets: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        let mut residuals = Vec::with_capacity(self.base.modules.len());

        for (_, weight) in &self.base.modules {
            let x = inputs.entry(weight.cols()).or_insert_with(|| hashed_features(prompt_ids, weight.cols()));
            let t = targets
                .entry(weight.rows())
                .or_insert_with(|| hashed_features(completion_ids, weight.rows()));
            let mut y = vec![0.0f32; weight.rows()];
            weight.matvec(x.as_slice(), &mut y);
            for (yv, tv) in y.iter_mut().zip(t.iter()) {
                *yv = dtype.round(*yv) - tv;
            }
            residuals.push(y);
        }

        EncodedExample { inputs, residuals, tokens: prompt_ids.len() + completion_ids.len() }
    }

    /// Runs forward and backward for one example, adding `weight`-scaled
    /// gradients into `grads`. Returns the example's mean squared error.
    pub fn forward_backward(
        &self,
        example: &EncodedExample,
        dropout: f32,
        rng: &mut StdRng,
        grads: &mut [LoraGrads],
        weight: f32,
    ) -> f32 {
        let dtype = self.base.compute_dtype;
        let mut total = 0.0f32;

        for ((layer, residual), grad) in self.layers.iter().zip(&example.residuals).zip(grads.iter_mut()) {
            let Some(x) = example.inputs.get(&layer.in_features) else {
                continue;
            };
            let x: Vec<f32> = if dropout > 0.0 {
                let keep = 1.0 / (1.0 - dropout);
                x.iter().map(|v| if rng.gen_range(0.0f32..1.0) < dropout { 0.0 } else { v * keep }).collect()
            } else {
                x.clone()
            };

            let mut h = vec![0.0f32; layer.rank];
            layer.project_down(&x, &mut h);
            let mut err = residual.clone();
            layer.project_up_into(&h, &mut err);
            err.iter_mut().for_each(|e| *e = dtype.round(*e));

            let n = err.len() as f32;
            total += err.iter().map(|e| e * e).sum::<f32>() / n;

            // dL/dy for mean squared error.
            let g: Vec<f32> = err.iter().map(|e| 2.0 * e / n * weight).collect();

            let mut dh = vec![0.0f32; layer.rank];
            for (o, go) in g.iter().enumerate() {
                if *go == 0.0 {
                    continue;
                }
                let b_row = &layer.b[o * layer.rank..(o + 1) * layer.rank];
                let gb_row = &mut grad.b[o * layer.rank..(o + 1) * layer.rank];
                for k in 0..layer.rank {
                    gb_row[k] += layer.scaling * go * h[k];
                    dh[k] += layer.scaling * b_row[k] * go;
                }
            }
            for (k, dhk) in dh.iter().enumerate() {
                if *dhk == 0.0 {
                    continue;
                }
                let ga_row = &mut grad.a[k * layer.in_features..(k + 1) * layer.in_features];
                for (ga, xi) in ga_row.iter_mut().zip(&x) {
                    *ga += dhk * xi;
                }
            }
        }

        total / self.layers.len().max(1) as f32
    }

    /// Rough peak memory for training over `examples`, in bytes.
    #[must_use]
    pub fn estimated_training_bytes(&self, examples: &[EncodedExample]) -> u64 {
        let trainable = self.trainable_parameters();
        // Parameters, gradients and two AdamW moments, all f32.
        let adapter = trainable * 4 * 4;
        let cache: u64 = examples.iter().map(|e| e.cached_floats() as u64 * 4).sum();
        self.base.storage_bytes() + adapter + cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, WeightTensor};
    use crate::template::ChatTemplate;

    fn tiny_base() -> BaseModel {
        let mut rng = StdRng::seed_from_u64(1);
        let mut dense = |name: &str, rows: usize, cols: usize| WeightTensor {
            name: name.to_string(),
            shape: vec![rows, cols],
            data: (0..rows * cols).map(|_| rng.gen_range(-0.2f32..0.2)).collect(),
        };
        let tensors = vec![
            dense("model.embed_tokens.weight", 300, 16),
            dense("model.layers.0.self_attn.q_proj.weight", 16, 16),
            dense("model.layers.0.mlp.down_proj.weight", 16, 32),
        ];
        BaseModel {
            model_id: "tiny".to_string(),
            architecture: Architecture {
                family: "llama".to_string(),
                hidden_size: 16,
                intermediate_size: 32,
                num_layers: 1,
            },
            chat_template: ChatTemplate::Phi3,
            tensors,
        }
    }

    fn lora_config(rank: usize) -> LoraConfig {
        LoraConfig { r: rank, alpha: 8.0, dropout: 0.0, target_modules: vec!["q_proj".into(), "down_proj".into()] }
    }

    #[test]
    fn test_trainable_parameters_are_a_small_fraction() {
        let base = tiny_base();
        let q = QuantizedBase::quantize(&base, &QuantizationConfig::default(), &lora_config(2).target_modules).unwrap();
        let model = AdaptedModel::attach(q, &lora_config(2), 0).unwrap();
        // q_proj: 2 * (16 + 16), down_proj: 2 * (32 + 16)
        assert_eq!(model.trainable_parameters(), 64 + 96);
        assert_eq!(model.base_parameters(), base.total_parameters());
        assert!(model.trainable_parameters() < model.base_parameters());
    }

    #[test]
    fn test_missing_target_modules_is_an_error() {
        let base = tiny_base();
        let err = QuantizedBase::quantize(&base, &QuantizationConfig::default(), &["gate_proj".to_string()]);
        assert!(matches!(err, Err(TrainingError::Quantization(_))));
    }

    #[test]
    fn test_fresh_adapter_merge_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = LoraLayer::initialized("m", 8, 4, 2, 2.0, &mut rng);
        let mut w = vec![0.5f32; 32];
        layer.merge_into(&mut w).unwrap();
        assert!(w.iter().all(|v| (*v - 0.5).abs() < f32::EPSILON));
    }

    #[test]
    fn test_merge_matches_forward_delta() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = LoraLayer::initialized("m", 6, 3, 2, 0.5, &mut rng);
        layer.b = (0..6).map(|i| i as f32 * 0.1).collect();
        let x: Vec<f32> = (0..6).map(|i| 1.0 - i as f32 * 0.2).collect();

        let mut h = vec![0.0; 2];
        layer.project_down(&x, &mut h);
        let mut delta = vec![0.0; 3];
        layer.project_up_into(&h, &mut delta);

        let mut w = vec![0.0f32; 18];
        layer.merge_into(&mut w).unwrap();
        for o in 0..3 {
            let merged: f32 = (0..6).map(|i| w[o * 6 + i] * x[i]).sum();
            assert!((merged - delta[o]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gradient_step_reduces_loss() {
        let base = tiny_base();
        let mut config = QuantizationConfig::default();
        config.compute_dtype = ComputeDType::F32;
        let q = QuantizedBase::quantize(&base, &config, &lora_config(4).target_modules).unwrap();
        let mut model = AdaptedModel::attach(q, &lora_config(4), 9).unwrap();
        let example = model.encode(&[1, 2, 3, 4], &[10, 11, 12]);

        let mut rng = StdRng::seed_from_u64(0);
        let mut grads: Vec<LoraGrads> = model.layers().iter().map(LoraGrads::zeros_like).collect();
        let before = model.forward_backward(&example, 0.0, &mut rng, &mut grads, 1.0);
        for _ in 0..20 {
            for (layer, grad) in model.layers_mut().iter_mut().zip(&grads) {
                layer.a.iter_mut().zip(&grad.a).for_each(|(p, g)| *p -= 0.5 * g);
                layer.b.iter_mut().zip(&grad.b).for_each(|(p, g)| *p -= 0.5 * g);
            }
            grads.iter_mut().for_each(LoraGrads::clear);
            model.forward_backward(&example, 0.0, &mut rng, &mut grads, 1.0);
        }
        let mut scratch: Vec<LoraGrads> = model.layers().iter().map(LoraGrads::zeros_like).collect();
        let after = model.forward_backward(&example, 0.0, &mut rng, &mut scratch, 1.0);
        assert!(after < before, "loss {before} -> {after}");
    }

    #[test]
    fn test_hashed_features_are_normalised_and_deterministic() {
        let a = hashed_features(&[5, 6, 7], 32);
        let b = hashed_features(&[5, 6, 7], 32);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(hashed_features(&[], 8).iter().all(|x| *x == 0.0));
    }
}
