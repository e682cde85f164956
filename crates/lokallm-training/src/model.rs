//! Base-model weights and the sources that load them.

use crate::error::{TrainingError, TrainingResult};
use crate::template::ChatTemplate;
use crate::tokenizer::TokenizerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Descriptor file recognised inside a local model directory.
pub const MODEL_DESCRIPTOR_FILE: &str = "lokallm_model.json";

/// A named dense tensor. Matrices are row-major `[out_features, in_features]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl WeightTensor {
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        if self.shape.len() >= 2 { self.shape[1] } else { 1 }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns the module name if this tensor is `<...>.<module>.weight`.
    #[must_use]
    pub fn module_name(&self) -> Option<&str> {
        self.name.strip_suffix(".weight").and_then(|stem| stem.rsplit('.').next())
    }
}

/// Decoder-only transformer dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    /// Family tag written into exported metadata (e.g. `phi3`, `llama`).
    pub family: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_layers: usize,
}

#[derive(Debug, Clone)]
pub struct BaseModel {
    pub model_id: String,
    pub architecture: Architecture,
    pub chat_template: ChatTemplate,
    pub tensors: Vec<WeightTensor>,
}

impl BaseModel {
    #[must_use]
    pub fn total_parameters(&self) -> u64 {
        self.tensors.iter().map(|t| t.numel() as u64).sum()
    }

    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&WeightTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Whether `tensor` is one of the adapter target modules.
    #[must_use]
    pub fn is_target(tensor: &WeightTensor, target_modules: &[String]) -> bool {
        tensor.shape.len() == 2
            && tensor.module_name().is_some_and(|m| target_modules.iter().any(|t| t == m))
    }

    /// SHA-256 over names, shapes and little-endian weight bytes.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id.as_bytes());
        for t in &self.tensors {
            hasher.update(t.name.as_bytes());
            for d in &t.shape {
                hasher.update((*d as u64).to_le_bytes());
            }
            for v in &t.data {
                hasher.update(v.to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn tokenizer_config(&self, max_seq_len: usize) -> TokenizerConfig {
        TokenizerConfig::for_template(self.chat_template, max_seq_len)
    }
}

/// Loads base weights for a model identifier.
pub trait BaseModelSource: Send + Sync {
    fn id(&self) -> &'static str;

    fn load(&self, model_id: &str) -> TrainingResult<BaseModel>;
}

/// On-disk descriptor of a local proxy model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub architecture: Architecture,
    pub chat_template: ChatTemplate,
    #[serde(default)]
    pub seed: Option<u64>,
}

struct CatalogEntry {
    model_id: &'static str,
    family: &'static str,
    chat_template: ChatTemplate,
    hidden_size: usize,
    intermediate_size: usize,
    num_layers: usize,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        model_id: "microsoft/Phi-3-mini-4k-instruct",
        family: "phi3",
        chat_template: ChatTemplate::Phi3,
        hidden_size: 256,
        intermediate_size: 704,
        num_layers: 4,
    },
    CatalogEntry {
        model_id: "Qwen/Qwen2.5-0.5B-Instruct",
        family: "qwen2",
        chat_template: ChatTemplate::ChatMl,
        hidden_size: 128,
        intermediate_size: 352,
        num_layers: 4,
    },
    CatalogEntry {
        model_id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
        family: "llama",
        chat_template: ChatTemplate::Zephyr,
        hidden_size: 192,
        intermediate_size: 512,
        num_layers: 4,
    },
];

/// Deterministic CPU source of scaled proxy weights.
///
/// Known instruct models resolve from a built-in catalogue; any other
/// identifier must be a directory holding a `lokallm_model.json` descriptor.
/// Weights are generated from a seed derived from the identifier, so the same
/// identifier always yields bit-identical tensors.
#[derive(Debug, Clone, Default)]
pub struct ReferenceHub;

impl ReferenceHub {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Identifiers available without a local descriptor.
    #[must_use]
    pub fn catalog() -> Vec<&'static str> {
        CATALOG.iter().map(|e| e.model_id).collect()
    }

    fn resolve(model_id: &str) -> TrainingResult<ModelDescriptor> {
        if let Some(entry) = CATALOG.iter().find(|e| e.model_id.eq_ignore_ascii_case(model_id)) {
            return Ok(ModelDescriptor {
                architecture: Architecture {
                    family: entry.family.to_string(),
                    hidden_size: entry.hidden_size,
                    intermediate_size: entry.intermediate_size,
                    num_layers: entry.num_layers,
                },
                chat_template: entry.chat_template,
                seed: None,
            });
        }

        let dir = Path::new(model_id);
        if !dir.is_dir() {
            return Err(TrainingError::model_load(
                model_id,
                format!("not a known model and not a local model directory (known: {})", Self::catalog().join(", ")),
            ));
        }
        let path = dir.join(MODEL_DESCRIPTOR_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| TrainingError::model_load(model_id, format!("cannot read {}: {e}", path.display())))?;
        let descriptor: ModelDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::model_load(model_id, format!("malformed {}: {e}", path.display())))?;

        let arch = &descriptor.architecture;
        if arch.hidden_size == 0 || arch.intermediate_size == 0 || arch.num_layers == 0 {
            return Err(TrainingError::model_load(model_id, "architecture dimensions must be non-zero"));
        }
        Ok(descriptor)
    }

    fn seed_for(model_id: &str, descriptor: &ModelDescriptor) -> u64 {
        descriptor.seed.unwrap_or_else(|| {
            let digest = Sha256::digest(model_id.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            u64::from_le_bytes(bytes)
        })
    }
}

fn uniform_tensor(rng: &mut StdRng, name: String, rows: usize, cols: usize) -> WeightTensor {
    let bound = 1.0 / (cols as f32).sqrt();
    let data = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    WeightTensor { name, shape: vec![rows, cols], data }
}

fn norm_tensor(rng: &mut StdRng, name: String, size: usize) -> WeightTensor {
    let data = (0..size).map(|_| 1.0 + rng.gen_range(-0.02f32..0.02)).collect();
    WeightTensor { name, shape: vec![size], data }
}

impl BaseModelSource for ReferenceHub {
    fn id(&self) -> &'static str {
        "reference"
    }

    fn load(&self, model_id: &str) -> TrainingResult<BaseModel> {
        let descriptor = Self::resolve(model_id)?;
        let arch = descriptor.architecture.clone();
        let vocab = TokenizerConfig::for_template(descriptor.chat_template, 1).vocab_size();
        let mut rng = StdRng::seed_from_u64(Self::seed_for(model_id, &descriptor));

        debug!(model_id, family = %arch.family, hidden = arch.hidden_size, layers = arch.num_layers, "materialising base weights");

        let (h, i) = (arch.hidden_size, arch.intermediate_size);
        let mut tensors = vec![uniform_tensor(&mut rng, "model.embed_tokens.weight".to_string(), vocab, h)];
        for layer in 0..arch.num_layers {
            let p = format!("model.layers.{layer}");
            tensors.push(norm_tensor(&mut rng, format!("{p}.input_layernorm.weight"), h));
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                tensors.push(uniform_tensor(&mut rng, format!("{p}.self_attn.{proj}.weight"), h, h));
            }
            tensors.push(norm_tensor(&mut rng, format!("{p}.post_attention_layernorm.weight"), h));
            tensors.push(uniform_tensor(&mut rng, format!("{p}.mlp.gate_proj.weight"), i, h));
            tensors.push(uniform_tensor(&mut rng, format!("{p}.mlp.up_proj.weight"), i, h));
            tensors.push(uniform_tensor(&mut rng, format!("{p}.mlp.down_proj.weight"), h, i));
        }
        tensors.push(norm_tensor(&mut rng, "model.norm.weight".to_string(), h));
        tensors.push(uniform_tensor(&mut rng, "lm_head.weight".to_string(), vocab, h));

        let model = BaseModel {
            model_id: model_id.to_string(),
            architecture: arch,
            chat_template: descriptor.chat_template,
            tensors,
        };
        info!(model_id, parameters = model.total_parameters(), "base model loaded");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_catalog_model_loads_deterministically() {
        let hub = ReferenceHub::new();
        let a = hub.load("Qwen/Qwen2.5-0.5B-Instruct").unwrap();
        let b = hub.load("Qwen/Qwen2.5-0.5B-Instruct").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.chat_template, ChatTemplate::ChatMl);
        assert!(a.tensor("model.layers.0.self_attn.q_proj.weight").is_some());
    }

    #[test]
    fn test_different_models_have_different_fingerprints() {
        let hub = ReferenceHub::new();
        let phi = hub.load("microsoft/Phi-3-mini-4k-instruct").unwrap();
        let tiny = hub.load("TinyLlama/TinyLlama-1.1B-Chat-v1.0").unwrap();
        assert_ne!(phi.fingerprint(), tiny.fingerprint());
    }

    #[test]
    fn test_unknown_model_fails_to_load() {
        let err = ReferenceHub::new().load("acme/does-not-exist").unwrap_err();
        assert!(matches!(err, TrainingError::ModelLoad { .. }));
    }

    #[test]
    fn test_local_descriptor_directory() {
        let temp = TempDir::new().unwrap();
        let descriptor = ModelDescriptor {
            architecture: Architecture {
                family: "llama".to_string(),
                hidden_size: 32,
                intermediate_size: 64,
                num_layers: 1,
            },
            chat_template: ChatTemplate::Zephyr,
            seed: Some(7),
        };
        std::fs::write(
            temp.path().join(MODEL_DESCRIPTOR_FILE),
            serde_json::to_vec(&descriptor).unwrap(),
        )
        .unwrap();

        let model = ReferenceHub::new().load(temp.path().to_str().unwrap()).unwrap();
        assert_eq!(model.architecture.hidden_size, 32);
        let targets: Vec<_> = model
            .tensors
            .iter()
            .filter(|t| BaseModel::is_target(t, &["q_proj".to_string(), "down_proj".to_string()]))
            .collect();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_malformed_descriptor_is_a_load_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(MODEL_DESCRIPTOR_FILE), b"{ not json").unwrap();
        let err = ReferenceHub::new().load(temp.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, TrainingError::ModelLoad { .. }));
    }
}
