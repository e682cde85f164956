//! Reading and writing adapter directories.

use crate::artifacts::{read_manifest, verify_artifacts, ArtifactKind, TrainingManifest};
use crate::error::{TrainingError, TrainingResult};
use crate::job::{LoraConfig, QuantizationConfig};
use crate::layout::AdapterLayout;
use crate::lora::LoraLayer;
use crate::safetensors::{read_safetensors, write_safetensors, TensorView};
use crate::template::ChatTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// `adapter_config.json`, in the field naming PEFT uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub task_type: String,
    pub base_model_name_or_path: String,
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    pub bias: String,
    pub quantization: QuantizationConfig,
    pub chat_template: ChatTemplate,
}

impl AdapterConfig {
    #[must_use]
    pub fn new(base_model: &str, lora: &LoraConfig, quantization: &QuantizationConfig, chat_template: ChatTemplate) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            task_type: "CAUSAL_LM".to_string(),
            base_model_name_or_path: base_model.to_string(),
            r: lora.r,
            lora_alpha: lora.alpha,
            lora_dropout: lora.dropout,
            target_modules: lora.target_modules.clone(),
            bias: "none".to_string(),
            quantization: quantization.clone(),
            chat_template,
        }
    }

    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

pub fn save_adapter_weights(path: &Path, layers: &[LoraLayer], base_model: &str) -> TrainingResult<()> {
    let mut tensors: Vec<TensorView<'_>> = Vec::with_capacity(layers.len() * 2);
    for layer in layers {
        tensors.push((layer.lora_a_name(), vec![layer.rank, layer.in_features], layer.a.as_slice()));
        tensors.push((layer.lora_b_name(), vec![layer.out_features, layer.rank], layer.b.as_slice()));
    }
    let mut metadata = BTreeMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    metadata.insert("base_model".to_string(), base_model.to_string());
    write_safetensors(path, &tensors, &metadata)
}

/// Pairs up `<module>.lora_A.weight` / `<module>.lora_B.weight` tensors.
pub fn load_adapter_weights(path: &Path, scaling: f32) -> TrainingResult<Vec<LoraLayer>> {
    let (mut tensors, _) = read_safetensors(path)?;
    let modules: Vec<String> = tensors
        .keys()
        .filter_map(|k| k.strip_suffix(".lora_A.weight").map(str::to_string))
        .collect();

    let mut layers = Vec::with_capacity(modules.len());
    for module in modules {
        let a = tensors.remove(&format!("{module}.lora_A.weight"));
        let b = tensors.remove(&format!("{module}.lora_B.weight"));
        let (Some(a), Some(b)) = (a, b) else {
            return Err(TrainingError::Artifact(format!("adapter for {module} is missing lora_B")));
        };
        layers.push(LoraLayer::from_parts(module, a, b, scaling)?);
    }
    if let Some(stray) = tensors.keys().next() {
        return Err(TrainingError::Artifact(format!("unpaired adapter tensor {stray}")));
    }
    Ok(layers)
}

/// A verified adapter directory, ready to merge.
#[derive(Debug, Clone)]
pub struct LoadedAdapter {
    pub manifest: TrainingManifest,
    pub config: AdapterConfig,
    pub layers: Vec<LoraLayer>,
}

/// Artifacts every adapter manifest must record.
const REQUIRED_ARTIFACTS: [ArtifactKind; 4] = [
    ArtifactKind::AdapterWeights,
    ArtifactKind::AdapterConfig,
    ArtifactKind::Tokenizer,
    ArtifactKind::TokenizerConfig,
];

/// Opens an adapter directory: reads the manifest, verifies every recorded
/// digest, then loads the config and weights.
pub fn open_adapter(dir: &Path) -> TrainingResult<LoadedAdapter> {
    let layout = AdapterLayout::new(dir);
    let manifest = read_manifest(&layout.manifest_path())?;
    for kind in &REQUIRED_ARTIFACTS {
        if manifest.artifact(kind).is_none() {
            return Err(TrainingError::Artifact(format!("manifest does not record the {kind:?} artifact")));
        }
    }
    verify_artifacts(&manifest, dir)?;

    let config_path = layout.adapter_config_path();
    let bytes = std::fs::read(&config_path)
        .map_err(|e| TrainingError::Artifact(format!("cannot read {}: {e}", config_path.display())))?;
    let config: AdapterConfig = serde_json::from_slice(&bytes)?;
    if config.base_model_name_or_path != manifest.base_model {
        return Err(TrainingError::Artifact(format!(
            "adapter config names base model {} but the manifest records {}",
            config.base_model_name_or_path, manifest.base_model
        )));
    }

    let layers = load_adapter_weights(&layout.weights_path(), config.scaling() as f32)?;
    debug!(dir = %dir.display(), layers = layers.len(), "adapter opened");
    Ok(LoadedAdapter { manifest, config, layers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    #[test]
    fn test_weights_survive_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("adapter_model.safetensors");
        let mut rng = StdRng::seed_from_u64(5);
        let mut q = LoraLayer::initialized("model.layers.0.self_attn.q_proj", 8, 8, 2, 1.0, &mut rng);
        q.b[3] = 0.25;
        let down = LoraLayer::initialized("model.layers.0.mlp.down_proj", 16, 8, 2, 1.0, &mut rng);

        save_adapter_weights(&path, &[q.clone(), down.clone()], "tiny").unwrap();
        let mut loaded = load_adapter_weights(&path, 1.0).unwrap();
        loaded.sort_by(|a, b| a.module.cmp(&b.module));

        assert_eq!(loaded, vec![down, q]);
    }

    #[test]
    fn test_adapter_config_uses_peft_names() {
        let config = AdapterConfig::new(
            "microsoft/Phi-3-mini-4k-instruct",
            &LoraConfig::default(),
            &QuantizationConfig::default(),
            ChatTemplate::Phi3,
        );
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["peft_type"], "LORA");
        assert_eq!(json["lora_alpha"], 16.0);
        assert!((config.scaling() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_open_adapter_without_manifest_fails() {
        let temp = TempDir::new().unwrap();
        let err = open_adapter(temp.path()).unwrap_err();
        assert!(matches!(err, TrainingError::Artifact(_)));
    }
}
