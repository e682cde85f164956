//! Folds a trained adapter back into dense base weights.

use crate::error::{ExportError, ExportResult};
use lokallm_training::quantization::quantize_4bit;
use lokallm_training::tokenizer::TokenizerConfig;
use lokallm_training::{Architecture, BaseModel, ChatTemplate, LoadedAdapter, WeightTensor};
use std::collections::HashMap;
use tracing::debug;

/// Dense weights with every adapter merged in, plus what an exporter needs
/// to describe them.
#[derive(Debug, Clone)]
pub struct MergedModel {
    pub model_id: String,
    pub architecture: Architecture,
    pub chat_template: ChatTemplate,
    pub tokenizer: TokenizerConfig,
    pub tensors: Vec<WeightTensor>,
    pub merged_modules: usize,
    /// Extra provenance written into the file metadata.
    pub provenance: Vec<(String, String)>,
}

/// Re-applies the training quantization to each target weight, dequantizes it
/// and adds `scaling * B A`. Non-target tensors are copied unchanged.
pub fn merge_adapter(base: BaseModel, adapter: &LoadedAdapter) -> ExportResult<MergedModel> {
    let quant = &adapter.config.quantization;
    let mut layers: HashMap<String, _> = adapter.layers.iter().map(|l| (l.weight_name(), l)).collect();
    let mut merged_modules = 0usize;
    let mut tensors = Vec::with_capacity(base.tensors.len());

    for tensor in base.tensors {
        let Some(layer) = layers.remove(&tensor.name) else {
            tensors.push(tensor);
            continue;
        };
        if tensor.rows() != layer.out_features || tensor.cols() != layer.in_features {
            return Err(ExportError::Merge(format!(
                "adapter for {} expects [{}, {}] but the base weight is {:?}",
                layer.module, layer.out_features, layer.in_features, tensor.shape
            )));
        }
        let mut data = quantize_4bit(&tensor.data, tensor.rows(), tensor.cols(), quant)?.dequantize();
        layer.merge_into(&mut data)?;
        debug!(tensor = %tensor.name, rank = layer.rank, "merged adapter");
        merged_modules += 1;
        tensors.push(WeightTensor { data, ..tensor });
    }

    if let Some(unmatched) = layers.keys().next() {
        return Err(ExportError::Merge(format!("base model has no weight named {unmatched}")));
    }

    let max_len = adapter.manifest.config.hyperparams.max_seq_len as usize;
    let manifest = &adapter.manifest;
    Ok(MergedModel {
        tokenizer: TokenizerConfig::for_template(base.chat_template, max_len),
        model_id: base.model_id,
        architecture: base.architecture,
        chat_template: base.chat_template,
        tensors,
        merged_modules,
        provenance: vec![
            ("lokallm.adapter.job_id".to_string(), manifest.job_id.to_string()),
            ("lokallm.adapter.dataset_id".to_string(), manifest.dataset_id.0.clone()),
            ("lokallm.base.fingerprint".to_string(), manifest.base_fingerprint.clone()),
            ("lokallm.lora.rank".to_string(), adapter.config.r.to_string()),
            ("lokallm.lora.alpha".to_string(), adapter.config.lora_alpha.to_string()),
        ],
    })
}
