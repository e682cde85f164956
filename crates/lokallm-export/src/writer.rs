//! GGUF serialization of merged models.
//!
//! Tensor names and phi3 projection fusing follow llama.cpp. The vocabulary
//! is the byte-level one the adapter was trained with and is tagged
//! `tokenizer.ggml.model = "byte_level"`; runtimes that only know the stock
//! llama.cpp tokenizer models need a custom tokenizer for these files.

use crate::error::ExportResult;
use crate::gguf::{write_gguf, GgufFile, GgufTensor, GgufValue, GGUF_ALIGNMENT};
use crate::merge::MergedModel;
use crate::modelfile::jinja_chat_template;
use crate::names::{fuse_projections, gguf_tensor_name};
use crate::quant::{encode, ExportQuantization};
use lokallm_training::tokenizer::ByteTokenizer;
use std::io::Write;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub tensor_count: usize,
    pub bytes: u64,
}

/// Serializes a merged model into a single artifact stream.
pub trait ArtifactWriter: Send + Sync {
    fn format(&self) -> &'static str;

    fn write(
        &self,
        model: &MergedModel,
        quantization: ExportQuantization,
        out: &mut dyn Write,
    ) -> ExportResult<WriteSummary>;
}

#[derive(Debug, Clone, Default)]
pub struct GgufWriter;

impl GgufWriter {
    fn metadata(model: &MergedModel, quantization: ExportQuantization) -> Vec<(String, GgufValue)> {
        let arch = &model.architecture;
        let family = arch.family.as_str();
        let tokenizer = ByteTokenizer::new(model.tokenizer.clone());
        let tokens: Vec<String> = (0..tokenizer.vocab_size() as u32).map(|id| tokenizer.token_text(id)).collect();
        // 1 = normal token, 3 = control token.
        let token_types: Vec<i32> = (0..tokenizer.vocab_size()).map(|id| if id < 256 { 1 } else { 3 }).collect();
        let eos = tokenizer.eos_id();

        let mut kv = vec![
            ("general.architecture".to_string(), GgufValue::String(family.to_string())),
            ("general.name".to_string(), GgufValue::String(model.model_id.clone())),
            ("general.file_type".to_string(), GgufValue::U32(quantization.file_type())),
            ("general.quantization_version".to_string(), GgufValue::U32(2)),
            ("general.alignment".to_string(), GgufValue::U32(GGUF_ALIGNMENT as u32)),
            (format!("{family}.block_count"), GgufValue::U32(arch.num_layers as u32)),
            (format!("{family}.embedding_length"), GgufValue::U32(arch.hidden_size as u32)),
            (format!("{family}.feed_forward_length"), GgufValue::U32(arch.intermediate_size as u32)),
            (format!("{family}.context_length"), GgufValue::U32(model.tokenizer.model_max_length as u32)),
            ("tokenizer.ggml.model".to_string(), GgufValue::String("byte_level".to_string())),
            ("tokenizer.ggml.tokens".to_string(), GgufValue::StringArray(tokens)),
            ("tokenizer.ggml.token_type".to_string(), GgufValue::I32Array(token_types)),
            ("tokenizer.ggml.eos_token_id".to_string(), GgufValue::U32(eos)),
            ("tokenizer.ggml.padding_token_id".to_string(), GgufValue::U32(eos)),
            ("tokenizer.chat_template".to_string(), GgufValue::String(jinja_chat_template(model.chat_template))),
        ];
        kv.extend(model.provenance.iter().map(|(k, v)| (k.clone(), GgufValue::String(v.clone()))));
        kv
    }
}

impl ArtifactWriter for GgufWriter {
    fn format(&self) -> &'static str {
        "gguf"
    }

    fn write(
        &self,
        model: &MergedModel,
        quantization: ExportQuantization,
        out: &mut dyn Write,
    ) -> ExportResult<WriteSummary> {
        let tensors: Vec<GgufTensor> = fuse_projections(&model.architecture.family, &model.tensors)
            .iter()
            .map(|t| {
                let ggml_type = quantization.tensor_type(t.shape.len(), t.cols());
                // ggml lists the fastest-varying dimension first.
                let dims: Vec<u64> = t.shape.iter().rev().map(|d| *d as u64).collect();
                GgufTensor { name: gguf_tensor_name(&t.name), dims, ggml_type, data: encode(&t.data, ggml_type) }
            })
            .collect();
        debug!(tensors = tensors.len(), %quantization, "encoded tensors");

        let file = GgufFile { metadata: Self::metadata(model, quantization), tensors };
        let bytes = write_gguf(&file, out)?;
        Ok(WriteSummary { tensor_count: file.tensors.len(), bytes })
    }
}
