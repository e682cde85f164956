//! Tensor layout and naming as llama.cpp expects it.

use lokallm_training::WeightTensor;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

/// Projections phi3 stores as one fused matrix, rows stacked in order.
const PHI3_FUSED: [(&str, &[&str]); 2] = [
    (
        "self_attn.qkv_proj.weight",
        &["self_attn.q_proj.weight", "self_attn.k_proj.weight", "self_attn.v_proj.weight"],
    ),
    ("mlp.gate_up_proj.weight", &["mlp.gate_proj.weight", "mlp.up_proj.weight"]),
];

/// Stacks per-layer q/k/v and gate/up projections for families whose
/// loader expects them fused. Other families are returned as is.
#[must_use]
pub fn fuse_projections<'a>(family: &str, tensors: &'a [WeightTensor]) -> Cow<'a, [WeightTensor]> {
    if family != "phi3" {
        return Cow::Borrowed(tensors);
    }

    let by_name: HashMap<&str, &WeightTensor> = tensors.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut consumed: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        if consumed.contains(&tensor.name) {
            continue;
        }
        match fuse_group(tensor, &by_name) {
            Some((fused, parts)) => {
                consumed.extend(parts);
                out.push(fused);
            }
            None => out.push(tensor.clone()),
        }
    }
    Cow::Owned(out)
}

fn fuse_group(first: &WeightTensor, by_name: &HashMap<&str, &WeightTensor>) -> Option<(WeightTensor, Vec<String>)> {
    let rest = first.name.strip_prefix("model.layers.")?;
    let (layer, module) = rest.split_once('.')?;
    let (fused, parts) = PHI3_FUSED.iter().find(|(_, parts)| parts[0] == module)?;

    let names: Vec<String> = parts.iter().map(|p| format!("model.layers.{layer}.{p}")).collect();
    let members: Vec<&WeightTensor> = names.iter().map(|n| by_name.get(n.as_str()).copied()).collect::<Option<_>>()?;
    let cols = first.cols();
    if members.iter().any(|m| m.shape.len() != 2 || m.cols() != cols) {
        return None;
    }

    let rows = members.iter().map(|m| m.rows()).sum();
    let data = members.iter().flat_map(|m| m.data.iter().copied()).collect();
    let tensor = WeightTensor { name: format!("model.layers.{layer}.{fused}"), shape: vec![rows, cols], data };
    Some((tensor, names))
}

/// Maps a transformers-style tensor name onto the llama.cpp naming scheme.
/// Unknown names pass through unchanged.
#[must_use]
pub fn gguf_tensor_name(name: &str) -> String {
    match name {
        "model.embed_tokens.weight" => return "token_embd.weight".to_string(),
        "model.norm.weight" => return "output_norm.weight".to_string(),
        "lm_head.weight" => return "output.weight".to_string(),
        _ => {}
    }

    let Some(rest) = name.strip_prefix("model.layers.") else {
        return name.to_string();
    };
    let Some((layer, module)) = rest.split_once('.') else {
        return name.to_string();
    };
    let mapped = match module {
        "input_layernorm.weight" => "attn_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        "self_attn.q_proj.weight" => "attn_q.weight",
        "self_attn.k_proj.weight" => "attn_k.weight",
        "self_attn.v_proj.weight" => "attn_v.weight",
        "self_attn.qkv_proj.weight" => "attn_qkv.weight",
        "self_attn.o_proj.weight" => "attn_output.weight",
        "mlp.gate_proj.weight" => "ffn_gate.weight",
        "mlp.up_proj.weight" | "mlp.gate_up_proj.weight" => "ffn_up.weight",
        "mlp.down_proj.weight" => "ffn_down.weight",
        _ => return name.to_string(),
    };
    format!("blk.{layer}.{mapped}")
}
