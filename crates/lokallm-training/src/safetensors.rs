//! Minimal reader/writer for the safetensors layout (f32 tensors only).
//!
//! Layout: `u64` little-endian header length, a JSON header mapping tensor
//! names to `{dtype, shape, data_offsets}` (plus optional `__metadata__`),
//! then the raw little-endian tensor bytes.

use crate::error::{TrainingError, TrainingResult};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

const METADATA_KEY: &str = "__metadata__";

/// A tensor to be written: name, shape, values.
pub type TensorView<'a> = (String, Vec<usize>, &'a [f32]);

pub fn write_safetensors(
    path: &Path,
    tensors: &[TensorView<'_>],
    metadata: &BTreeMap<String, String>,
) -> TrainingResult<()> {
    let mut header = Map::new();
    if !metadata.is_empty() {
        header.insert(METADATA_KEY.to_string(), json!(metadata));
    }

    let mut offset = 0usize;
    for (name, shape, data) in tensors {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TrainingError::Artifact(format!(
                "tensor {name} has {} values but shape {shape:?}",
                data.len()
            )));
        }
        let end = offset + data.len() * 4;
        header.insert(
            name.clone(),
            json!({ "dtype": "F32", "shape": shape, "data_offsets": [offset, end] }),
        );
        offset = end;
    }

    let mut header_bytes = serde_json::to_vec(&Value::Object(header))?;
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    out.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    out.write_all(&header_bytes)?;
    for (_, _, data) in tensors {
        for v in *data {
            out.write_all(&v.to_le_bytes())?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Tensors keyed by name, each with its shape.
pub type LoadedTensors = BTreeMap<String, (Vec<usize>, Vec<f32>)>;

pub fn read_safetensors(path: &Path) -> TrainingResult<(LoadedTensors, BTreeMap<String, String>)> {
    let bytes = std::fs::read(path)?;
    let corrupt = |why: &str| TrainingError::Artifact(format!("{} is not a valid safetensors file: {why}", path.display()));

    if bytes.len() < 8 {
        return Err(corrupt("too short"));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes)).map_err(|_| corrupt("header length overflow"))?;
    let data_start = 8usize.checked_add(header_len).filter(|end| *end <= bytes.len()).ok_or_else(|| corrupt("header length out of range"))?;

    let header: Map<String, Value> = serde_json::from_slice(&bytes[8..data_start])?;
    let data = &bytes[data_start..];

    let mut metadata = BTreeMap::new();
    let mut tensors = BTreeMap::new();
    for (name, entry) in header {
        if name == METADATA_KEY {
            metadata = serde_json::from_value(entry)?;
            continue;
        }
        let dtype = entry.get("dtype").and_then(Value::as_str).unwrap_or_default();
        if dtype != "F32" {
            return Err(corrupt(&format!("tensor {name} has unsupported dtype {dtype}")));
        }
        let shape: Vec<usize> = serde_json::from_value(entry.get("shape").cloned().unwrap_or(Value::Null))?;
        let offsets: [usize; 2] = serde_json::from_value(entry.get("data_offsets").cloned().unwrap_or(Value::Null))?;
        let [start, end] = offsets;
        if start > end || end > data.len() || (end - start) != shape.iter().product::<usize>() * 4 {
            return Err(corrupt(&format!("tensor {name} has inconsistent offsets")));
        }
        let values = data[start..end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        tensors.insert(name, (shape, values));
    }

    Ok((tensors, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_is_aligned_and_readable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.safetensors");
        let a = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![-1.5f32];
        let mut meta = BTreeMap::new();
        meta.insert("base_model".to_string(), "tiny".to_string());

        write_safetensors(&path, &[("a".into(), vec![2, 3], a.as_slice()), ("b".into(), vec![1], b.as_slice())], &meta).unwrap();

        let raw = std::fs::read(&path).unwrap();
        let header_len = u64::from_le_bytes(raw[..8].try_into().unwrap());
        assert_eq!(header_len % 8, 0);

        let (tensors, metadata) = read_safetensors(&path).unwrap();
        assert_eq!(tensors["a"], (vec![2, 3], a));
        assert_eq!(tensors["b"].1, b);
        assert_eq!(metadata["base_model"], "tiny");
    }

    #[test]
    fn test_rejects_truncated_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.safetensors");
        std::fs::write(&path, [200u8, 0, 0, 0, 0, 0, 0, 0, b'{']).unwrap();
        assert!(read_safetensors(&path).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_rejected_on_write() {
        let temp = TempDir::new().unwrap();
        let data = [1.0f32; 3];
        let err = write_safetensors(&temp.path().join("x"), &[("x".into(), vec![2, 2], &data[..])], &BTreeMap::new());
        assert!(err.is_err());
    }
}
