use crate::error::{ExportError, ExportResult};
use crate::merge::merge_adapter;
use crate::modelfile::render_modelfile;
use crate::quant::ExportQuantization;
use crate::writer::{ArtifactWriter, GgufWriter};
use lokallm_training::artifacts::read_manifest;
use lokallm_training::{open_adapter, AdapterLayout, BaseModelSource, ChatTemplate};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub adapter_dir: PathBuf,
    pub base_model: String,
    pub output: PathBuf,
    pub quantization: ExportQuantization,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub tensor_count: usize,
    pub merged_modules: usize,
    pub quantization: ExportQuantization,
    pub template: ChatTemplate,
    /// Modelfile for serving the exported weights with Ollama.
    pub modelfile: String,
}

pub struct Exporter {
    source: Arc<dyn BaseModelSource>,
    writer: Arc<dyn ArtifactWriter>,
}

impl Exporter {
    pub fn new(source: Arc<dyn BaseModelSource>) -> Self {
        Self::with_writer(source, Arc::new(GgufWriter))
    }

    pub fn with_writer(source: Arc<dyn BaseModelSource>, writer: Arc<dyn ArtifactWriter>) -> Self {
        Self { source, writer }
    }

    /// Merges the adapter into the base weights and writes one file at
    /// `request.output`. Nothing is left at the destination on failure.
    pub fn export(&self, request: &ExportRequest) -> ExportResult<ExportReport> {
        let started = Instant::now();
        let layout = AdapterLayout::new(&request.adapter_dir);
        if !layout.is_adapter_dir() {
            return Err(ExportError::Adapter(format!(
                "{} has no training manifest",
                request.adapter_dir.display()
            )));
        }

        let manifest = read_manifest(&layout.manifest_path())?;
        if manifest.base_model != request.base_model {
            return Err(ExportError::BaseModelMismatch {
                recorded: manifest.base_model,
                supplied: request.base_model.clone(),
            });
        }

        let adapter = open_adapter(&request.adapter_dir)?;
        let base = self.source.load(&request.base_model)?;
        if base.fingerprint() != adapter.manifest.base_fingerprint {
            return Err(ExportError::FingerprintMismatch { model: request.base_model.clone() });
        }
        let template = base.chat_template;
        info!(
            adapter = %request.adapter_dir.display(),
            base_model = %request.base_model,
            layers = adapter.layers.len(),
            "merging adapter"
        );

        let merged = merge_adapter(base, &adapter)?;
        let summary = persist(&request.output, |out| self.writer.write(&merged, request.quantization, out))?;

        info!(
            path = %request.output.display(),
            bytes = summary.bytes,
            format = self.writer.format(),
            quantization = %request.quantization,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "export written"
        );
        Ok(ExportReport {
            path: request.output.clone(),
            bytes: summary.bytes,
            tensor_count: summary.tensor_count,
            merged_modules: merged.merged_modules,
            quantization: request.quantization,
            template,
            modelfile: render_modelfile(&request.output, template),
        })
    }
}

/// Writes into a temp file beside `path` and renames it into place once the
/// writer succeeds. The temp file is removed when dropped on error.
fn persist<T>(path: &Path, write: impl FnOnce(&mut dyn Write) -> ExportResult<T>) -> ExportResult<T> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let temp = NamedTempFile::new_in(&parent)?;
    let value = {
        let mut out = BufWriter::new(temp.as_file());
        let value = write(&mut out)?;
        out.flush()?;
        value
    };
    temp.as_file().sync_all()?;
    debug!(temp = %temp.path().display(), "persisting export");
    temp.persist(path).map_err(|e| ExportError::Io(e.error))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::read_gguf_summary;
    use crate::merge::MergedModel;
    use crate::quant::GgmlType;
    use crate::writer::WriteSummary;
    use lokallm_training::model::{Architecture, ModelDescriptor, MODEL_DESCRIPTOR_FILE};
    use lokallm_training::{
        write_jsonl_dataset, LabeledExample, QLoraTrainer, RecordingProgressSink, ReferenceHub, Trainer,
        TrainingConfig, TrainingJobSpec, TrainingManifest,
    };
    use tempfile::TempDir;

    fn tiny_model(root: &Path, name: &str, seed: u64) -> String {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let descriptor = ModelDescriptor {
            architecture: Architecture {
                family: "phi3".to_string(),
                hidden_size: 32,
                intermediate_size: 64,
                num_layers: 1,
            },
            chat_template: ChatTemplate::Phi3,
            seed: Some(seed),
        };
        std::fs::write(dir.join(MODEL_DESCRIPTOR_FILE), serde_json::to_vec(&descriptor).unwrap()).unwrap();
        dir.to_string_lossy().into_owned()
    }

    async fn train(root: &Path, base_model: &str) -> (PathBuf, TrainingManifest) {
        let dataset = root.join("data.jsonl");
        let records = vec![
            LabeledExample::new("Hello!", 0.1, "local", "Simple greeting").unwrap(),
            LabeledExample::new("Prove Fermat's little theorem.", 0.9, "cloud", "Formal proof").unwrap(),
        ];
        write_jsonl_dataset(&dataset, &records).unwrap();
        let mut config = TrainingConfig::new(base_model);
        config.lora.r = 4;
        config.hyperparams.epochs = 1;
        config.hyperparams.batch_size = 1;
        config.hyperparams.max_seq_len = 128;
        let output = root.join("adapter");
        let job = TrainingJobSpec::new(config, dataset, output.clone());

        let trainer = QLoraTrainer::new(Arc::new(ReferenceHub::new()));
        trainer.prepare(&job).await.unwrap();
        let manifest = trainer.run(&job, &RecordingProgressSink::default()).await.unwrap();
        (output, manifest)
    }

    fn request(adapter_dir: PathBuf, base_model: &str, output: PathBuf) -> ExportRequest {
        ExportRequest { adapter_dir, base_model: base_model.to_string(), output, quantization: ExportQuantization::Q4_0 }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    struct FailingWriter;

    impl ArtifactWriter for FailingWriter {
        fn format(&self) -> &'static str {
            "failing"
        }

        fn write(&self, _: &MergedModel, _: ExportQuantization, out: &mut dyn Write) -> ExportResult<WriteSummary> {
            out.write_all(b"partial")?;
            Err(ExportError::Format("disk quota exceeded".to_string()))
        }
    }

    #[tokio::test]
    async fn test_export_writes_one_gguf_file() {
        let temp = TempDir::new().unwrap();
        let base = tiny_model(temp.path(), "tiny", 11);
        let (adapter_dir, manifest) = train(temp.path(), &base).await;
        let dest = temp.path().join("out");
        let output = dest.join("model.bin");

        let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
        let report = exporter.export(&request(adapter_dir, &base, output.clone())).unwrap();

        assert_eq!(dir_entries(&dest), vec!["model.bin".to_string()]);
        assert_eq!(report.bytes, std::fs::metadata(&output).unwrap().len());
        assert_eq!(report.merged_modules, 7);
        assert_eq!(report.template, ChatTemplate::Phi3);
        assert!(report.modelfile.contains("<|user|>"));
        assert!(report.modelfile.contains("<|assistant|>"));

        let summary = read_gguf_summary(std::fs::File::open(&output).unwrap()).unwrap();
        assert_eq!(summary.version, 3);
        assert_eq!(summary.tensors.len(), report.tensor_count);
        assert_eq!(summary.get("general.architecture").and_then(|v| v.as_str()), Some("phi3"));
        assert_eq!(summary.get("general.file_type").and_then(|v| v.as_u64()), Some(2));
        assert!(summary.get("tokenizer.chat_template").and_then(|v| v.as_str()).unwrap().contains("<|user|>"));
        assert_eq!(
            summary.get("lokallm.adapter.job_id").and_then(|v| v.as_str()),
            Some(manifest.job_id.to_string().as_str())
        );

        let qkv = summary.tensors.iter().find(|(name, _, _)| name == "blk.0.attn_qkv.weight").unwrap();
        assert_eq!(qkv.1, vec![32, 96]);
        assert_eq!(qkv.2, GgmlType::Q4_0);
        let ffn_up = summary.tensors.iter().find(|(name, _, _)| name == "blk.0.ffn_up.weight").unwrap();
        assert_eq!(ffn_up.1, vec![32, 128]);
        assert!(!summary.tensors.iter().any(|(name, _, _)| name == "blk.0.attn_q.weight" || name == "blk.0.ffn_gate.weight"));
        assert_eq!(summary.get("tokenizer.ggml.model").and_then(|v| v.as_str()), Some("byte_level"));
        let norm = summary.tensors.iter().find(|(name, _, _)| name == "output_norm.weight").unwrap();
        assert_eq!(norm.2, GgmlType::F32);
    }

    #[tokio::test]
    async fn test_base_model_mismatch_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let base = tiny_model(temp.path(), "tiny", 11);
        let other = tiny_model(temp.path(), "other", 11);
        let (adapter_dir, _) = train(temp.path(), &base).await;
        let dest = temp.path().join("dist");

        let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
        let err = exporter.export(&request(adapter_dir, &other, dest.join("router.gguf"))).unwrap_err();

        assert!(matches!(err, ExportError::BaseModelMismatch { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_changed_base_weights_are_detected() {
        let temp = TempDir::new().unwrap();
        let base = tiny_model(temp.path(), "tiny", 11);
        let (adapter_dir, _) = train(temp.path(), &base).await;
        // Same identifier, different weights.
        tiny_model(temp.path(), "tiny", 12);
        let output = temp.path().join("router.gguf");

        let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
        let err = exporter.export(&request(adapter_dir, &base, output.clone())).unwrap_err();

        assert!(matches!(err, ExportError::FingerprintMismatch { .. }));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_tampered_adapter_is_rejected() {
        let temp = TempDir::new().unwrap();
        let base = tiny_model(temp.path(), "tiny", 11);
        let (adapter_dir, _) = train(temp.path(), &base).await;
        let weights = AdapterLayout::new(&adapter_dir).weights_path();
        let mut bytes = std::fs::read(&weights).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&weights, bytes).unwrap();

        let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
        let err = exporter.export(&request(adapter_dir, &base, temp.path().join("router.gguf"))).unwrap_err();

        assert!(matches!(err, ExportError::Training(_)));
    }

    #[test]
    fn test_missing_manifest_is_an_adapter_error() {
        let temp = TempDir::new().unwrap();
        let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
        let err = exporter
            .export(&request(temp.path().to_path_buf(), "tiny", temp.path().join("router.gguf")))
            .unwrap_err();
        assert!(matches!(err, ExportError::Adapter(_)));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        let base = tiny_model(temp.path(), "tiny", 11);
        let (adapter_dir, _) = train(temp.path(), &base).await;
        let dest = temp.path().join("dist");
        std::fs::create_dir_all(&dest).unwrap();

        let exporter = Exporter::with_writer(Arc::new(ReferenceHub::new()), Arc::new(FailingWriter));
        let err = exporter.export(&request(adapter_dir, &base, dest.join("router.gguf"))).unwrap_err();

        assert!(matches!(err, ExportError::Format(_)));
        assert!(dir_entries(&dest).is_empty());
    }
}
