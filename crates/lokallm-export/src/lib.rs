//! LokaLLM Export
//!
//! Turns a trained adapter directory into a single deployable artifact:
//! - Base-model and fingerprint checks against the training manifest
//! - Adapter merge into the dequantized base weights
//! - ggml block quantization (Q4_0, Q8_0) and the GGUF v3 container
//! - Ollama Modelfile rendering with the trained chat template

pub mod error;
pub mod exporter;
pub mod gguf;
pub mod merge;
pub mod modelfile;
pub mod names;
pub mod quant;
pub mod writer;

pub use error::{ExportError, ExportResult};
pub use exporter::{ExportReport, ExportRequest, Exporter};
pub use gguf::{read_gguf_summary, write_gguf, GgufFile, GgufSummary, GgufTensor, GgufValue};
pub use merge::{merge_adapter, MergedModel};
pub use modelfile::{jinja_chat_template, render_modelfile};
pub use quant::{ExportQuantization, GgmlType};
pub use writer::{ArtifactWriter, GgufWriter, WriteSummary};
