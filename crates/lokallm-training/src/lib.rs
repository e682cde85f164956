//! LokaLLM Training
//!
//! Adapter-training primitives for the complexity-router model:
//! - Labeled routing examples and their JSONL dataset format
//! - Immutable training configuration (`TrainingConfig`, `TrainingJobSpec`)
//! - 4-bit base-weight quantization and low-rank adapters
//! - The `Trainer` trait and the staged `QLoraTrainer`
//! - Adapter directories: weights, tokenizer state and manifest

pub mod adapter;
pub mod artifacts;
pub mod dataset;
pub mod error;
pub mod f16;
pub mod job;
pub mod jsonl;
pub mod layout;
pub mod lora;
pub mod model;
pub mod optim;
pub mod progress;
pub mod qlora;
pub mod quantization;
pub mod safetensors;
pub mod template;
pub mod tokenizer;
pub mod trainer;

pub use adapter::{open_adapter, AdapterConfig, LoadedAdapter};
pub use artifacts::{ArtifactKind, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use dataset::{
    compute_dataset_id, validate_example, validate_examples, Dataset, DatasetId, LabeledExample, ScoreTarget,
    ValidationPolicy,
};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    ComputeDType, LoraConfig, QuantType, QuantizationConfig, SchedulerType, TrainingConfig, TrainingHyperParams,
    TrainingJobId, TrainingJobSpec, TrainingResources, DEFAULT_BASE_MODEL, DEFAULT_TARGET_MODULES,
};
pub use jsonl::{read_jsonl_dataset, write_jsonl_dataset};
pub use layout::AdapterLayout;
pub use lora::{LoraLayer, QuantizedBase};
pub use model::{Architecture, BaseModel, BaseModelSource, ReferenceHub, WeightTensor};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use qlora::QLoraTrainer;
pub use template::ChatTemplate;
pub use trainer::{Trainer, TrainerStatus, TrainingStage};
