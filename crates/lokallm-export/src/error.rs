use lokallm_training::TrainingError;
use thiserror::Error;

pub type ExportResult<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("adapter was trained against `{recorded}` but `{supplied}` was supplied")]
    BaseModelMismatch { recorded: String, supplied: String },

    #[error("weights of `{model}` differ from the ones the adapter was trained against")]
    FingerprintMismatch { model: String },

    #[error("invalid adapter: {0}")]
    Adapter(String),

    #[error("merge failed: {0}")]
    Merge(String),

    #[error("invalid GGUF file: {0}")]
    Format(String),

    #[error("unknown quantization `{0}` (expected q4_0, q8_0 or f16)")]
    UnknownQuantization(String),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
