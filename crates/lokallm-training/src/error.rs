use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("failed to load base model `{model}`: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("quantization error: {0}")]
    Quantization(String),

    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error("training job {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub(crate) fn model_load(model: &str, reason: impl Into<String>) -> Self {
        Self::ModelLoad { model: model.to_string(), reason: reason.into() }
    }
}
