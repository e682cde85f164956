use lokallm_training::TrainingError;
use std::time::Duration;
use thiserror::Error;

/// Why a single prompt could not be turned into a labeled example.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("routing service unreachable: {0}")]
    Transport(String),

    #[error("routing service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("routing service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed routing response: {0}")]
    Malformed(String),

    #[error("routing decision rejected: {0}")]
    Rejected(String),
}

pub type CollectResult<T> = std::result::Result<T, CollectError>;

/// Failures that end a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid collector config: {0}")]
    InvalidConfig(String),

    #[error("failed to read prompts from {path}: {source}")]
    Prompts {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dataset(#[from] TrainingError),
}
