use crate::artifacts::TrainingManifest;
use crate::error::TrainingResult;
use crate::job::{TrainingJobId, TrainingJobSpec};
use crate::progress::ProgressSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of one adapter-training run. Stages are entered strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingStage {
    Configured,
    WeightsLoaded,
    Quantized,
    AdapterAttached,
    DatasetLoaded,
    Training,
    Saved,
}

impl std::fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configured => "CONFIGURED",
            Self::WeightsLoaded => "WEIGHTS_LOADED",
            Self::Quantized => "QUANTIZED",
            Self::AdapterAttached => "ADAPTER_ATTACHED",
            Self::DatasetLoaded => "DATASET_LOADED",
            Self::Training => "TRAINING",
            Self::Saved => "SAVED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Running(TrainingStage),
    Finished,
    Failed(String),
    Cancelled,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    async fn prepare(&self, job: &TrainingJobSpec) -> TrainingResult<()>;

    async fn run(
        &self,
        job: &TrainingJobSpec,
        progress: &dyn ProgressSink,
    ) -> TrainingResult<TrainingManifest>;

    async fn status(&self, job_id: &TrainingJobId) -> TrainingResult<TrainerStatus>;

    async fn cancel(&self, job_id: &TrainingJobId) -> TrainingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_names() {
        assert!(TrainingStage::Configured < TrainingStage::Saved);
        assert_eq!(TrainingStage::AdapterAttached.to_string(), "ADAPTER_ATTACHED");
        let json = serde_json::to_string(&TrainingStage::WeightsLoaded).unwrap();
        assert_eq!(json, "\"WEIGHTS_LOADED\"");
    }
}
