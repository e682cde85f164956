use crate::job::TrainingJobId;
use crate::trainer::TrainingStage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId },
    StageEntered { job_id: TrainingJobId, stage: TrainingStage },
    /// `total` is the base model's parameter count.
    Parameters { job_id: TrainingJobId, trainable: u64, total: u64 },
    Message { job_id: TrainingJobId, message: String },
    Step { job_id: TrainingJobId, step: u64, total: Option<u64>, loss: f64, learning_rate: f64 },
    Checkpoint { job_id: TrainingJobId, step: u64, path: PathBuf },
    Finished { job_id: TrainingJobId, output_dir: PathBuf },
    Failed { job_id: TrainingJobId, error: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id } => info!(%job_id, "training started"),
            ProgressEvent::StageEntered { job_id, stage } => info!(%job_id, %stage, "stage entered"),
            ProgressEvent::Parameters { job_id, trainable, total } => {
                let pct = trainable as f64 / total.max(1) as f64 * 100.0;
                info!(%job_id, trainable, total, "trainable params: {pct:.4}%");
            }
            ProgressEvent::Message { job_id, message } => info!(%job_id, "{message}"),
            ProgressEvent::Step { job_id, step, total, loss, learning_rate } => match total {
                Some(total) => info!(%job_id, loss, learning_rate, "step {step}/{total}"),
                None => info!(%job_id, loss, learning_rate, "step {step}"),
            },
            ProgressEvent::Checkpoint { job_id, step, path } => {
                info!(%job_id, step, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::Finished { job_id, output_dir } => {
                info!(%job_id, output_dir = %output_dir.display(), "training finished");
            }
            ProgressEvent::Failed { job_id, error } => error!(%job_id, "training failed: {error}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stages in the order they were entered.
    #[must_use]
    pub fn stages(&self) -> Vec<TrainingStage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StageEntered { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
