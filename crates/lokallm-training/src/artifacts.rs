use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{TrainingConfig, TrainingJobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    AdapterWeights,
    AdapterConfig,
    Tokenizer,
    TokenizerConfig,
    Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    /// Relative to the adapter directory.
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingMetrics {
    pub final_loss: Option<f64>,
    pub optimizer_steps: u64,
    pub epochs_completed: u32,
    pub trainable_parameters: u64,
    /// Parameter count of the base model.
    pub total_parameters: u64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub base_model: String,
    /// SHA-256 of the base weights the adapter was trained against.
    pub base_fingerprint: String,
    pub config: TrainingConfig,
    pub dataset_id: DatasetId,
    pub num_examples: usize,
    #[serde(default)]
    pub metrics: TrainingMetrics,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainingManifest {
    #[must_use]
    pub fn artifact(&self, kind: &ArtifactKind) -> Option<&TrainingArtifact> {
        self.artifacts.iter().find(|a| &a.kind == kind)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes `dir/relative` and records it under its relative path.
pub fn make_artifact(kind: ArtifactKind, dir: &Path, relative: impl Into<PathBuf>) -> TrainingResult<TrainingArtifact> {
    let relative = relative.into();
    let path = dir.join(&relative);
    if !path.exists() {
        return Err(TrainingError::Artifact(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path: relative, sha256: hash })
}

/// Re-hashes every recorded artifact under `dir`.
pub fn verify_artifacts(manifest: &TrainingManifest, dir: &Path) -> TrainingResult<()> {
    for artifact in &manifest.artifacts {
        let path = dir.join(&artifact.path);
        let actual = sha256_file(&path)
            .map_err(|e| TrainingError::Artifact(format!("cannot read {}: {e}", path.display())))?;
        if actual != artifact.sha256 {
            return Err(TrainingError::Artifact(format!(
                "{} does not match its recorded digest",
                artifact.path.display()
            )));
        }
    }
    Ok(())
}

pub fn read_manifest(path: &Path) -> TrainingResult<TrainingManifest> {
    let bytes = std::fs::read(path)
        .map_err(|e| TrainingError::Artifact(format!("cannot read manifest {}: {e}", path.display())))?;
    serde_json::from_slice::<TrainingManifest>(&bytes)
        .map_err(|e| TrainingError::Artifact(format!("malformed manifest {}: {e}", path.display())))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}
