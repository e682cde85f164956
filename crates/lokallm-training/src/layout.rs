use std::path::{Path, PathBuf};

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const MANIFEST_FILE: &str = "training_manifest.json";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Filesystem layout of an adapter directory.
///
/// ```text
/// <dir>/adapter_config.json
/// <dir>/adapter_model.safetensors
/// <dir>/tokenizer_config.json
/// <dir>/tokenizer.json
/// <dir>/training_manifest.json
/// <dir>/checkpoints/checkpoint-<step>/adapter_model.safetensors
/// ```
#[derive(Debug, Clone)]
pub struct AdapterLayout {
    root: PathBuf,
}

impl AdapterLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn adapter_config_path(&self) -> PathBuf {
        self.root.join(ADAPTER_CONFIG_FILE)
    }

    #[must_use]
    pub fn weights_path(&self) -> PathBuf {
        self.root.join(ADAPTER_WEIGHTS_FILE)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }

    /// Relative path of the checkpoint directory for `step`.
    #[must_use]
    pub fn checkpoint_relative(step: u64) -> PathBuf {
        Path::new(CHECKPOINTS_DIR).join(format!("checkpoint-{step}"))
    }

    #[must_use]
    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.root.join(Self::checkpoint_relative(step))
    }

    /// A directory holding a manifest is treated as a previous adapter.
    #[must_use]
    pub fn is_adapter_dir(&self) -> bool {
        self.manifest_path().is_file()
    }

    /// Sibling directory used while an adapter is being written.
    #[must_use]
    pub fn staging_for(output_dir: &Path, job_id: &str) -> PathBuf {
        Self::sibling(output_dir, "staging", job_id)
    }

    /// Sibling directory holding the previous adapter while a new one is moved into place.
    #[must_use]
    pub fn backup_for(output_dir: &Path, job_id: &str) -> PathBuf {
        Self::sibling(output_dir, "previous", job_id)
    }

    fn sibling(output_dir: &Path, role: &str, job_id: &str) -> PathBuf {
        let name = output_dir
            .file_name()
            .map_or_else(|| "adapter".to_string(), |n| n.to_string_lossy().into_owned());
        let parent = output_dir.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!(".{name}.{role}-{job_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = AdapterLayout::new("/tmp/out/adapter");
        assert!(layout.weights_path().ends_with("adapter_model.safetensors"));
        assert!(layout.checkpoint_dir(100).ends_with("checkpoints/checkpoint-100"));
        let staging = AdapterLayout::staging_for(layout.root(), "job-1");
        assert_eq!(staging, PathBuf::from("/tmp/out/.adapter.staging-job-1"));
        let backup = AdapterLayout::backup_for(layout.root(), "job-1");
        assert_eq!(backup, PathBuf::from("/tmp/out/.adapter.previous-job-1"));
    }
}
