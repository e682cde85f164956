//! Optional TOML configuration shared by the three binaries.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Contents of a `lokallm.toml` file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LokaConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub collector: CollectorSection,

    #[serde(default)]
    pub training: TrainingSection,

    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Validation policy (strict, lenient)
    #[serde(default)]
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
    #[serde(default)]
    pub max_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSection {
    /// Target quantization (q4_0, q8_0, f16)
    #[serde(default)]
    pub quantization: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl LokaConfig {
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// `~/.lokallm/config.toml`
    pub fn default_global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lokallm").join("config.toml"))
    }

    /// `./lokallm.toml`
    pub fn default_local_path() -> PathBuf {
        PathBuf::from("lokallm.toml")
    }

    /// Loads, in increasing precedence, the global file, the local file and
    /// `explicit`. Missing global/local files are skipped; a missing explicit
    /// file and any unparseable file are errors.
    pub fn discover_and_load(explicit: Option<&Path>) -> ConfigResult<Self> {
        let mut config = Self::default();

        let implicit = Self::default_global_path().into_iter().chain([Self::default_local_path()]);
        for path in implicit {
            match Self::load_from_file(&path) {
                Ok(found) => config.merge(&found),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(path) = explicit {
            config.merge(&Self::load_from_file(path)?);
        }

        Ok(config)
    }

    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }

        take(&mut self.log_level, &other.log_level);
        take(&mut self.collector.endpoint, &other.collector.endpoint);
        take(&mut self.collector.timeout_secs, &other.collector.timeout_secs);
        take(&mut self.collector.policy, &other.collector.policy);
        take(&mut self.training.base_model, &other.training.base_model);
        take(&mut self.training.memory_budget_mb, &other.training.memory_budget_mb);
        take(&mut self.training.max_seconds, &other.training.max_seconds);
        take(&mut self.export.quantization, &other.export.quantization);
    }

    /// Flag value, else configured value, else `info`.
    pub fn resolve_log_level(&self, flag: Option<&str>) -> String {
        flag.map(str::to_string)
            .or_else(|| self.log_level.clone())
            .unwrap_or_else(|| "info".to_string())
    }
}
