use crate::dataset::ValidationPolicy;
use crate::error::{TrainingError, TrainingResult};
use crate::f16::{round_bf16, round_f16};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Base model used when the operator does not name one.
pub const DEFAULT_BASE_MODEL: &str = "microsoft/Phi-3-mini-4k-instruct";

/// Attention and feed-forward projections that receive adapters by default.
pub const DEFAULT_TARGET_MODULES: [&str; 7] =
    ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"];

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// 4-bit code book used for frozen base weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    /// NormalFloat4, information-theoretically optimal for normally distributed weights.
    #[default]
    Nf4,
    /// E2M1 floating point.
    Fp4,
}

impl FromStr for QuantType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nf4" => Ok(Self::Nf4),
            "fp4" => Ok(Self::Fp4),
            other => Err(TrainingError::InvalidConfig(format!("unknown quant type: {other}"))),
        }
    }
}

/// Precision of the activation path (weights stay 4-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDType {
    F32,
    #[default]
    F16,
    Bf16,
}

impl ComputeDType {
    /// Rounds an activation to this precision.
    #[must_use]
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::F32 => value,
            Self::F16 => round_f16(value),
            Self::Bf16 => round_bf16(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub quant_type: QuantType,
    /// Number of weights sharing one absmax scale.
    pub block_size: usize,
    /// Quantize the per-block scales themselves to 8 bits.
    pub double_quant: bool,
    pub compute_dtype: ComputeDType,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self { quant_type: QuantType::Nf4, block_size: 64, double_quant: true, compute_dtype: ComputeDType::F16 }
    }
}

impl QuantizationConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.block_size < 2 || self.block_size % 2 != 0 {
            return Err(TrainingError::InvalidConfig(format!(
                "quantization block_size must be an even number >= 2, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: DEFAULT_TARGET_MODULES.iter().map(|m| (*m).to_string()).collect(),
        }
    }
}

impl LoraConfig {
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.r == 0 {
            return Err(TrainingError::InvalidConfig("lora r must be >= 1".to_string()));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(TrainingError::InvalidConfig("lora alpha must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainingError::InvalidConfig("lora dropout must be in [0, 1)".to_string()));
        }
        if self.target_modules.is_empty() {
            return Err(TrainingError::InvalidConfig("lora target_modules must not be empty".to_string()));
        }
        if self.target_modules.iter().any(|m| m.trim().is_empty()) {
            return Err(TrainingError::InvalidConfig("lora target_modules contains an empty name".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Fixed learning rate after warmup.
    #[default]
    Constant,
    Linear,
    Cosine,
}

impl FromStr for SchedulerType {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => Err(TrainingError::InvalidConfig(format!("unknown scheduler: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingHyperParams {
    pub seed: u64,
    pub epochs: u32,
    pub learning_rate: f64,
    /// Micro batch size.
    pub batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub warmup_ratio: f64,
    pub scheduler: SchedulerType,
    pub max_grad_norm: f64,
    pub weight_decay: f64,
    pub max_seq_len: u32,
    pub logging_steps: u64,
    pub save_steps: u64,
}

impl Default for TrainingHyperParams {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 3,
            learning_rate: 2e-4,
            batch_size: 4,
            gradient_accumulation_steps: 4,
            warmup_ratio: 0.03,
            scheduler: SchedulerType::Constant,
            max_grad_norm: 0.3,
            weight_decay: 0.0,
            max_seq_len: 1024,
            logging_steps: 10,
            save_steps: 100,
        }
    }
}

impl TrainingHyperParams {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if !(self.learning_rate.is_finite()) || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainingError::InvalidConfig("gradient_accumulation_steps must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.warmup_ratio) {
            return Err(TrainingError::InvalidConfig("warmup_ratio must be in [0, 1)".to_string()));
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return Err(TrainingError::InvalidConfig("max_grad_norm must be > 0".to_string()));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainingError::InvalidConfig("weight_decay must be >= 0".to_string()));
        }
        if self.max_seq_len == 0 {
            return Err(TrainingError::InvalidConfig("max_seq_len must be >= 1".to_string()));
        }
        if self.logging_steps == 0 || self.save_steps == 0 {
            return Err(TrainingError::InvalidConfig("logging_steps and save_steps must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Immutable configuration snapshot for one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub base_model: String,
    pub quantization: QuantizationConfig,
    pub lora: LoraConfig,
    pub hyperparams: TrainingHyperParams,
}

impl TrainingConfig {
    #[must_use]
    pub fn new(base_model: impl Into<String>) -> Self {
        Self {
            base_model: base_model.into(),
            quantization: QuantizationConfig::default(),
            lora: LoraConfig::default(),
            hyperparams: TrainingHyperParams::default(),
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.base_model.trim().is_empty() {
            return Err(TrainingError::InvalidConfig("base_model is required".to_string()));
        }
        self.quantization.validate()?;
        self.lora.validate()?;
        self.hyperparams.validate()?;
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_MODEL)
    }
}

/// Compute budget for a run. Exceeding either limit aborts training.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingResources {
    pub memory_budget_bytes: Option<u64>,
    pub max_seconds: Option<u64>,
    /// Stops training after this many optimizer steps.
    pub max_steps: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub config: TrainingConfig,
    pub dataset_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default)]
    pub resources: TrainingResources,
}

impl TrainingJobSpec {
    #[must_use]
    pub fn new(config: TrainingConfig, dataset_path: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            config,
            dataset_path,
            output_dir,
            validation: ValidationPolicy::default(),
            resources: TrainingResources::default(),
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        self.config.validate()?;
        if self.output_dir.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("output_dir is required".to_string()));
        }
        if self.dataset_path.as_os_str().is_empty() {
            return Err(TrainingError::InvalidConfig("dataset path is required".to_string()));
        }
        if self.resources.max_steps == Some(0) {
            return Err(TrainingError::InvalidConfig("max_steps must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_model, DEFAULT_BASE_MODEL);
        assert_eq!(config.lora.target_modules.len(), 7);
        assert!((config.lora.scaling() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_validate_requires_base_model() {
        let config = TrainingConfig::new("  ");
        assert!(matches!(config.validate(), Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_rejects_zero_epochs_and_rank() {
        let mut config = TrainingConfig::default();
        config.hyperparams.epochs = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.lora.r = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.quantization.block_size = 63;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_and_quant_type_parse() {
        assert_eq!("Cosine".parse::<SchedulerType>().unwrap(), SchedulerType::Cosine);
        assert_eq!("nf4".parse::<QuantType>().unwrap(), QuantType::Nf4);
        assert!("exponential".parse::<SchedulerType>().is_err());
    }
}
