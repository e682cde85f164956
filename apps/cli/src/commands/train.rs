//! `loka-train`: fit a QLoRA adapter on a collected dataset.

use crate::commands::CommonArgs;
use crate::config::LokaConfig;
use crate::progress::TrainingBar;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use lokallm_training::{
    QLoraTrainer, ReferenceHub, SchedulerType, Trainer, TrainingConfig, TrainingJobSpec, ValidationPolicy,
    DEFAULT_BASE_MODEL,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Train a QLoRA adapter for the complexity router
#[derive(Parser, Debug)]
#[command(name = "loka-train", version)]
pub struct TrainArgs {
    /// JSONL dataset produced by loka-collect
    #[arg(long)]
    pub dataset: PathBuf,

    /// Adapter output directory
    #[arg(long = "output_dir", alias = "output-dir")]
    pub output_dir: PathBuf,

    /// Base model id or local model directory [default: microsoft/Phi-3-mini-4k-instruct]
    #[arg(long = "base_model", alias = "base-model")]
    pub base_model: Option<String>,

    #[arg(long, default_value_t = 3)]
    pub epochs: u32,

    /// Micro batch size
    #[arg(long = "batch_size", alias = "batch-size", default_value_t = 4)]
    pub batch_size: u32,

    #[arg(long = "learning_rate", alias = "learning-rate", default_value_t = 2e-4)]
    pub learning_rate: f64,

    /// LoRA rank
    #[arg(long = "lora_r", alias = "lora-r", default_value_t = 16)]
    pub lora_r: usize,

    #[arg(long = "lora_alpha", alias = "lora-alpha", default_value_t = 16.0)]
    pub lora_alpha: f64,

    /// Gradient accumulation steps
    #[arg(long = "grad_accum", alias = "grad-accum", default_value_t = 4)]
    pub grad_accum: u32,

    /// Learning-rate schedule after warmup (constant, linear, cosine)
    #[arg(long, default_value = "constant")]
    pub scheduler: String,

    #[arg(long = "max_seq_len", alias = "max-seq-len", default_value_t = 1024)]
    pub max_seq_len: u32,

    /// Stop after this many optimizer steps
    #[arg(long = "max_steps", alias = "max-steps")]
    pub max_steps: Option<u64>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Record validation (strict, lenient)
    #[arg(long, default_value = "strict")]
    pub policy: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl TrainArgs {
    /// Builds the job from flags, falling back to configured values.
    pub fn job(&self, config: &LokaConfig) -> Result<TrainingJobSpec> {
        let section = &config.training;
        let base_model = self
            .base_model
            .clone()
            .or_else(|| section.base_model.clone())
            .unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string());

        let mut training = TrainingConfig::new(base_model);
        training.lora.r = self.lora_r;
        training.lora.alpha = self.lora_alpha;
        let hp = &mut training.hyperparams;
        hp.seed = self.seed;
        hp.epochs = self.epochs;
        hp.batch_size = self.batch_size;
        hp.learning_rate = self.learning_rate;
        hp.gradient_accumulation_steps = self.grad_accum;
        hp.scheduler = self.scheduler.parse::<SchedulerType>()?;
        hp.max_seq_len = self.max_seq_len;

        let mut job = TrainingJobSpec::new(training, self.dataset.clone(), self.output_dir.clone());
        job.validation = self.policy.parse::<ValidationPolicy>()?;
        job.resources.memory_budget_bytes = section
            .memory_budget_mb
            .map(|mb| {
                mb.checked_mul(1024 * 1024)
                    .with_context(|| format!("training.memory_budget_mb = {mb} is too large"))
            })
            .transpose()?;
        job.resources.max_seconds = section.max_seconds;
        job.resources.max_steps = self.max_steps;
        Ok(job)
    }
}

pub async fn execute(args: TrainArgs, config: &LokaConfig) -> Result<()> {
    let job = args.job(config)?;
    let trainer = Arc::new(QLoraTrainer::new(Arc::new(ReferenceHub::new())));

    let interrupt = {
        let trainer = Arc::clone(&trainer);
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(%job_id, "interrupt received, cancelling training");
                let _ = trainer.cancel(&job_id).await;
            }
        })
    };

    trainer.prepare(&job).await.context("Invalid training job")?;
    let result = trainer.run(&job, &TrainingBar::new()).await;
    interrupt.abort();
    let manifest = result.context("Training failed")?;

    println!();
    println!("{}", "Adapter training complete".bold().green());
    println!("  Job: {}", manifest.job_id.to_string().cyan());
    println!("  Adapter: {}", job.output_dir.display().to_string().cyan());
    println!("  Base model: {}", manifest.base_model);
    println!("  Examples: {}", manifest.num_examples);
    println!("  Optimizer steps: {}", manifest.metrics.optimizer_steps);
    if let Some(loss) = manifest.metrics.final_loss {
        println!("  Final loss: {loss:.4}");
    }
    println!(
        "  {}",
        format!(
            "Next: loka-export --adapter {} --base_model {} --output model.gguf",
            job.output_dir.display(),
            manifest.base_model
        )
        .dimmed()
    );
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingSection;

    fn args() -> TrainArgs {
        TrainArgs::try_parse_from(["loka-train", "--dataset", "data.jsonl", "--output_dir", "adapter"]).unwrap()
    }

    #[test]
    fn test_memory_budget_is_converted_to_bytes() {
        let config = LokaConfig {
            training: TrainingSection { memory_budget_mb: Some(2048), ..Default::default() },
            ..Default::default()
        };
        let job = args().job(&config).unwrap();
        assert_eq!(job.resources.memory_budget_bytes, Some(2048 * 1024 * 1024));
    }

    #[test]
    fn test_oversized_memory_budget_is_an_error() {
        let config = LokaConfig {
            training: TrainingSection { memory_budget_mb: Some(u64::MAX), ..Default::default() },
            ..Default::default()
        };
        let err = args().job(&config).unwrap_err();
        assert!(err.to_string().contains("memory_budget_mb"));
    }

    #[test]
    fn test_flags_override_configured_base_model() {
        let config = LokaConfig {
            training: TrainingSection { base_model: Some("acme/configured".to_string()), ..Default::default() },
            ..Default::default()
        };
        assert_eq!(args().job(&config).unwrap().config.base_model, "acme/configured");

        let flagged = TrainArgs::try_parse_from([
            "loka-train",
            "--dataset",
            "data.jsonl",
            "--output_dir",
            "adapter",
            "--base-model",
            "acme/flagged",
        ])
        .unwrap();
        assert_eq!(flagged.job(&config).unwrap().config.base_model, "acme/flagged");
    }
}
