//! `loka-export`: merge an adapter and write a quantized GGUF file.

use crate::commands::CommonArgs;
use crate::config::LokaConfig;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use lokallm_export::{ExportQuantization, ExportRequest, Exporter};
use lokallm_training::{ReferenceHub, DEFAULT_BASE_MODEL};
use std::path::PathBuf;
use std::sync::Arc;

/// Merge a trained adapter into its base model and export GGUF
#[derive(Parser, Debug)]
#[command(name = "loka-export", version)]
pub struct ExportArgs {
    /// Adapter directory written by loka-train
    #[arg(long)]
    pub adapter: PathBuf,

    /// Base model the adapter was trained on [default: microsoft/Phi-3-mini-4k-instruct]
    #[arg(long = "base_model", alias = "base-model")]
    pub base_model: Option<String>,

    /// Destination GGUF file
    #[arg(long)]
    pub output: PathBuf,

    /// Target quantization (q4_0, q8_0, f16) [default: q4_0]
    #[arg(long)]
    pub quant: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl ExportArgs {
    pub fn request(&self, config: &LokaConfig) -> Result<ExportRequest> {
        let quantization = match self.quant.clone().or_else(|| config.export.quantization.clone()) {
            Some(raw) => raw.parse::<ExportQuantization>()?,
            None => ExportQuantization::default(),
        };
        let base_model = self
            .base_model
            .clone()
            .or_else(|| config.training.base_model.clone())
            .unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string());
        Ok(ExportRequest { adapter_dir: self.adapter.clone(), base_model, output: self.output.clone(), quantization })
    }
}

pub fn execute(args: &ExportArgs, config: &LokaConfig) -> Result<()> {
    let request = args.request(config)?;
    let exporter = Exporter::new(Arc::new(ReferenceHub::new()));
    let report = exporter
        .export(&request)
        .with_context(|| format!("Failed to export {}", request.adapter_dir.display()))?;

    println!();
    println!("{}", "Export complete".bold().green());
    println!("  Artifact: {}", report.path.display().to_string().cyan());
    println!(
        "  {} bytes, {} tensors, {}, {} adapters merged",
        report.bytes, report.tensor_count, report.quantization, report.merged_modules
    );
    println!("  Chat template: {}", report.template.name());
    println!();
    println!("{}", "Modelfile:".bold());
    print!("{}", report.modelfile);
    Ok(())
}
