//! `loka-collect`: label prompts with a live routing service.

use crate::commands::CommonArgs;
use crate::config::LokaConfig;
use crate::progress::CollectBar;
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use lokallm_collector::{read_prompt_file, seed_prompts, Collector, RouterClient, DEFAULT_ROUTER_ENDPOINT};
use lokallm_training::ValidationPolicy;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Collect a labeled routing dataset by querying the router
#[derive(Parser, Debug)]
#[command(name = "loka-collect", version)]
pub struct CollectArgs {
    /// Destination JSONL dataset
    #[arg(long)]
    pub output: PathBuf,

    /// Number of seed prompts to score (ignored with --prompts)
    #[arg(long, default_value_t = 100)]
    pub samples: usize,

    /// File with one prompt per line
    #[arg(long)]
    pub prompts: Option<PathBuf>,

    /// Routing endpoint [default: http://localhost:4141/v1/route]
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Per-request timeout in seconds [default: 10]
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Record validation (strict, lenient) [default: strict]
    #[arg(long)]
    pub policy: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

pub async fn execute(args: CollectArgs, config: &LokaConfig) -> Result<()> {
    let section = &config.collector;
    let endpoint = args
        .endpoint
        .or_else(|| section.endpoint.clone())
        .unwrap_or_else(|| DEFAULT_ROUTER_ENDPOINT.to_string());
    let timeout = Duration::from_secs(args.timeout_secs.or(section.timeout_secs).unwrap_or(10));
    let policy: ValidationPolicy = match args.policy.or_else(|| section.policy.clone()) {
        Some(raw) => raw.parse()?,
        None => ValidationPolicy::default(),
    };

    let prompts = match &args.prompts {
        Some(path) => read_prompt_file(path).with_context(|| format!("Failed to read prompts from {}", path.display()))?,
        None => seed_prompts(args.samples),
    };

    let client = RouterClient::new(endpoint, timeout)?;
    info!(endpoint = client.endpoint(), prompts = prompts.len(), %policy, "collecting");
    let collector = Collector::new(Arc::new(client), policy);
    let report = collector
        .collect_to_file(&prompts, &args.output, &CollectBar::new())
        .await
        .with_context(|| format!("Failed to write dataset to {}", args.output.display()))?;

    println!();
    println!(
        "{}",
        format!("Collected {}/{} examples", report.scored(), report.attempted).bold().green()
    );
    if report.dropped() > 0 {
        println!("  {}", format!("{} prompts dropped (see log)", report.dropped()).yellow());
    }
    println!("  Dataset: {}", args.output.display().to_string().cyan());
    println!();
    Ok(())
}
