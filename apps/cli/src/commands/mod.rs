//! Command implementations behind the `loka-*` binaries.

pub mod collect;
pub mod export;
pub mod train;

use crate::config::LokaConfig;
use crate::logging::init_logging;
use anyhow::Context;
use clap::Args;
use std::path::PathBuf;

/// Flags accepted by every binary.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Configuration file, applied over ~/.lokallm/config.toml and ./lokallm.toml
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CommonArgs {
    /// Loads configuration and installs logging. Call once, before any work.
    pub fn bootstrap(&self) -> anyhow::Result<LokaConfig> {
        let config = LokaConfig::discover_and_load(self.config.as_deref()).context("Failed to load configuration")?;
        init_logging(&config.resolve_log_level(self.log_level.as_deref()))?;
        Ok(config)
    }
}
