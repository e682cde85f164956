//! LokaLLM CLI
//!
//! Shared plumbing for the `loka-collect`, `loka-train` and `loka-export`
//! binaries: configuration files, logging and terminal progress.

pub mod commands;
pub mod config;
pub mod logging;
pub mod progress;
