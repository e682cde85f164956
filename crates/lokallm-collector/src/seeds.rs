use crate::error::{CollectError, CollectResult};
use std::path::Path;

/// Fixed prompts spanning trivial to research-grade requests.
pub const SEED_PROMPTS: [&str; 5] = [
    "What is the capital of France?",
    "Write a python script to parse Apache log files and group by status code.",
    "Can you explain the mathematical foundation of continuous diffusion models?",
    "Hello!",
    "Could you review this React code for performance bottlenecks? [code...]",
];

/// Cycles the seed prompts to exactly `samples` entries.
pub fn seed_prompts(samples: usize) -> Vec<String> {
    SEED_PROMPTS.iter().cycle().take(samples).map(|p| (*p).to_string()).collect()
}

/// Reads one prompt per non-blank line.
pub fn read_prompt_file(path: &Path) -> CollectResult<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| CollectError::Prompts { path: path.display().to_string(), source })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
