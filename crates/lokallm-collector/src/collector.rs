use crate::error::{CollectResult, ScoringError};
use crate::router::ComplexityScorer;
use lokallm_training::{validate_example, write_jsonl_dataset, Dataset, LabeledExample, ValidationPolicy};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A prompt that produced no example.
#[derive(Debug)]
pub struct ScoringFailure {
    pub index: usize,
    pub prompt: String,
    pub cause: ScoringError,
}

#[derive(Debug, Default)]
pub struct CollectionReport {
    /// Successful examples, in prompt order.
    pub dataset: Dataset,
    pub attempted: usize,
    pub failures: Vec<ScoringFailure>,
}

impl CollectionReport {
    pub fn scored(&self) -> usize {
        self.dataset.len()
    }

    pub fn dropped(&self) -> usize {
        self.failures.len()
    }
}

/// Observes a collection run. Has no influence on the result.
pub trait CollectProgress: Send + Sync {
    fn on_start(&self, _total: usize) {}

    fn on_prompt(&self, _index: usize, _succeeded: bool) {}

    fn on_finish(&self, _report: &CollectionReport) {}
}

#[derive(Debug, Default)]
pub struct NoProgress;

impl CollectProgress for NoProgress {}

/// Turns prompts into labeled examples, one routing call at a time.
#[derive(Clone)]
pub struct Collector {
    scorer: Arc<dyn ComplexityScorer>,
    policy: ValidationPolicy,
}

impl Collector {
    pub fn new(scorer: Arc<dyn ComplexityScorer>, policy: ValidationPolicy) -> Self {
        Self { scorer, policy }
    }

    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Scores one prompt and validates the resulting record.
    pub async fn score_prompt(&self, prompt: &str) -> Result<LabeledExample, ScoringError> {
        let decision = self.scorer.score(prompt).await?;
        let example = LabeledExample::new(
            prompt,
            decision.complexity_score,
            decision.routing_tier,
            decision.reasoning,
        )
        .map_err(|e| ScoringError::Malformed(e.to_string()))?;
        validate_example(&example, self.policy).map_err(ScoringError::Rejected)?;
        Ok(example)
    }

    /// Scores every prompt in order. Failures are logged and skipped.
    pub async fn collect(&self, prompts: &[String], progress: &dyn CollectProgress) -> CollectionReport {
        progress.on_start(prompts.len());
        let mut report = CollectionReport { attempted: prompts.len(), ..Default::default() };

        for (index, prompt) in prompts.iter().enumerate() {
            match self.score_prompt(prompt).await {
                Ok(example) => {
                    report.dataset.push(example);
                    progress.on_prompt(index, true);
                }
                Err(cause) => {
                    warn!(index, error = %cause, "failed to score prompt");
                    report.failures.push(ScoringFailure { index, prompt: prompt.clone(), cause });
                    progress.on_prompt(index, false);
                }
            }
        }

        info!(scored = report.scored(), requested = report.attempted, dropped = report.dropped(), "collection finished");
        progress.on_finish(&report);
        report
    }

    /// Collects and writes the dataset to `output` as JSONL.
    pub async fn collect_to_file(
        &self,
        prompts: &[String],
        output: &Path,
        progress: &dyn CollectProgress,
    ) -> CollectResult<CollectionReport> {
        let report = self.collect(prompts, progress).await;
        write_jsonl_dataset(output, &report.dataset)?;
        info!(path = %output.display(), records = report.scored(), "dataset written");
        Ok(report)
    }
}
