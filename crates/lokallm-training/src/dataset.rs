use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use tracing::warn;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

/// Structured supervision payload the model is trained to reproduce verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTarget {
    pub score: f64,
    pub reasoning: String,
}

impl ScoreTarget {
    pub fn to_json(&self) -> TrainingResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(raw: &str) -> TrainingResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| TrainingError::Dataset(format!("target is not a {{score, reasoning}} object: {e}")))
    }
}

/// One routing decision recorded as a supervised example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub instruction: String,
    pub complexity_score: f64,
    /// Opaque tier label; new tiers may appear at any time.
    pub tier: String,
    /// Serialized [`ScoreTarget`].
    pub target: String,
}

impl LabeledExample {
    pub fn new(
        instruction: impl Into<String>,
        complexity_score: f64,
        tier: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> TrainingResult<Self> {
        let target = ScoreTarget { score: complexity_score, reasoning: reasoning.into() }.to_json()?;
        Ok(Self { instruction: instruction.into(), complexity_score, tier: tier.into(), target })
    }

    pub fn parsed_target(&self) -> TrainingResult<ScoreTarget> {
        ScoreTarget::parse(&self.target)
    }
}

pub type Dataset = Vec<LabeledExample>;

/// How strictly recorded scores are checked.
///
/// Empty instructions, non-finite scores and unparseable targets are rejected
/// under every policy. `Strict` additionally rejects scores outside `[0, 1]`;
/// `Lenient` only warns about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    #[default]
    Strict,
    Lenient,
}

impl FromStr for ValidationPolicy {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(TrainingError::InvalidConfig(format!(
                "unknown validation policy `{other}` (expected strict or lenient)"
            ))),
        }
    }
}

impl std::fmt::Display for ValidationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Lenient => f.write_str("lenient"),
        }
    }
}

pub fn compute_dataset_id(examples: &[LabeledExample]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for ex in examples {
        let bytes = serde_json::to_vec(ex)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

/// Checks a single record against `policy`. The error string names the problem.
pub fn validate_example(example: &LabeledExample, policy: ValidationPolicy) -> Result<(), String> {
    if example.instruction.trim().is_empty() {
        return Err("instruction is empty".to_string());
    }
    if !example.complexity_score.is_finite() {
        return Err(format!("complexity_score is not finite ({})", example.complexity_score));
    }
    if !(0.0..=1.0).contains(&example.complexity_score) {
        match policy {
            ValidationPolicy::Strict => {
                return Err(format!("complexity_score {} is outside [0, 1]", example.complexity_score));
            }
            ValidationPolicy::Lenient => {
                warn!(score = example.complexity_score, "accepting out-of-range complexity score");
            }
        }
    }
    let target = example.parsed_target().map_err(|e| e.to_string())?;
    if !target.score.is_finite() {
        return Err("target score is not finite".to_string());
    }
    Ok(())
}

/// Validates a dataset that is about to be used for training.
pub fn validate_examples(examples: &[LabeledExample], policy: ValidationPolicy) -> TrainingResult<()> {
    if examples.is_empty() {
        return Err(TrainingError::Dataset("dataset must not be empty".to_string()));
    }
    for (idx, ex) in examples.iter().enumerate() {
        validate_example(ex, policy).map_err(|e| TrainingError::Dataset(format!("example[{idx}] {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(score: f64) -> LabeledExample {
        LabeledExample::new("What is 2+2?", score, "local", "arithmetic").unwrap()
    }

    #[test]
    fn test_validate_examples_rejects_empty() {
        let examples: Vec<LabeledExample> = vec![];
        assert!(validate_examples(&examples, ValidationPolicy::Strict).is_err());
    }

    #[test]
    fn test_target_embeds_score_and_reasoning() {
        let ex = LabeledExample::new("Hello!", 0.1, "local", "trivial greeting").unwrap();
        let target = ex.parsed_target().unwrap();
        assert_eq!(target, ScoreTarget { score: 0.1, reasoning: "trivial greeting".to_string() });
    }

    #[test]
    fn test_policy_controls_out_of_range_scores() {
        let ex = example(1.5);
        assert!(validate_example(&ex, ValidationPolicy::Strict).is_err());
        assert!(validate_example(&ex, ValidationPolicy::Lenient).is_ok());
    }

    #[test]
    fn test_non_finite_and_empty_rejected_under_any_policy() {
        let mut ex = example(0.5);
        ex.complexity_score = f64::NAN;
        assert!(validate_example(&ex, ValidationPolicy::Lenient).is_err());

        let mut ex = example(0.5);
        ex.instruction = "   ".to_string();
        assert!(validate_example(&ex, ValidationPolicy::Lenient).is_err());

        let mut ex = example(0.5);
        ex.target = "not json".to_string();
        assert!(validate_example(&ex, ValidationPolicy::Lenient).is_err());
    }

    #[test]
    fn test_unknown_tiers_are_accepted() {
        let ex = LabeledExample::new("Summarise this contract", 0.7, "edge-gpu", "long document").unwrap();
        assert!(validate_example(&ex, ValidationPolicy::Strict).is_ok());
    }

    #[test]
    fn test_compute_dataset_id_stable_for_same_content() {
        let examples = vec![example(0.2), example(0.3)];
        let id1 = compute_dataset_id(&examples).unwrap();
        let id2 = compute_dataset_id(&examples).unwrap();
        assert_eq!(id1, id2);
        assert_ne!(id1, compute_dataset_id(&examples[..1]).unwrap());
    }
}
