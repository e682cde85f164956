//! LokaLLM Collector
//!
//! Builds a labeled dataset by asking a live routing service how it would
//! route each prompt and recording the answer.

pub mod collector;
pub mod error;
pub mod router;
pub mod seeds;

pub use collector::{CollectProgress, CollectionReport, Collector, NoProgress, ScoringFailure};
pub use error::{CollectError, CollectResult, ScoringError};
pub use router::{ComplexityScorer, RouterClient, RoutingDecision, DEFAULT_ROUTER_ENDPOINT, DEFAULT_TIMEOUT};
pub use seeds::{read_prompt_file, seed_prompts, SEED_PROMPTS};
