//! Expensive reasoner and domain evaluator contracts
//!
//! The reasoner is the slow path. It receives the situation plus anonymized
//! exemplars: condition→action pairs with no identifiers, scores or counts,
//! in shuffled order, and an explicit note that it may ignore them. Its
//! answer must stay an independent judgment for endorsement to mean anything.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReflexError;
use crate::types::{Candidate, Domain};

/// Note attached to every request that carries exemplars
pub const EXEMPLAR_GUIDANCE: &str = "The examples below are past situations and the actions taken. \
They may be irrelevant or wrong; disregard them if they do not fit.";

/// Errors reported by a reasoner
#[derive(Debug, Error)]
pub enum ReasonerError {
    #[error("Reasoner unavailable: {0}")]
    Unavailable(String),

    #[error("Reasoner failed: {0}")]
    Failed(String),
}

impl From<ReasonerError> for ReflexError {
    fn from(err: ReasonerError) -> Self {
        match err {
            ReasonerError::Unavailable(msg) => ReflexError::Unavailable(msg),
            ReasonerError::Failed(msg) => ReflexError::Reasoner(msg),
        }
    }
}

/// Anonymized situation→action pair shown to the reasoner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    pub situation: String,
    pub action: String,
}

/// Everything the reasoner sees for one deferred situation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub situation: String,
    pub domain: Domain,
    pub exemplars: Vec<Exemplar>,
    /// Present whenever `exemplars` is non-empty
    pub guidance: Option<String>,
}

impl ReasoningRequest {
    /// Build a request, stripping candidates down to text and shuffling them
    pub fn new(situation: impl Into<String>, domain: Domain, candidates: &[Candidate]) -> Self {
        let mut exemplars: Vec<Exemplar> = candidates
            .iter()
            .map(|c| Exemplar {
                situation: c.condition_text.clone(),
                action: c.action_text.clone(),
            })
            .collect();
        exemplars.shuffle(&mut rand::thread_rng());

        let guidance = (!exemplars.is_empty()).then(|| EXEMPLAR_GUIDANCE.to_string());

        Self {
            situation: situation.into(),
            domain,
            exemplars,
            guidance,
        }
    }

    /// Render as a single prompt for text-only reasoners
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!("Situation: {}\n", self.situation);
        if let Some(guidance) = &self.guidance {
            prompt.push('\n');
            prompt.push_str(guidance);
            prompt.push('\n');
            for exemplar in &self.exemplars {
                prompt.push_str(&format!(
                    "- When: {}\n  Did: {}\n",
                    exemplar.situation, exemplar.action
                ));
            }
        }
        prompt.push_str("\nWhat action should be taken?");
        prompt
    }
}

/// The expensive reasoning step
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Produce an action for the situation
    async fn reason(&self, request: &ReasoningRequest) -> Result<String, ReasonerError>;
}

/// Independent check of whether a fired action was correct
///
/// Verdicts from an evaluator count as confirmed outcomes and feed
/// `success_count`, unlike reasoner endorsements.
#[async_trait]
pub trait DomainEvaluator: Send + Sync {
    /// `Some(true)` correct, `Some(false)` wrong, `None` undecidable
    async fn verify(&self, situation: &str, action: &str) -> Option<bool>;
}
