//! Situations, domains and match candidates

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReflexError, Result};

use super::HeuristicId;

/// Hard partition tag: a rule learned in one domain never fires in another
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(ReflexError::InvalidArgument("domain must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an incoming situation, supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SituationId(String);

impl SituationId {
    /// Generate a fresh time-ordered identifier
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SituationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SituationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SituationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Normalized runtime input matched against heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Situation {
    pub id: SituationId,
    /// Normalized description of what is happening
    pub text: String,
    pub domain: Domain,
    /// 0.0 (can wait) to 1.0 (act now)
    pub urgency: f64,
    /// Precomputed embedding of `text`; computed on demand when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Situation {
    pub fn new(text: impl Into<String>, domain: impl Into<Domain>) -> Self {
        Self {
            id: SituationId::generate(),
            text: text.into(),
            domain: domain.into(),
            urgency: 0.0,
            embedding: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<SituationId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = urgency;
        self
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Urgency clamped into [0, 1]; NaN counts as no urgency
    pub fn clamped_urgency(&self) -> f64 {
        if self.urgency.is_nan() {
            0.0
        } else {
            self.urgency.clamp(0.0, 1.0)
        }
    }
}

/// Transient match result, produced per query and never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub heuristic_id: HeuristicId,
    pub condition_text: String,
    pub action_text: String,
    pub confidence: f64,
    pub similarity: f64,
}
