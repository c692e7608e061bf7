//! Heuristic types: learned condition→action rules with a trust score

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::Evidence;
use crate::error::{ReflexError, Result};

use super::Domain;

/// UUIDv7 provides time-ordered unique identifiers
pub type HeuristicId = Uuid;

/// A learned condition→action rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heuristic {
    pub id: HeuristicId,
    pub condition: String,
    pub condition_embedding: Vec<f32>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_embedding: Option<Vec<f32>>,
    pub domain: Domain,
    pub evidence: Evidence,
    pub fire_count: u64,
    pub success_count: u64,
    pub active: bool,
    pub origin: Origin,
    /// Incremented by the store on every write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Heuristic {
    /// Create an active heuristic with a uniform prior
    pub fn new(
        condition: impl Into<String>,
        condition_embedding: Vec<f32>,
        action: impl Into<String>,
        domain: impl Into<Domain>,
        origin: Origin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            condition: condition.into(),
            condition_embedding,
            action: action.into(),
            action_embedding: None,
            domain: domain.into(),
            evidence: Evidence::uniform(),
            fire_count: 0,
            success_count: 0,
            active: true,
            origin,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_action_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.action_embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    /// Bayesian trust score, always strictly between 0 and 1
    pub fn confidence(&self) -> f64 {
        self.evidence.confidence()
    }

    /// Fraction of fires independently confirmed correct
    ///
    /// Distinct from [`Heuristic::confidence`]: a widely endorsed rule can
    /// still be objectively wrong.
    pub fn success_rate(&self) -> Option<f64> {
        if self.fire_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.fire_count as f64)
        }
    }
}

/// Where a heuristic came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Extracted from the system's own experience
    Learned,
    /// Supplied by an operator
    Seeded,
    /// Loaded from another deployment
    Imported,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Learned => "learned",
            Self::Seeded => "seeded",
            Self::Imported => "imported",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ReflexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "learned" => Ok(Self::Learned),
            "seeded" => Ok(Self::Seeded),
            "imported" => Ok(Self::Imported),
            _ => Err(ReflexError::InvalidArgument(format!("unknown origin: {s}"))),
        }
    }
}

/// Input for learning a rule from text; the engine computes embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHeuristic {
    pub condition: String,
    pub action: String,
    pub domain: Domain,
    pub origin: Origin,
    /// Starting evidence; uniform prior when absent
    #[serde(default)]
    pub evidence: Option<Evidence>,
}

impl NewHeuristic {
    pub fn new(
        condition: impl Into<String>,
        action: impl Into<String>,
        domain: impl Into<Domain>,
    ) -> Self {
        Self {
            condition: condition.into(),
            action: action.into(),
            domain: domain.into(),
            origin: Origin::Learned,
            evidence: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Heuristic {
        Heuristic::new("smoke detected", vec![1.0; 4], "open window", "home", Origin::Seeded)
    }

    #[test]
    fn test_new_heuristic_has_uniform_prior() {
        let h = sample();
        assert!((h.confidence() - 0.5).abs() < 1e-12);
        assert!(h.active);
        assert_eq!(h.version, 0);
        assert_eq!(h.id.get_version_num(), 7);
    }

    #[test]
    fn test_success_rate_separate_from_confidence() {
        let mut h = sample().with_evidence(Evidence::new(9.0, 1.0).unwrap());
        assert!(h.success_rate().is_none());

        h.fire_count = 4;
        h.success_count = 1;
        assert_eq!(h.success_rate(), Some(0.25));
        assert!((h.confidence() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_origin_roundtrip() {
        for origin in [Origin::Learned, Origin::Seeded, Origin::Imported] {
            assert_eq!(origin.as_str().parse::<Origin>().unwrap(), origin);
        }
        assert!("borrowed".parse::<Origin>().is_err());
    }

    #[test]
    fn test_heuristic_serialization_skips_missing_action_embedding() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("action_embedding").is_none());
        assert_eq!(json["origin"], "seeded");
    }
}
