//! Bayesian trust scores with continuous pseudo-count updates
//!
//! Every heuristic carries a Beta(alpha, beta) posterior over "this rule is
//! trustworthy". Both pseudo-counts start at 1.0 (uniform prior) and only
//! ever grow, so the posterior mean stays strictly inside (0, 1) for any
//! sequence of updates.
//!
//! Signals are weighted: a magnitude in (0, 1] is added to `alpha` for
//! positive evidence and to `beta` for negative evidence. Accumulation is
//! commutative, so concurrent updates to the same rule may land in any order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ReflexError, Result};
use crate::types::HeuristicId;

/// Pseudo-count of the uniform prior
pub const PRIOR_PSEUDO_COUNT: f64 = 1.0;

/// Beta posterior over a heuristic's trustworthiness
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for Evidence {
    fn default() -> Self {
        Self::uniform()
    }
}

impl Evidence {
    /// Uniform prior, confidence 0.5
    pub fn uniform() -> Self {
        Self {
            alpha: PRIOR_PSEUDO_COUNT,
            beta: PRIOR_PSEUDO_COUNT,
        }
    }

    /// Create evidence with explicit pseudo-counts
    ///
    /// Both counts must be finite and at least the prior pseudo-count.
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        let evidence = Self { alpha, beta };
        evidence.validate()?;
        Ok(evidence)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [("alpha", self.alpha), ("beta", self.beta)] {
            if !value.is_finite() || value < PRIOR_PSEUDO_COUNT {
                return Err(ReflexError::InvalidArgument(format!(
                    "{name} must be a finite value >= {PRIOR_PSEUDO_COUNT}, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Posterior mean `alpha / (alpha + beta)`
    pub fn confidence(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Total weight of evidence observed beyond the prior
    pub fn observed_weight(&self) -> f64 {
        self.alpha + self.beta - 2.0 * PRIOR_PSEUDO_COUNT
    }

    /// Apply a signal and return the updated evidence
    #[must_use]
    pub fn apply(self, positive: bool, magnitude: Magnitude) -> Self {
        if positive {
            Self {
                alpha: self.alpha + magnitude.get(),
                ..self
            }
        } else {
            Self {
                beta: self.beta + magnitude.get(),
                ..self
            }
        }
    }
}

/// Weight of a single confidence signal, always in (0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Magnitude(f64);

impl Magnitude {
    /// Full-weight signal used for explicit feedback
    pub const FULL: Magnitude = Magnitude(1.0);

    /// Validate a raw magnitude
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ReflexError::InvalidArgument(format!(
                "magnitude must be in (0, 1], got {value}"
            )))
        }
    }

    /// Clamp a positive weight into range, returning `None` when nothing
    /// meaningful is left.
    pub fn saturating(value: f64) -> Option<Self> {
        if value.is_finite() && value > 0.0 {
            Some(Self(value.min(1.0)))
        } else {
            None
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Magnitude {
    type Error = ReflexError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Magnitude> for f64 {
    fn from(m: Magnitude) -> Self {
        m.0
    }
}

/// Origin of a confidence signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// A person or caller said the outcome was right or wrong
    Explicit,
    /// A domain evaluator checked the outcome
    Implicit,
    /// The reasoner independently produced a similar action
    Endorsement,
}

impl FeedbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Implicit => "implicit",
            Self::Endorsement => "endorsement",
        }
    }

    /// Whether a positive signal from this source counts as an independently
    /// confirmed success. Agreement alone never does.
    pub fn confirms_correctness(&self) -> bool {
        matches!(self, Self::Explicit | Self::Implicit)
    }
}

impl fmt::Display for FeedbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackSource {
    type Err = ReflexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "explicit" => Ok(Self::Explicit),
            "implicit" => Ok(Self::Implicit),
            "endorsement" => Ok(Self::Endorsement),
            _ => Err(ReflexError::InvalidArgument(format!(
                "unknown feedback source: {s}"
            ))),
        }
    }
}

/// Ephemeral confidence update, applied once and discarded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceUpdate {
    pub heuristic_id: HeuristicId,
    pub positive: bool,
    pub magnitude: Magnitude,
    pub source: FeedbackSource,
}

impl ConfidenceUpdate {
    pub fn positive(heuristic_id: HeuristicId, magnitude: Magnitude, source: FeedbackSource) -> Self {
        Self {
            heuristic_id,
            positive: true,
            magnitude,
            source,
        }
    }

    pub fn negative(heuristic_id: HeuristicId, magnitude: Magnitude, source: FeedbackSource) -> Self {
        Self {
            heuristic_id,
            positive: false,
            magnitude,
            source,
        }
    }
}

/// Before/after view of an applied update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceChange {
    pub heuristic_id: HeuristicId,
    pub old_confidence: f64,
    pub new_confidence: f64,
}

impl ConfidenceChange {
    pub fn delta(&self) -> f64 {
        self.new_confidence - self.old_confidence
    }
}
