//! Fire records: the append-only log of fast-path decisions

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confidence::FeedbackSource;
use crate::error::{ReflexError, Result};

use super::{HeuristicId, SituationId};

pub type FireId = Uuid;

/// Resolution state of a fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOutcome {
    Pending,
    Success,
    Failure,
    /// A verdict was sought but none could be reached
    Unknown,
}

impl FireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_positive(positive: bool) -> Self {
        if positive { Self::Success } else { Self::Failure }
    }
}

impl fmt::Display for FireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FireOutcome {
    type Err = ReflexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ReflexError::InvalidArgument(format!("unknown fire outcome: {s}"))),
        }
    }
}

/// Log entry created whenever a rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireRecord {
    pub id: FireId,
    pub heuristic_id: HeuristicId,
    pub situation_id: SituationId,
    pub fired_at: DateTime<Utc>,
    pub outcome: FireOutcome,
    pub feedback_source: Option<FeedbackSource>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FireRecord {
    pub fn new(heuristic_id: HeuristicId, situation_id: SituationId) -> Self {
        Self {
            id: Uuid::now_v7(),
            heuristic_id,
            situation_id,
            fired_at: Utc::now(),
            outcome: FireOutcome::Pending,
            feedback_source: None,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.outcome == FireOutcome::Pending
    }

    /// Resolve the record; a record can only be resolved once
    pub fn resolve(&mut self, outcome: FireOutcome, source: FeedbackSource) -> Result<()> {
        if !self.is_pending() {
            return Err(ReflexError::FireAlreadyResolved(self.id));
        }
        if outcome == FireOutcome::Pending {
            return Err(ReflexError::InvalidArgument(
                "cannot resolve a fire record to pending".into(),
            ));
        }
        self.outcome = outcome;
        self.feedback_source = Some(source);
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}
