//! Fire-or-defer decision
//!
//! Pure and deterministic: identical candidates and urgency always produce
//! the same outcome. Whether deferring is actually possible (a reasoner is
//! configured and answers in time) is decided by the caller.

use crate::config::GateConfig;
use crate::types::Candidate;

/// Outcome of gating a ranked candidate list
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Act on this rule directly
    Fire(Candidate),
    /// Ask the reasoner, showing these candidates as context
    Defer(Vec<Candidate>),
}

#[derive(Debug, Clone)]
pub struct DecisionGate {
    config: GateConfig,
    tie_epsilon: f64,
}

impl DecisionGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            tie_epsilon: 0.0,
        }
    }

    /// Width of the similarity band the ranking reorders by confidence
    #[must_use]
    pub fn with_tie_epsilon(mut self, epsilon: f64) -> Self {
        self.tie_epsilon = epsilon.max(0.0);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Confidence a rule needs to fire at this urgency
    ///
    /// Urgency is clamped to [0, 1]; NaN counts as 0.
    pub fn effective_threshold(&self, urgency: f64) -> f64 {
        let urgency = if urgency.is_nan() {
            0.0
        } else {
            urgency.clamp(0.0, 1.0)
        };
        (self.config.base_threshold - urgency * self.config.threshold_reduction)
            .clamp(self.config.min_threshold, self.config.max_threshold)
    }

    /// Decide on candidates already ranked best-first
    ///
    /// Only the similarity leader's tie band is eligible. The first
    /// candidate of that band, in ranked order, that clears both the
    /// similarity floor and the threshold fires; a confidence tie-break
    /// never pushes a qualifying leader out.
    pub fn decide(&self, candidates: Vec<Candidate>, urgency: f64) -> GateDecision {
        let threshold = self.effective_threshold(urgency);
        let Some(leader) = candidates.iter().map(|c| c.similarity).reduce(f64::max) else {
            return GateDecision::Defer(candidates);
        };

        let chosen = candidates.iter().find(|c| {
            leader - c.similarity <= self.tie_epsilon
                && c.similarity >= self.config.similarity_floor
                && c.confidence >= threshold
        });
        match chosen {
            Some(best) => GateDecision::Fire(best.clone()),
            None => GateDecision::Defer(candidates),
        }
    }
}
