//! Candidate retrieval: cache first, store on miss
//!
//! Results are ranked by similarity. Confidence only breaks ties between
//! candidates whose similarities sit within `tie_epsilon` of each other, so
//! a trusted but less relevant rule never outranks a clearly better match.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheLookup, FastPathCache};
use crate::config::MatchingConfig;
use crate::embedding::{Embedder, validate_embedding};
use crate::error::Result;
use crate::store::{ConditionStore, to_candidate};
use crate::types::{Candidate, Situation};

/// Domain-filtered, similarity-ranked candidate retrieval
pub struct MatchEngine {
    store: Arc<ConditionStore>,
    cache: Arc<FastPathCache>,
    embedder: Arc<dyn Embedder>,
    config: MatchingConfig,
}

impl MatchEngine {
    pub fn new(
        store: Arc<ConditionStore>,
        cache: Arc<FastPathCache>,
        embedder: Arc<dyn Embedder>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            cache,
            embedder,
            config,
        }
    }

    /// Embedding of the situation, computed when not supplied
    pub async fn embed_situation(&self, situation: &Situation) -> Result<Vec<f32>> {
        let embedding = match &situation.embedding {
            Some(embedding) => embedding.clone(),
            None => self.embedder.embed(&situation.text).await?,
        };
        validate_embedding(&embedding)?;
        Ok(embedding)
    }

    /// Best candidates for a situation, at most `max_candidates`
    pub async fn find_candidates(&self, situation: &Situation) -> Result<Vec<Candidate>> {
        situation.domain.validate()?;
        let embedding = self.embed_situation(situation).await?;
        let domain = &situation.domain;

        let token = match self.cache.lookup(&embedding, domain) {
            Ok(CacheLookup::Hit(candidates)) => {
                debug!(domain = %domain, count = candidates.len(), "candidates from cache");
                return Ok(self.finish(candidates));
            }
            Ok(CacheLookup::Miss(token)) => Some(token),
            Err(e) => {
                warn!(domain = %domain, error = %e, "cache lookup failed, using store");
                None
            }
        };

        let limit = self.config.search_limit.max(self.config.max_candidates);
        let mut results = self.store.search(&embedding, domain, limit).await?;
        results.retain(|(h, _)| &h.domain == domain);

        if let Some(token) = token
            && let Err(e) = self.cache.populate(token, &results)
        {
            warn!(domain = %domain, error = %e, "cache population failed");
        }

        let candidates: Vec<Candidate> = results
            .iter()
            .map(|(h, similarity)| to_candidate(h, *similarity))
            .collect();
        debug!(domain = %domain, count = candidates.len(), "candidates from store");
        Ok(self.finish(candidates))
    }

    fn finish(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        rank_candidates(&mut candidates, self.config.tie_epsilon);
        candidates.truncate(self.config.max_candidates);
        candidates
    }
}

/// Sort by similarity descending; within each run of candidates no more
/// than `epsilon` below the run's leader, order by confidence descending.
pub fn rank_candidates(candidates: &mut [Candidate], epsilon: f64) {
    candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    let mut start = 0;
    while start < candidates.len() {
        let leader = candidates[start].similarity;
        let end = candidates[start..]
            .iter()
            .position(|c| leader - c.similarity > epsilon)
            .map_or(candidates.len(), |offset| start + offset);
        candidates[start..end].sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        start = end;
    }
}
