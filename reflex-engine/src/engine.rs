//! The `ReflexEngine` facade
//!
//! Wires store, cache, matcher, gate, limiter and bootstrap worker into one
//! decision flow: match, then fire or defer, then learn from the answer in
//! the background.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::{BootstrapEvaluator, BootstrapJob, BootstrapWorker};
use crate::cache::{CacheStats, CachedRule, FastPathCache};
use crate::confidence::{ConfidenceChange, FeedbackSource};
use crate::config::{BackendKind, ReflexConfig};
use crate::embedding::{Embedder, validate_embedding};
use crate::error::{ReflexError, Result};
use crate::gate::{DecisionGate, GateDecision};
use crate::limiter::{ConcurrencyLimiter, LimiterStats};
use crate::matching::MatchEngine;
use crate::reasoner::{DomainEvaluator, Reasoner, ReasoningRequest};
use crate::store::{
    ChangeType, ConditionStore, CozoBackend, HeuristicBackend, Invalidation, InvalidationSink,
    MemoryBackend,
};
use crate::types::{
    Candidate, Domain, FireId, FireRecord, Heuristic, HeuristicId, NewHeuristic, Situation,
};

/// Nearest rules checked for duplicates when learning
const DEDUP_SEARCH_LIMIT: usize = 5;

/// How a situation was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    /// A stored rule was trusted enough to act on
    Fired,
    /// The reasoner produced the action
    Deferred,
    /// No action: nothing fired and the reasoner could not answer
    Rejected,
}

/// Result of evaluating one situation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub path: DecisionPath,
    pub action: Option<String>,
    /// Set when a rule fired
    pub heuristic_id: Option<HeuristicId>,
    pub confidence: Option<f64>,
    /// Fire record to attach feedback to
    pub fire_id: Option<FireId>,
    /// Why nothing was done, for rejected decisions
    pub reason: Option<String>,
}

impl Decision {
    fn fired(candidate: &Candidate, fire_id: FireId) -> Self {
        Self {
            path: DecisionPath::Fired,
            action: Some(candidate.action_text.clone()),
            heuristic_id: Some(candidate.heuristic_id),
            confidence: Some(candidate.confidence),
            fire_id: Some(fire_id),
            reason: None,
        }
    }

    fn deferred(action: String) -> Self {
        Self {
            path: DecisionPath::Deferred,
            action: Some(action),
            heuristic_id: None,
            confidence: None,
            fire_id: None,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            path: DecisionPath::Rejected,
            action: None,
            heuristic_id: None,
            confidence: None,
            fire_id: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_fired(&self) -> bool {
        self.path == DecisionPath::Fired
    }
}

/// Builder for [`ReflexEngine`]
pub struct ReflexEngineBuilder {
    config: ReflexConfig,
    embedder: Arc<dyn Embedder>,
    backend: Option<Arc<dyn HeuristicBackend>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    evaluators: HashMap<Domain, Arc<dyn DomainEvaluator>>,
}

impl ReflexEngineBuilder {
    fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config: ReflexConfig::default(),
            embedder,
            backend: None,
            reasoner: None,
            evaluators: HashMap::new(),
        }
    }

    pub fn config(mut self, config: ReflexConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this backend instead of the one named in the config
    pub fn backend(mut self, backend: Arc<dyn HeuristicBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Verify fires in `domain` with this evaluator
    pub fn evaluator(mut self, domain: impl Into<Domain>, evaluator: Arc<dyn DomainEvaluator>) -> Self {
        self.evaluators.insert(domain.into(), evaluator);
        self
    }

    /// Open storage and start the bootstrap worker
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<ReflexEngine> {
        self.config.validate()?;
        let config = self.config;

        let backend: Arc<dyn HeuristicBackend> = match self.backend {
            Some(backend) => backend,
            None => match config.storage.backend {
                BackendKind::Memory => Arc::new(MemoryBackend::new()),
                BackendKind::Cozo => Arc::new(CozoBackend::open(&config.storage.path).await?),
            },
        };

        let cache = Arc::new(FastPathCache::new(
            config.cache.capacity,
            config.cache.query_capacity,
            config.cache.ttl(),
        ));
        let store = Arc::new(ConditionStore::new(backend).with_sink(cache.clone()));
        let matcher = MatchEngine::new(
            store.clone(),
            cache.clone(),
            self.embedder.clone(),
            config.matching.clone(),
        );
        let bootstrap = BootstrapWorker::spawn(Arc::new(BootstrapEvaluator::new(
            store.clone(),
            self.embedder.clone(),
            config.bootstrap.clone(),
        )));

        info!(
            backend = ?config.storage.backend,
            reasoner = self.reasoner.is_some(),
            evaluators = self.evaluators.len(),
            "reflex engine ready"
        );

        Ok(ReflexEngine {
            gate: DecisionGate::new(config.gate.clone())
                .with_tie_epsilon(config.matching.tie_epsilon),
            limiter: ConcurrencyLimiter::new(config.limiter.max_concurrent),
            store,
            cache,
            matcher,
            embedder: self.embedder,
            reasoner: self.reasoner,
            evaluators: self.evaluators,
            bootstrap,
            config,
        })
    }
}

/// Fast-path rules with a reasoner fallback
pub struct ReflexEngine {
    config: ReflexConfig,
    store: Arc<ConditionStore>,
    cache: Arc<FastPathCache>,
    matcher: MatchEngine,
    gate: DecisionGate,
    limiter: ConcurrencyLimiter,
    embedder: Arc<dyn Embedder>,
    reasoner: Option<Arc<dyn Reasoner>>,
    evaluators: HashMap<Domain, Arc<dyn DomainEvaluator>>,
    bootstrap: BootstrapWorker,
}

impl ReflexEngine {
    pub fn builder(embedder: Arc<dyn Embedder>) -> ReflexEngineBuilder {
        ReflexEngineBuilder::new(embedder)
    }

    pub fn config(&self) -> &ReflexConfig {
        &self.config
    }

    pub fn store(&self) -> &ConditionStore {
        &self.store
    }

    /// Decide what to do about a situation
    ///
    /// Store or cache outages degrade to deferring with no candidates.
    /// Malformed input (bad embedding, empty domain) is an error.
    ///
    /// Background work is queued as the last step, after the reasoner's
    /// answer is final and the returned `Decision` is fixed. The worker may
    /// start on it before the caller polls the result, but it never delays
    /// or alters the decision. Use [`ReflexEngine::wait_idle`] to observe
    /// its effect on confidence.
    #[instrument(name = "reflex::evaluate", skip(self, situation), fields(situation_id = %situation.id, domain = %situation.domain))]
    pub async fn evaluate(&self, situation: &Situation) -> Result<Decision> {
        let candidates = match self.matcher.find_candidates(situation).await {
            Ok(candidates) => candidates,
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "matching unavailable, deferring without candidates");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        match self.gate.decide(candidates, situation.clamped_urgency()) {
            GateDecision::Fire(best) => self.fire(situation, best).await,
            GateDecision::Defer(shown) => Ok(self.defer(situation, shown).await),
        }
    }

    async fn fire(&self, situation: &Situation, best: Candidate) -> Result<Decision> {
        let fire = match self
            .store
            .record_fire(best.heuristic_id, situation.id.clone())
            .await
        {
            Ok(fire) => fire,
            Err(e) => {
                // an unrecorded fire could never receive feedback
                warn!(heuristic_id = %best.heuristic_id, error = %e, "could not record fire, deferring");
                return Ok(self.defer(situation, vec![best]).await);
            }
        };

        info!(
            heuristic_id = %best.heuristic_id,
            fire_id = %fire.id,
            confidence = best.confidence,
            similarity = best.similarity,
            "fired"
        );

        if let Some(evaluator) = self.evaluators.get(&situation.domain) {
            self.bootstrap.submit(BootstrapJob::Verify {
                fire_id: fire.id,
                situation: situation.text.clone(),
                action: best.action_text.clone(),
                evaluator: evaluator.clone(),
            });
        }

        Ok(Decision::fired(&best, fire.id))
    }

    async fn defer(&self, situation: &Situation, shown: Vec<Candidate>) -> Decision {
        let Some(reasoner) = &self.reasoner else {
            debug!(candidates = shown.len(), "no reasoner configured, rejecting");
            return Decision::rejected("no reasoner configured");
        };

        let request =
            ReasoningRequest::new(situation.text.clone(), situation.domain.clone(), &shown);
        let budget = self.config.limiter.reasoner_timeout();

        let answer = match self.limiter.run(budget, reasoner.reason(&request)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                let e = ReflexError::from(e);
                warn!(error = %e, "reasoner failed, rejecting");
                return Decision::rejected(e.to_string());
            }
            Err(e) => {
                warn!(error = %e, "reasoner not reached, rejecting");
                return Decision::rejected(e.to_string());
            }
        };

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            warn!("reasoner returned an empty action, rejecting");
            return Decision::rejected("reasoner returned no action");
        }

        info!(candidates = shown.len(), "deferred to reasoner");

        if self.config.bootstrap.enabled {
            self.bootstrap.submit(BootstrapJob::Endorse {
                domain: situation.domain.clone(),
                answer: answer.clone(),
                shown,
            });
        }
        Decision::deferred(answer)
    }

    /// Attach a verdict to a fire and update the rule that fired
    pub async fn record_feedback(
        &self,
        fire_id: FireId,
        positive: bool,
        magnitude: f64,
        source: FeedbackSource,
    ) -> Result<ConfidenceChange> {
        let change = self
            .store
            .apply_outcome(fire_id, positive, magnitude, source)
            .await?;
        info!(
            fire_id = %fire_id,
            heuristic_id = %change.heuristic_id,
            positive,
            source = %source,
            confidence = change.new_confidence,
            "feedback recorded"
        );
        Ok(change)
    }

    /// Full-strength explicit feedback
    pub async fn record_explicit_feedback(
        &self,
        fire_id: FireId,
        positive: bool,
    ) -> Result<ConfidenceChange> {
        self.record_feedback(fire_id, positive, 1.0, FeedbackSource::Explicit)
            .await
    }

    /// Drop a rule from the cache as if `change` had just been written
    ///
    /// The store is only consulted for the rule's domain. When it cannot be
    /// reached the rule entry is still dropped, which already turns every
    /// cached result set that mentions the rule into a miss.
    pub async fn invalidate_cache(&self, heuristic_id: HeuristicId, change: ChangeType) -> Result<()> {
        match self.store.find(heuristic_id).await {
            Ok(Some(heuristic)) => InvalidationSink::invalidate(
                self.cache.as_ref(),
                &Invalidation {
                    heuristic_id,
                    domain: heuristic.domain,
                    change,
                },
            )?,
            Ok(None) => {
                self.cache.invalidate(heuristic_id)?;
            }
            Err(e) => {
                warn!(
                    heuristic_id = %heuristic_id,
                    error = %e,
                    "store lookup failed; dropping cached rule without its domain"
                );
                self.cache.invalidate(heuristic_id)?;
            }
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        Ok(self.cache.stats()?)
    }

    pub fn list_cached(&self) -> Result<Vec<CachedRule>> {
        Ok(self.cache.list()?)
    }

    pub fn flush_cache(&self) -> Result<()> {
        self.cache.flush()?;
        info!("fast-path cache flushed");
        Ok(())
    }

    /// Preload a domain's most trusted rules into the cache
    pub async fn warm_cache(&self, domain: &Domain) -> Result<usize> {
        domain.validate()?;
        let token = self.cache.warm_token()?;
        let rules = self
            .store
            .top_by_confidence(domain, self.config.cache.warm_limit)
            .await?;
        let loaded = self.cache.warm(token, &rules)?;
        debug!(domain = %domain, loaded, "cache warmed");
        Ok(loaded)
    }

    /// Store a new rule, or return the id of an equivalent one
    pub async fn learn(&self, new: NewHeuristic) -> Result<HeuristicId> {
        new.domain.validate()?;
        if new.condition.trim().is_empty() || new.action.trim().is_empty() {
            return Err(ReflexError::InvalidArgument(
                "condition and action must not be empty".into(),
            ));
        }

        let condition_embedding = self.embedder.embed(&new.condition).await?;
        validate_embedding(&condition_embedding)?;
        let action_embedding = self.embedder.embed(&new.action).await?;
        validate_embedding(&action_embedding)?;

        let threshold = self.config.learning.dedup_threshold;
        if let Some((existing, similarity)) = self
            .store
            .search(&condition_embedding, &new.domain, DEDUP_SEARCH_LIMIT)
            .await?
            .into_iter()
            .find(|(h, similarity)| *similarity >= threshold && h.action == new.action)
        {
            debug!(heuristic_id = %existing.id, similarity, "duplicate rule, keeping existing");
            return Ok(existing.id);
        }

        let mut heuristic = Heuristic::new(
            new.condition,
            condition_embedding,
            new.action,
            new.domain,
            new.origin,
        )
        .with_action_embedding(action_embedding);
        if let Some(evidence) = new.evidence {
            heuristic = heuristic.with_evidence(evidence);
        }
        self.store.upsert(heuristic).await
    }

    pub async fn get_heuristic(&self, id: HeuristicId) -> Result<Heuristic> {
        self.store.get(id).await
    }

    pub async fn set_active(&self, id: HeuristicId, active: bool) -> Result<Heuristic> {
        self.store.set_active(id, active).await
    }

    pub async fn delete_heuristic(&self, id: HeuristicId) -> Result<()> {
        self.store.delete(id).await
    }

    /// Most recent fires of a rule, newest first
    pub async fn fires_for(&self, id: HeuristicId, limit: usize) -> Result<Vec<FireRecord>> {
        self.store.fires_for(id, limit).await
    }

    pub fn limiter_stats(&self) -> LimiterStats {
        self.limiter.stats()
    }

    /// Resolve once all queued background learning has run
    pub async fn wait_idle(&self) {
        self.bootstrap.wait_idle().await;
    }

    /// Refuse new reasoner calls and drain the background worker
    pub async fn shutdown(&self) {
        self.limiter.close();
        self.bootstrap.shutdown().await;
        info!("reflex engine stopped");
    }
}
